//! Shared fixtures for unit tests: an SR on simulated storage.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use vhdgc_core::ipc::MemoryAbortFlag;
use vhdgc_core::journal::MemoryJournal;
use vhdgc_core::lock::MemoryLockManager;
use vhdgc_core::lvm::{calc_size_lv, vg_name};
use vhdgc_core::refcount::MemoryRefCounter;
use vhdgc_core::sim::{SimControlPlane, SimStorage, SimVhd};
use vhdgc_core::{RefCount, RefCounter};
use vhdgc_proto::constants::NS_PREFIX_LVM;

use crate::config::GcConfig;
use crate::engine::{Engine, Services, Storage};
use crate::sr::Sr;

pub(crate) const SR_UUID: &str = "sr1";
pub(crate) const MIB: u64 = 1024 * 1024;

const FILE_SR_DIR: &str = "/sr";

/// Short retry and poll intervals so tests never sleep for long.
pub(crate) fn test_config() -> GcConfig {
    GcConfig {
        abort_poll_interval_ms: 5,
        lock_retry_interval_ms: 1,
        lock_retry_attempts: 5,
        sr_lock_retry_attempts: 5,
        scan_retry_attempts: 2,
        sr_update_poll_interval_ms: 1,
        ..GcConfig::default()
    }
}

pub(crate) struct Fixture {
    pub storage: SimStorage,
    pub control: SimControlPlane,
    pub journal: Arc<MemoryJournal>,
    pub locks: MemoryLockManager,
    pub abort: MemoryAbortFlag,
    pub refcount: MemoryRefCounter,
    pub config: GcConfig,
    lvhd: bool,
}

impl Fixture {
    fn new(lvhd: bool) -> Self {
        let storage = SimStorage::new();
        Self {
            control: SimControlPlane::new(storage.clone()),
            storage,
            journal: Arc::new(MemoryJournal::new()),
            locks: MemoryLockManager::new(),
            abort: MemoryAbortFlag::new(),
            refcount: MemoryRefCounter::new(),
            config: test_config(),
            lvhd,
        }
    }

    /// VHD files under `/sr`.
    pub fn file() -> Self {
        Self::new(false)
    }

    /// VHD volumes in the SR's volume group.
    pub fn lvhd() -> Self {
        Self::new(true)
    }

    pub fn vg(&self) -> String {
        vg_name(SR_UUID)
    }

    /// Place a VHD on storage, sized to fit on LVHD SRs.
    pub fn add(&self, uuid: &str, vhd: SimVhd) -> PathBuf {
        if self.lvhd {
            let size_lv = calc_size_lv(vhd.size_phys());
            self.storage.add_lv_vhd(&self.vg(), uuid, vhd, size_lv)
        } else {
            self.storage.add_file_vhd(Path::new(FILE_SR_DIR), uuid, vhd)
        }
    }

    pub fn refcount_of(&self, uuid: &str) -> RefCount {
        let ns = format!("{}{}", NS_PREFIX_LVM, SR_UUID);
        self.refcount.check(uuid, &ns).unwrap_or_default()
    }

    pub fn services(&self) -> Services {
        let storage = if self.lvhd {
            Storage::Lvhd {
                lv: Arc::new(self.storage.clone()),
                vhd: Arc::new(self.storage.clone()),
                refcount: Arc::new(self.refcount.clone()),
            }
        } else {
            Storage::File {
                path: PathBuf::from(FILE_SR_DIR),
                vhd: Arc::new(self.storage.clone()),
            }
        };
        Services {
            control: Arc::new(self.control.clone()),
            journal: self.journal.clone(),
            locks: Arc::new(self.locks.clone()),
            abort: Arc::new(self.abort.clone()),
            storage,
        }
    }

    pub fn engine(&self) -> Engine {
        Engine::new(SR_UUID, self.services(), Arc::new(self.config.clone()))
    }

    pub fn sr(&self) -> Sr {
        self.engine().open_sr()
    }
}
