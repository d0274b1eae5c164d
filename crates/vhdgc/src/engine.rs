//! Per-SR entry points.
//!
//! An [`Engine`] is built once per invocation for one SR and owns the
//! capabilities every [`Sr`] it opens shares. Only one process may run
//! the GC loop of an SR at a time; that is the `running` lock, held
//! through a [`RunLock`] guard for as long as the loop runs.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info};
use vhdgc_core::lvm::vg_name;
use vhdgc_core::{
    AbortSignal, ControlPlane, Journal, LockManager, LvBackend, RefCounter, VhdBackend,
};
use vhdgc_proto::constants::LOCK_TYPE_RUNNING;
use vhdgc_proto::{GcError, GcResult, JournalKind};

use crate::abortable::AbortScope;
use crate::config::GcConfig;
use crate::driver::{FileDriver, LvhdDriver, SrDriver};
use crate::sr::Sr;
use crate::vdi::is_leaf_coalesceable;

/// Storage an SR lives on.
#[derive(Clone)]
pub enum Storage {
    /// VHD files in a directory.
    File {
        path: PathBuf,
        vhd: Arc<dyn VhdBackend>,
    },
    /// One logical volume per VDI in the SR's volume group.
    Lvhd {
        lv: Arc<dyn LvBackend>,
        vhd: Arc<dyn VhdBackend>,
        refcount: Arc<dyn RefCounter>,
    },
}

/// Capabilities shared by every SR instance of one engine.
#[derive(Clone)]
pub struct Services {
    pub control: Arc<dyn ControlPlane>,
    pub journal: Arc<dyn Journal>,
    pub locks: Arc<dyn LockManager>,
    pub abort: Arc<dyn AbortSignal>,
    pub storage: Storage,
}

/// The `running` lock of an SR, released on drop.
pub struct RunLock {
    locks: Arc<dyn LockManager>,
    sr_uuid: String,
}

impl Drop for RunLock {
    fn drop(&mut self) {
        match self.locks.release(&self.sr_uuid, LOCK_TYPE_RUNNING) {
            Ok(()) => debug!("gc: released run lock of {}", self.sr_uuid),
            Err(e) => error!("gc: failed to release run lock of {}: {}", self.sr_uuid, e),
        }
    }
}

#[derive(Clone)]
pub struct Engine {
    sr_uuid: String,
    services: Services,
    config: Arc<GcConfig>,
}

impl Engine {
    pub fn new(sr_uuid: &str, services: Services, config: Arc<GcConfig>) -> Self {
        Self {
            sr_uuid: sr_uuid.to_string(),
            services,
            config,
        }
    }

    pub fn sr_uuid(&self) -> &str {
        &self.sr_uuid
    }

    pub fn config(&self) -> &Arc<GcConfig> {
        &self.config
    }

    fn abort_scope(&self) -> AbortScope {
        AbortScope::new(
            &self.sr_uuid,
            self.services.abort.clone(),
            self.config.abort_poll_interval(),
        )
    }

    /// A fresh SR instance with an empty VDI map.
    pub fn open_sr(&self) -> Sr {
        let s = &self.services;
        let driver = match &s.storage {
            Storage::File { path, vhd } => SrDriver::File(FileDriver::new(path.clone(), vhd.clone())),
            Storage::Lvhd { lv, vhd, refcount } => SrDriver::Lvhd(LvhdDriver::new(
                &self.sr_uuid,
                &vg_name(&self.sr_uuid),
                lv.clone(),
                vhd.clone(),
                refcount.clone(),
                s.journal.clone(),
                self.abort_scope(),
            )),
        };
        Sr::new(
            &self.sr_uuid,
            driver,
            s.journal.clone(),
            s.control.clone(),
            s.locks.clone(),
            self.abort_scope(),
            self.config.clone(),
        )
    }

    // ─── Run lock ───────────────────────────────────────────────────────

    pub fn try_lock_running(&self) -> GcResult<Option<RunLock>> {
        if !self
            .services
            .locks
            .try_acquire(&self.sr_uuid, LOCK_TYPE_RUNNING)?
        {
            return Ok(None);
        }
        debug!("gc: took run lock of {}", self.sr_uuid);
        Ok(Some(RunLock {
            locks: self.services.locks.clone(),
            sr_uuid: self.sr_uuid.clone(),
        }))
    }

    /// Take the run lock, signalling a running instance to abort and
    /// waiting for it to let go.
    pub async fn abort_and_lock(&self) -> GcResult<RunLock> {
        if let Some(lock) = self.try_lock_running()? {
            return Ok(lock);
        }
        self.services.abort.set(&self.sr_uuid)?;
        info!("abort: signal sent to SR {}", self.sr_uuid);
        for _ in 0..self.config.lock_retry_attempts {
            tokio::time::sleep(self.config.lock_retry_interval()).await;
            if let Some(lock) = self.try_lock_running()? {
                self.services.abort.clear(&self.sr_uuid)?;
                return Ok(lock);
            }
        }
        // the flag never outlives this call
        self.services.abort.clear(&self.sr_uuid)?;
        Err(GcError::LockTimeout(format!(
            "GC of SR {} did not yield after abort",
            self.sr_uuid
        )))
    }

    /// Stop the running instance, if any.
    pub async fn abort(&self) -> GcResult<()> {
        let _lock = self.abort_and_lock().await?;
        info!("abort: releasing run lock of {}", self.sr_uuid);
        Ok(())
    }

    /// Whether an instance currently runs for this SR.
    pub fn get_state(&self) -> GcResult<bool> {
        Ok(self.try_lock_running()?.is_none())
    }

    // ─── GC ─────────────────────────────────────────────────────────────

    /// Collect garbage and coalesce until there is nothing left to do.
    /// Returns at once if another instance holds the run lock.
    pub async fn gc(&self, dry_run: bool) -> GcResult<()> {
        let Some(_lock) = self.try_lock_running()? else {
            info!("gc: already running on SR {}, exiting", self.sr_uuid);
            return Ok(());
        };
        info!("gc: starting on SR {} (dry run: {})", self.sr_uuid, dry_run);
        let mut sr = self.open_sr();
        let res = self.gc_loop(&mut sr, dry_run).await;
        sr.cleanup().await;
        match &res {
            Ok(()) => info!("gc: finished on SR {}", self.sr_uuid),
            Err(e) if e.is_abort() => info!("gc: aborted on SR {}", self.sr_uuid),
            Err(e) => error!("gc: SR {} failed: {}", self.sr_uuid, e),
        }
        res
    }

    async fn gc_loop(&self, sr: &mut Sr, dry_run: bool) -> GcResult<()> {
        loop {
            sr.abort.check()?;
            if !sr.is_plugged_here().await? {
                info!("gc: SR {} is not plugged here, exiting", sr.uuid);
                return Ok(());
            }
            if !sr.gc_enabled().await? {
                info!("gc: GC disabled on SR {}, exiting", sr.uuid);
                return Ok(());
            }

            sr.scan_locked(false).await?;
            if !sr.has_work().await? {
                info!("gc: no work on SR {}, exiting", sr.uuid);
                return Ok(());
            }

            sr.cleanup_coalesce_journals()?;
            if !dry_run {
                sr.update_block_info().await?;
            }

            if !sr.find_garbage()?.is_empty() {
                sr.lock().await?;
                let res = sr.garbage_collect(dry_run).await;
                sr.unlock_after(res)?;
                if !dry_run {
                    sr.update().await?;
                }
            }

            if let Some(uuid) = sr.find_coalesceable().await? {
                sr.coalesce(&uuid, dry_run).await?;
                if !dry_run {
                    sr.update().await?;
                }
            } else if let Some(uuid) = sr.find_leaf_coalesceable().await? {
                sr.coalesce_leaf(&uuid, dry_run).await?;
                if !dry_run {
                    sr.update().await?;
                }
            }

            if dry_run {
                return Ok(());
            }
        }
    }

    /// Stop any running instance, then make one garbage-collection
    /// pass. `force` accepts unreadable VDIs.
    pub async fn gc_force(&self, force: bool, dry_run: bool) -> GcResult<()> {
        let _lock = match self.try_lock_running()? {
            Some(lock) => {
                info!("gc: nothing running on SR {}, clear to proceed", self.sr_uuid);
                lock
            }
            None => self.abort_and_lock().await?,
        };
        if force {
            info!("gc: forced, continuing despite VHD errors");
        }
        let mut sr = self.open_sr();
        let res = async {
            sr.scan_locked(force).await?;
            sr.cleanup_coalesce_journals()?;
            sr.lock().await?;
            let res = sr.garbage_collect(dry_run).await;
            sr.unlock_after(res)
        }
        .await;
        sr.cleanup().await;
        res
    }

    // ─── Leaf-coalesce, atomic step ─────────────────────────────────────

    /// The merge step of a live leaf-coalesce, run while the control
    /// plane keeps `vdi` paused. A failed merge is resolved before the
    /// error is returned.
    pub async fn coalesce_leaf_atomic(&self, vdi: &str) -> GcResult<()> {
        let mut sr = self.open_sr();
        sr.lock().await?;
        let res = Self::coalesce_leaf_locked(&mut sr, vdi).await;
        sr.cleanup().await;
        sr.unlock_after(res)
    }

    async fn coalesce_leaf_locked(sr: &mut Sr, vdi: &str) -> GcResult<()> {
        sr.scan(false).await?;
        if !is_leaf_coalesceable(&sr.vdis, vdi) {
            return Err(GcError::failed(format!("VDI {} is not leaf-coalesceable", vdi)));
        }
        if let Err(e) = sr.do_coalesce_leaf(vdi).await {
            error!("leaf: atomic leaf-coalesce of {} failed: {}", vdi, e);
            if let Err(re) = sr.handle_interrupted_coalesce_leaf().await {
                error!("leaf: recovery of {} failed: {}", vdi, re);
            }
            return Err(e);
        }
        Ok(())
    }

    // ─── Advisory queries ───────────────────────────────────────────────

    /// Whether the VDI being coalesced has turned into garbage, in which
    /// case the coalesce is wasted work.
    pub async fn should_preempt(&self) -> GcResult<bool> {
        let entries = self.services.journal.get_all(JournalKind::Coalesce)?;
        let coalescing = match entries.len() {
            0 => return Ok(false),
            1 => entries.into_keys().next().unwrap_or_default(),
            n => {
                return Err(GcError::Invariant(format!(
                    "{} coalesce journal entries in SR {}",
                    n, self.sr_uuid
                )))
            }
        };
        let mut sr = self.open_sr();
        let res = async {
            sr.scan_locked(false).await?;
            sr.find_garbage()
        }
        .await;
        sr.cleanup().await;
        Ok(res?.contains(&coalescing))
    }

    /// The subset of `uuids` that is leaf-coalesceable.
    pub async fn get_coalesceable_leaves(&self, uuids: &[String]) -> GcResult<Vec<String>> {
        let mut sr = self.open_sr();
        let res = sr.scan_locked(false).await;
        sr.cleanup().await;
        res?;
        let mut leaves = Vec::new();
        for uuid in uuids {
            if sr.vdi(uuid).is_none() {
                return Err(GcError::failed(format!("VDI {} not found", uuid)));
            }
            if is_leaf_coalesceable(&sr.vdis, uuid) {
                leaves.push(uuid.clone());
            }
        }
        Ok(leaves)
    }

    /// A scanned SR for display. Unreadable VDIs are included.
    pub async fn inspect(&self) -> GcResult<Sr> {
        let mut sr = self.open_sr();
        let res = sr.scan_locked(true).await;
        sr.cleanup().await;
        res.map(|_| sr)
    }
}
