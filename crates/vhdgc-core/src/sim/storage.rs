//! Simulated VHD files and logical volumes.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bitvec::prelude::*;
use tracing::debug;
use vhdgc_proto::constants::{FILE_EXTN_VHD, VHD_BLOCK_SIZE};
use vhdgc_proto::{GcError, GcResult, VdiType};

use crate::lvm::{calc_size_lv, lv_name, parse_lv_name, LvBackend, LvVdiInfo, VgStats};
use crate::vhd::{calc_overhead_bitmap, calc_overhead_empty, uuid_from_path, VhdBackend, VhdInfo};

fn nr_blocks(size_virt: u64) -> usize {
    size_virt.div_ceil(VHD_BLOCK_SIZE) as usize
}

/// A simulated VHD image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimVhd {
    /// Parent uuid.
    pub parent: Option<String>,
    pub size_virt: u64,
    pub max_resize: u64,
    pub hidden: bool,
    /// One bit per allocated block.
    pub blocks: BitVec<u8, Msb0>,
    pub scan_error: bool,
}

impl SimVhd {
    /// An empty VHD without parent, resizable in place up to `size_virt`.
    pub fn new(size_virt: u64) -> Self {
        Self {
            parent: None,
            size_virt,
            max_resize: size_virt,
            hidden: false,
            blocks: BitVec::repeat(false, nr_blocks(size_virt)),
            scan_error: false,
        }
    }

    pub fn parent(mut self, parent: &str) -> Self {
        self.parent = Some(parent.to_string());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    /// Mark blocks as allocated.
    pub fn blocks(mut self, allocated: &[usize]) -> Self {
        for &b in allocated {
            if b < self.blocks.len() {
                self.blocks.set(b, true);
            }
        }
        self
    }

    pub fn max_resize(mut self, size: u64) -> Self {
        self.max_resize = size;
        self
    }

    pub fn data_size(&self) -> u64 {
        self.blocks.count_ones() as u64 * VHD_BLOCK_SIZE
    }

    pub fn size_phys(&self) -> u64 {
        let data = self.data_size();
        calc_overhead_empty(self.size_virt) + data + calc_overhead_bitmap(data)
    }

    fn resize(&mut self, size_virt: u64) {
        self.size_virt = size_virt;
        self.blocks.resize(nr_blocks(size_virt), false);
    }
}

/// A simulated logical volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimLv {
    pub size: u64,
    pub active: bool,
    pub readonly: bool,
    /// LV metadata hidden flag (raw volumes).
    pub hidden: bool,
    pub vdi_type: VdiType,
}

struct SimState {
    vhds: BTreeMap<PathBuf, SimVhd>,
    lvs: BTreeMap<PathBuf, SimLv>,
    free_space: u64,
    vg_size: u64,
    failing_coalesce: HashSet<String>,
    coalesce_delay: Option<Duration>,
    coalesced: Vec<String>,
    repaired: Vec<PathBuf>,
    journaled_resizes: Vec<PathBuf>,
}

/// Shared simulated storage implementing [`VhdBackend`] and [`LvBackend`].
#[derive(Clone)]
pub struct SimStorage {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn glob_match(pattern: &[u8], name: &[u8]) -> bool {
    match (pattern.first(), name.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match(&pattern[1..], name) || (!name.is_empty() && glob_match(pattern, &name[1..]))
        }
        (Some(p), Some(n)) if p == n => glob_match(&pattern[1..], &name[1..]),
        _ => false,
    }
}

fn no_vhd(path: &Path) -> GcError {
    GcError::failed(format!("no VHD at {}", path.display()))
}

fn no_lv(vg: &str, lv: &str) -> GcError {
    GcError::failed(format!("no LV {}/{}", vg, lv))
}

fn sim_lv_path(vg: &str, lv: &str) -> PathBuf {
    PathBuf::from("/dev").join(vg).join(lv)
}

impl SimState {
    /// Path of a VHD or volume named after `uuid` in the same directory as `near`.
    fn sibling(&self, near: &Path, uuid: &str) -> Option<PathBuf> {
        let dir = near.parent()?;
        [
            dir.join(format!("{}{}", uuid, FILE_EXTN_VHD)),
            dir.join(lv_name(uuid, VdiType::Vhd)),
            dir.join(lv_name(uuid, VdiType::Raw)),
        ]
        .into_iter()
        .find(|p| self.vhds.contains_key(p) || self.lvs.contains_key(p))
    }

    fn find_vhd(&self, uuid: &str) -> Option<PathBuf> {
        self.vhds
            .keys()
            .find(|p| uuid_from_path(p).as_deref() == Some(uuid))
            .cloned()
    }

    fn vhd(&self, path: &Path) -> GcResult<&SimVhd> {
        self.vhds.get(path).ok_or_else(|| no_vhd(path))
    }

    fn vhd_mut(&mut self, path: &Path) -> GcResult<&mut SimVhd> {
        self.vhds.get_mut(path).ok_or_else(|| no_vhd(path))
    }

    fn lv_mut(&mut self, vg: &str, lv: &str) -> GcResult<&mut SimLv> {
        self.lvs.get_mut(&sim_lv_path(vg, lv)).ok_or_else(|| no_lv(vg, lv))
    }
}

impl SimStorage {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                vhds: BTreeMap::new(),
                lvs: BTreeMap::new(),
                free_space: 1 << 40,
                vg_size: 1 << 40,
                failing_coalesce: HashSet::new(),
                coalesce_delay: None,
                coalesced: Vec::new(),
                repaired: Vec::new(),
                journaled_resizes: Vec::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ─── Setup and inspection ───────────────────────────────────────────

    /// Place a VHD file `<dir>/<uuid>.vhd`.
    pub fn add_file_vhd(&self, dir: &Path, uuid: &str, vhd: SimVhd) -> PathBuf {
        let path = dir.join(format!("{}{}", uuid, FILE_EXTN_VHD));
        self.state().vhds.insert(path.clone(), vhd);
        path
    }

    /// Place a VHD volume `VHD-<uuid>` of `size_lv` bytes in `vg`.
    pub fn add_lv_vhd(&self, vg: &str, uuid: &str, vhd: SimVhd, size_lv: u64) -> PathBuf {
        let path = sim_lv_path(vg, &lv_name(uuid, VdiType::Vhd));
        let mut st = self.state();
        st.lvs.insert(
            path.clone(),
            SimLv {
                size: size_lv,
                active: false,
                readonly: vhd.hidden,
                hidden: false,
                vdi_type: VdiType::Vhd,
            },
        );
        st.vhds.insert(path.clone(), vhd);
        path
    }

    /// Place a raw volume `LV-<uuid>` in `vg`.
    pub fn add_lv_raw(&self, vg: &str, uuid: &str, size: u64, hidden: bool) -> PathBuf {
        let path = sim_lv_path(vg, &lv_name(uuid, VdiType::Raw));
        self.state().lvs.insert(
            path.clone(),
            SimLv {
                size,
                active: false,
                readonly: hidden,
                hidden,
                vdi_type: VdiType::Raw,
            },
        );
        path
    }

    pub fn vhd(&self, path: &Path) -> Option<SimVhd> {
        self.state().vhds.get(path).cloned()
    }

    pub fn lv(&self, vg: &str, lv: &str) -> Option<SimLv> {
        self.state().lvs.get(&sim_lv_path(vg, lv)).copied()
    }

    /// All VHD paths, sorted.
    pub fn vhd_paths(&self) -> Vec<PathBuf> {
        self.state().vhds.keys().cloned().collect()
    }

    pub fn set_free_space(&self, bytes: u64) {
        self.state().free_space = bytes;
    }

    pub fn set_vg_size(&self, bytes: u64) {
        self.state().vg_size = bytes;
    }

    pub fn set_scan_error(&self, path: &Path, error: bool) {
        if let Some(vhd) = self.state().vhds.get_mut(path) {
            vhd.scan_error = error;
        }
    }

    /// Make every coalesce of `uuid` into its parent fail.
    pub fn fail_coalesce(&self, uuid: &str) {
        self.state().failing_coalesce.insert(uuid.to_string());
    }

    /// Make every coalesce take this long.
    pub fn set_coalesce_delay(&self, delay: Duration) {
        self.state().coalesce_delay = Some(delay);
    }

    /// Uuids of the VHDs coalesced so far, in order.
    pub fn coalesced(&self) -> Vec<String> {
        self.state().coalesced.clone()
    }

    pub fn repaired(&self) -> Vec<PathBuf> {
        self.state().repaired.clone()
    }

    /// VHDs resized through the journaled path.
    pub fn journaled_resizes(&self) -> Vec<PathBuf> {
        self.state().journaled_resizes.clone()
    }

    /// Path of the VHD named after `uuid`, in any directory.
    pub fn find_vhd_path(&self, uuid: &str) -> Option<PathBuf> {
        self.state().find_vhd(uuid)
    }

    /// Snapshot the leaf VHD `uuid`: its current image becomes the hidden
    /// base `base_uuid` and an empty child takes over the leaf's name.
    pub fn snapshot_leaf(&self, uuid: &str, base_uuid: &str) -> GcResult<()> {
        let mut st = self.state();
        let path = st
            .find_vhd(uuid)
            .ok_or_else(|| GcError::NoObject(format!("VDI {}", uuid)))?;
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let leaf = st.vhd(&path)?.clone();

        let mut base = leaf.clone();
        base.hidden = true;
        let mut child = SimVhd::new(leaf.size_virt).parent(base_uuid);
        child.max_resize = leaf.max_resize;

        let old_lv = st.lvs.remove(&path);
        let base_path = match old_lv {
            Some(lv) => {
                let base_path = dir.join(lv_name(base_uuid, VdiType::Vhd));
                st.lvs.insert(base_path.clone(), SimLv { readonly: true, ..lv });
                st.lvs.insert(
                    path.clone(),
                    SimLv {
                        size: calc_size_lv(child.size_phys()),
                        readonly: false,
                        hidden: false,
                        ..lv
                    },
                );
                base_path
            }
            None => dir.join(format!("{}{}", base_uuid, FILE_EXTN_VHD)),
        };
        st.vhds.insert(base_path, base);
        st.vhds.insert(path, child);
        debug!("sim: snapshotted {} onto base {}", uuid, base_uuid);
        Ok(())
    }
}

#[async_trait]
impl VhdBackend for SimStorage {
    fn name(&self) -> &str {
        "sim"
    }

    async fn scan(&self, dir: &Path, pattern: &str) -> GcResult<Vec<VhdInfo>> {
        let st = self.state();
        let infos = st
            .vhds
            .iter()
            .filter(|(path, _)| path.parent() == Some(dir))
            .filter(|(path, _)| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| glob_match(pattern.as_bytes(), n.as_bytes()))
            })
            .filter_map(|(path, vhd)| {
                Some(VhdInfo {
                    uuid: uuid_from_path(path)?,
                    path: path.clone(),
                    parent_uuid: vhd.parent.clone().unwrap_or_default(),
                    size_virt: vhd.size_virt,
                    size_phys: vhd.size_phys(),
                    hidden: vhd.hidden,
                    error: vhd.scan_error,
                })
            })
            .collect();
        Ok(infos)
    }

    async fn info(&self, path: &Path) -> GcResult<VhdInfo> {
        let st = self.state();
        let vhd = st.vhd(path)?;
        Ok(VhdInfo {
            uuid: uuid_from_path(path).unwrap_or_default(),
            path: path.to_path_buf(),
            parent_uuid: vhd.parent.clone().unwrap_or_default(),
            size_virt: vhd.size_virt,
            size_phys: vhd.size_phys(),
            hidden: vhd.hidden,
            error: vhd.scan_error,
        })
    }

    async fn parent(&self, path: &Path) -> GcResult<Option<String>> {
        Ok(self.state().vhd(path)?.parent.clone())
    }

    async fn set_parent(&self, path: &Path, parent: &Path, _parent_raw: bool) -> GcResult<()> {
        let parent_uuid = uuid_from_path(parent)
            .ok_or_else(|| GcError::failed(format!("bad parent path {}", parent.display())))?;
        self.state().vhd_mut(path)?.parent = Some(parent_uuid);
        Ok(())
    }

    async fn set_hidden(&self, path: &Path, hidden: bool) -> GcResult<()> {
        self.state().vhd_mut(path)?.hidden = hidden;
        Ok(())
    }

    async fn size_virt(&self, path: &Path) -> GcResult<u64> {
        Ok(self.state().vhd(path)?.size_virt)
    }

    async fn size_phys(&self, path: &Path) -> GcResult<u64> {
        Ok(self.state().vhd(path)?.size_phys())
    }

    async fn max_resize_size(&self, path: &Path) -> GcResult<u64> {
        Ok(self.state().vhd(path)?.max_resize)
    }

    async fn set_size_virt_fast(&self, path: &Path, size: u64) -> GcResult<()> {
        let mut st = self.state();
        let vhd = st.vhd_mut(path)?;
        if size > vhd.max_resize {
            return Err(GcError::failed(format!(
                "fast resize of {} to {} exceeds {}",
                path.display(),
                size,
                vhd.max_resize
            )));
        }
        vhd.resize(size);
        Ok(())
    }

    async fn set_size_virt(&self, path: &Path, size: u64, _journal: &Path) -> GcResult<()> {
        let mut st = self.state();
        let vhd = st.vhd_mut(path)?;
        vhd.resize(size);
        vhd.max_resize = vhd.max_resize.max(size);
        st.journaled_resizes.push(path.to_path_buf());
        Ok(())
    }

    async fn coalesce(&self, path: &Path) -> GcResult<()> {
        let uuid = uuid_from_path(path).unwrap_or_default();
        let delay = {
            let st = self.state();
            if st.failing_coalesce.contains(&uuid) {
                return Err(GcError::failed(format!("coalesce of {} failed", uuid)));
            }
            st.coalesce_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut st = self.state();
        let child = st.vhd(path)?.clone();
        let parent_uuid = child
            .parent
            .clone()
            .ok_or_else(|| GcError::failed(format!("{} has no parent", path.display())))?;
        let parent_path = st
            .sibling(path, &parent_uuid)
            .ok_or_else(|| GcError::failed(format!("parent {} not found", parent_uuid)))?;
        // A raw parent has no VHD metadata; data lands in the plain volume.
        if let Some(parent) = st.vhds.get_mut(&parent_path) {
            if parent.size_virt < child.size_virt {
                return Err(GcError::failed(format!(
                    "parent {} smaller than child {}",
                    parent_uuid, uuid
                )));
            }
            for block in child.blocks.iter_ones() {
                if block < parent.blocks.len() {
                    parent.blocks.set(block, true);
                }
            }
        }
        st.coalesced.push(uuid);
        Ok(())
    }

    async fn block_bitmap(&self, path: &Path) -> GcResult<Vec<u8>> {
        Ok(self.state().vhd(path)?.blocks.as_raw_slice().to_vec())
    }

    async fn check(&self, path: &Path) -> GcResult<()> {
        let st = self.state();
        let vhd = st.vhd(path)?;
        if vhd.scan_error {
            return Err(GcError::failed(format!("{} is corrupt", path.display())));
        }
        Ok(())
    }

    async fn repair(&self, path: &Path) -> GcResult<()> {
        self.state().repaired.push(path.to_path_buf());
        Ok(())
    }

    async fn destroy(&self, path: &Path) -> GcResult<()> {
        self.state().vhds.remove(path).ok_or_else(|| no_vhd(path))?;
        Ok(())
    }

    async fn free_space(&self, _dir: &Path) -> GcResult<u64> {
        Ok(self.state().free_space)
    }
}

#[async_trait]
impl LvBackend for SimStorage {
    fn name(&self) -> &str {
        "sim"
    }

    async fn refresh(&self, _vg: &str) -> GcResult<()> {
        Ok(())
    }

    async fn scan_vdis(&self, vg: &str) -> GcResult<Vec<LvVdiInfo>> {
        let st = self.state();
        let dir = PathBuf::from("/dev").join(vg);
        let mut infos = Vec::new();
        for (path, lv) in st.lvs.iter().filter(|(p, _)| p.parent() == Some(dir.as_path())) {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((uuid, vdi_type)) = parse_lv_name(name) else {
                continue;
            };
            let info = match (vdi_type, st.vhds.get(path)) {
                (VdiType::Raw, _) => LvVdiInfo {
                    uuid,
                    lv_name: name.to_string(),
                    vdi_type,
                    size_lv: lv.size,
                    size_virt: lv.size,
                    hidden: lv.hidden,
                    active: lv.active,
                    readonly: lv.readonly,
                    parent_uuid: String::new(),
                    scan_error: false,
                },
                (VdiType::Vhd, Some(vhd)) => LvVdiInfo {
                    uuid,
                    lv_name: name.to_string(),
                    vdi_type,
                    size_lv: lv.size,
                    size_virt: vhd.size_virt,
                    hidden: vhd.hidden,
                    active: lv.active,
                    readonly: lv.readonly,
                    parent_uuid: vhd.parent.clone().unwrap_or_default(),
                    scan_error: vhd.scan_error,
                },
                (VdiType::Vhd, None) => LvVdiInfo {
                    uuid,
                    lv_name: name.to_string(),
                    vdi_type,
                    size_lv: lv.size,
                    size_virt: 0,
                    hidden: false,
                    active: lv.active,
                    readonly: lv.readonly,
                    parent_uuid: String::new(),
                    scan_error: true,
                },
            };
            infos.push(info);
        }
        Ok(infos)
    }

    async fn exists(&self, vg: &str, lv: &str) -> GcResult<bool> {
        Ok(self.state().lvs.contains_key(&sim_lv_path(vg, lv)))
    }

    async fn create(&self, vg: &str, lv: &str, size: u64) -> GcResult<()> {
        let mut st = self.state();
        let path = sim_lv_path(vg, lv);
        if st.lvs.contains_key(&path) {
            return Err(GcError::failed(format!("LV {}/{} exists", vg, lv)));
        }
        st.lvs.insert(
            path,
            SimLv {
                size,
                active: true,
                readonly: false,
                hidden: false,
                vdi_type: VdiType::Raw,
            },
        );
        Ok(())
    }

    async fn remove(&self, vg: &str, lv: &str) -> GcResult<()> {
        let mut st = self.state();
        let path = sim_lv_path(vg, lv);
        st.lvs.remove(&path).ok_or_else(|| no_lv(vg, lv))?;
        st.vhds.remove(&path);
        Ok(())
    }

    async fn rename(&self, vg: &str, old: &str, new: &str) -> GcResult<()> {
        let mut st = self.state();
        let old_path = sim_lv_path(vg, old);
        let new_path = sim_lv_path(vg, new);
        if st.lvs.contains_key(&new_path) {
            return Err(GcError::failed(format!("LV {}/{} exists", vg, new)));
        }
        let lv = st.lvs.remove(&old_path).ok_or_else(|| no_lv(vg, old))?;
        st.lvs.insert(new_path.clone(), lv);
        if let Some(vhd) = st.vhds.remove(&old_path) {
            st.vhds.insert(new_path, vhd);
        }
        Ok(())
    }

    async fn size(&self, vg: &str, lv: &str) -> GcResult<u64> {
        Ok(self.state().lv_mut(vg, lv)?.size)
    }

    async fn inflate(&self, vg: &str, lv: &str, size: u64) -> GcResult<()> {
        let mut st = self.state();
        let vol = st.lv_mut(vg, lv)?;
        vol.size = vol.size.max(size);
        Ok(())
    }

    async fn deflate(&self, vg: &str, lv: &str, size: u64) -> GcResult<()> {
        let mut st = self.state();
        let path = sim_lv_path(vg, lv);
        let phys = st.vhds.get(&path).map(SimVhd::size_phys).unwrap_or(0);
        if size < phys {
            return Err(GcError::failed(format!(
                "cannot deflate {}/{} to {} below VHD size {}",
                vg, lv, size, phys
            )));
        }
        st.lv_mut(vg, lv)?.size = size;
        Ok(())
    }

    async fn activate(&self, vg: &str, lv: &str) -> GcResult<()> {
        self.state().lv_mut(vg, lv)?.active = true;
        Ok(())
    }

    async fn deactivate(&self, vg: &str, lv: &str) -> GcResult<()> {
        self.state().lv_mut(vg, lv)?.active = false;
        Ok(())
    }

    async fn set_hidden(&self, vg: &str, lv: &str, hidden: bool) -> GcResult<()> {
        self.state().lv_mut(vg, lv)?.hidden = hidden;
        Ok(())
    }

    async fn set_readonly(&self, vg: &str, lv: &str, readonly: bool) -> GcResult<()> {
        self.state().lv_mut(vg, lv)?.readonly = readonly;
        Ok(())
    }

    async fn vg_stats(&self, vg: &str) -> GcResult<VgStats> {
        let st = self.state();
        let dir = PathBuf::from("/dev").join(vg);
        let used = st
            .lvs
            .iter()
            .filter(|(p, _)| p.parent() == Some(dir.as_path()))
            .map(|(_, lv)| lv.size)
            .sum();
        Ok(VgStats {
            physical_size: st.vg_size,
            physical_utilisation: used,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_glob() {
        assert!(glob_match(b"*.vhd", b"abc.vhd"));
        assert!(!glob_match(b"*.vhd", b"abc.raw"));
        assert!(glob_match(b"VHD-*", b"VHD-x"));
        assert!(glob_match(b"*", b""));
    }

    #[tokio::test]
    async fn test_file_scan_and_coalesce() {
        let sim = SimStorage::new();
        let dir = Path::new("/sr");
        sim.add_file_vhd(dir, "root", SimVhd::new(8 * MIB).hidden().blocks(&[0]));
        let child = sim.add_file_vhd(dir, "leaf", SimVhd::new(8 * MIB).parent("root").blocks(&[1, 2]));
        sim.add_file_vhd(Path::new("/other"), "x", SimVhd::new(MIB));

        let infos = VhdBackend::scan(&sim, dir, "*.vhd").await.unwrap();
        assert_eq!(infos.len(), 2);
        let leaf = infos.iter().find(|i| i.uuid == "leaf").unwrap();
        assert_eq!(leaf.parent_uuid, "root");

        sim.coalesce(&child).await.unwrap();
        let root = sim.vhd(&dir.join("root.vhd")).unwrap();
        assert_eq!(root.blocks.count_ones(), 3);
        assert_eq!(sim.coalesced(), vec!["leaf".to_string()]);
    }

    #[tokio::test]
    async fn test_coalesce_into_smaller_parent_fails() {
        let sim = SimStorage::new();
        let dir = Path::new("/sr");
        sim.add_file_vhd(dir, "p", SimVhd::new(2 * MIB).hidden());
        let c = sim.add_file_vhd(dir, "c", SimVhd::new(8 * MIB).parent("p"));
        assert!(sim.coalesce(&c).await.is_err());
    }

    #[tokio::test]
    async fn test_lv_rename_moves_vhd() {
        let sim = SimStorage::new();
        sim.add_lv_vhd("vg", "a", SimVhd::new(4 * MIB), 8 * MIB);
        LvBackend::rename(&sim, "vg", "VHD-a", "VHD-b").await.unwrap();
        assert!(sim.vhd(Path::new("/dev/vg/VHD-a")).is_none());
        assert!(sim.vhd(Path::new("/dev/vg/VHD-b")).is_some());
        let vdis = sim.scan_vdis("vg").await.unwrap();
        assert_eq!(vdis.len(), 1);
        assert_eq!(vdis[0].uuid, "b");
    }

    #[test]
    fn test_snapshot_leaf() {
        let sim = SimStorage::new();
        let dir = Path::new("/sr");
        sim.add_file_vhd(dir, "leaf", SimVhd::new(4 * MIB).blocks(&[0, 1]));
        sim.snapshot_leaf("leaf", "base").unwrap();
        let leaf = sim.vhd(&dir.join("leaf.vhd")).unwrap();
        let base = sim.vhd(&dir.join("base.vhd")).unwrap();
        assert_eq!(leaf.parent.as_deref(), Some("base"));
        assert_eq!(leaf.blocks.count_ones(), 0);
        assert!(base.hidden);
        assert_eq!(base.blocks.count_ones(), 2);
        assert!(matches!(sim.snapshot_leaf("nope", "b2"), Err(GcError::NoObject(_))));
    }
}
