//! One storage repository: the VDI map, its trees, and the state shared
//! by garbage collection and coalescing.
//!
//! The map is refreshed in place by [`Sr::scan`]; VDIs that are still
//! present keep their in-memory state (activation in particular). Every
//! mutation of on-storage structure that has to observe a consistent
//! tree happens under the re-entrant SR lock.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use vhdgc_core::{ControlPlane, HostRecord, Journal, LockManager, TaskStatus};
use vhdgc_proto::constants::{
    DB_COALESCE, DB_GC, DB_LEAFCLSC, DB_VHD_BLOCKS, LOCK_TYPE_SR, TMP_RENAME_PREFIX,
};
use vhdgc_proto::{ConfigNamespace, GcError, GcResult, JournalKind, LeafCoalescePolicy, VdiConfig};

use crate::abortable::AbortScope;
use crate::config::GcConfig;
use crate::driver::SrDriver;
use crate::fist::FistPoints;
use crate::tree::tree_lines;
use crate::vdi::{ancestry, decode_blocks, encode_blocks, Vdi, VdiMap};

/// Mutable access to one VDI of the map.
pub(crate) fn entry_mut<'a>(vdis: &'a mut VdiMap, uuid: &str) -> GcResult<&'a mut Vdi> {
    vdis.get_mut(uuid)
        .ok_or_else(|| GcError::Invariant(format!("VDI {} not in SR map", uuid)))
}

pub struct Sr {
    pub uuid: String,
    pub vdis: VdiMap,
    /// Roots of the VDI trees.
    pub vdi_trees: Vec<String>,
    pub(crate) driver: SrDriver,
    pub(crate) journal: Arc<dyn Journal>,
    pub(crate) control: Arc<dyn ControlPlane>,
    pub(crate) locks: Arc<dyn LockManager>,
    pub(crate) abort: AbortScope,
    pub(crate) config: Arc<GcConfig>,
    pub(crate) fist: FistPoints,
    /// Candidates that failed during this process; never retried.
    pub failed_coalesce_targets: HashSet<String>,
    lock_count: u32,
}

impl Sr {
    pub fn new(
        uuid: &str,
        driver: SrDriver,
        journal: Arc<dyn Journal>,
        control: Arc<dyn ControlPlane>,
        locks: Arc<dyn LockManager>,
        abort: AbortScope,
        config: Arc<GcConfig>,
    ) -> Self {
        let fist = FistPoints::new(config.fist_points.iter().cloned());
        Self {
            uuid: uuid.to_string(),
            vdis: VdiMap::new(),
            vdi_trees: Vec::new(),
            driver,
            journal,
            control,
            locks,
            abort,
            config,
            fist,
            failed_coalesce_targets: HashSet::new(),
            lock_count: 0,
        }
    }

    pub fn driver(&self) -> &SrDriver {
        &self.driver
    }

    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.journal
    }

    pub fn vdi(&self, uuid: &str) -> Option<&Vdi> {
        self.vdis.get(uuid)
    }

    pub(crate) fn vdi_ref(&self, uuid: &str) -> GcResult<&Vdi> {
        self.vdis
            .get(uuid)
            .ok_or_else(|| GcError::Invariant(format!("VDI {} not in SR map", uuid)))
    }

    pub(crate) fn parent_of(&self, uuid: &str) -> GcResult<String> {
        self.vdi_ref(uuid)?
            .parent
            .clone()
            .ok_or_else(|| GcError::Invariant(format!("VDI {} has no parent", uuid)))
    }

    // ─── SR lock ────────────────────────────────────────────────────────

    /// Take the SR lock, nesting if this instance already holds it.
    pub async fn lock(&mut self) -> GcResult<()> {
        if self.lock_count == 0 {
            let mut attempts = 0;
            loop {
                if self.locks.try_acquire(&self.uuid, LOCK_TYPE_SR)? {
                    break;
                }
                attempts += 1;
                if attempts >= self.config.sr_lock_retry_attempts {
                    return Err(GcError::LockTimeout(format!("SR lock of {}", self.uuid)));
                }
                self.abort.check()?;
                tokio::time::sleep(self.config.lock_retry_interval()).await;
            }
            debug!("sr: locked {}", self.uuid);
        }
        self.lock_count += 1;
        Ok(())
    }

    pub fn unlock(&mut self) -> GcResult<()> {
        if self.lock_count == 0 {
            return Err(GcError::Invariant(format!("SR lock of {} not held", self.uuid)));
        }
        self.lock_count -= 1;
        if self.lock_count == 0 {
            self.locks.release(&self.uuid, LOCK_TYPE_SR)?;
            debug!("sr: unlocked {}", self.uuid);
        }
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.lock_count > 0
    }

    /// Release the lock after `res` was computed under it. An unlock
    /// failure only surfaces when `res` itself succeeded.
    pub(crate) fn unlock_after<T>(&mut self, res: GcResult<T>) -> GcResult<T> {
        match self.unlock() {
            Ok(()) => res,
            Err(e) => {
                error!("sr: failed to unlock {}: {}", self.uuid, e);
                res.and(Err(e))
            }
        }
    }

    // ─── Scanning ───────────────────────────────────────────────────────

    /// Refresh the VDI map and trees from storage. LVHD SRs then resolve
    /// interrupted leaf-coalesce operations and rescan if any were found.
    pub async fn scan(&mut self, force: bool) -> GcResult<()> {
        self.scan_storage(force).await?;
        if self.driver.is_lvhd() && self.handle_interrupted_coalesce_leaf().await? {
            self.scan_storage(force).await?;
        }
        if tracing::enabled!(tracing::Level::DEBUG) {
            self.print_vdis();
        }
        Ok(())
    }

    pub async fn scan_locked(&mut self, force: bool) -> GcResult<()> {
        self.lock().await?;
        let res = self.scan(force).await;
        self.unlock_after(res)
    }

    async fn scan_storage(&mut self, force: bool) -> GcResult<()> {
        let mut attempts = 0;
        let found = loop {
            attempts += 1;
            let found = self.driver.backend().scan_once().await?;
            let bad: Vec<&str> = found
                .iter()
                .filter(|v| v.scan_error)
                .map(|v| v.uuid.as_str())
                .collect();
            if bad.is_empty() {
                break found;
            }
            if attempts < self.config.scan_retry_attempts {
                warn!(
                    "scan: {} unreadable VDIs in {}, rescanning (attempt {})",
                    bad.len(),
                    self.uuid,
                    attempts
                );
                continue;
            }
            if force {
                for uuid in &bad {
                    error!("scan: accepting unreadable VDI {} (forced)", uuid);
                }
                break found;
            }
            return Err(GcError::ScanFailed(format!(
                "unreadable VDIs in {} after {} attempts: {}",
                self.uuid,
                attempts,
                bad.join(", ")
            )));
        };
        self.load_vdis(found);
        self.build_tree(force)
    }

    fn load_vdis(&mut self, found: Vec<Vdi>) {
        let seen: HashSet<String> = found.iter().map(|v| v.uuid.clone()).collect();
        for fresh in found {
            match self.vdis.get_mut(&fresh.uuid) {
                Some(vdi) => vdi.load(fresh),
                None => {
                    self.vdis.insert(fresh.uuid.clone(), fresh);
                }
            }
        }
        self.vdis.retain(|uuid, _| {
            let keep = seen.contains(uuid);
            if !keep {
                debug!("scan: VDI {} is gone", uuid);
            }
            keep
        });
    }

    fn build_tree(&mut self, force: bool) -> GcResult<()> {
        // A scan that fails here leaves no trees and no links.
        let mut trees = Vec::new();
        let mut links = Vec::new();
        let mut missing = None;
        for vdi in self.vdis.values() {
            let (uuid, parent_uuid) = (&vdi.uuid, &vdi.parent_uuid);
            if parent_uuid.is_empty() {
                trees.push(uuid.clone());
                continue;
            }
            if self.vdis.contains_key(parent_uuid) {
                links.push((uuid.clone(), parent_uuid.clone()));
                continue;
            }
            if uuid.starts_with(TMP_RENAME_PREFIX) {
                debug!("scan: {} is mid-rename, parent {} gone", uuid, parent_uuid);
            } else if force {
                error!("scan: parent {} of {} not found (forced)", parent_uuid, uuid);
            } else {
                missing = Some(format!("parent {} of VDI {} not found", parent_uuid, uuid));
                break;
            }
            trees.push(uuid.clone());
        }

        self.vdi_trees.clear();
        for vdi in self.vdis.values_mut() {
            vdi.parent = None;
            vdi.children.clear();
        }
        if let Some(msg) = missing {
            return Err(GcError::ScanFailed(msg));
        }
        for (uuid, parent_uuid) in links {
            entry_mut(&mut self.vdis, &parent_uuid)?.children.push(uuid.clone());
            entry_mut(&mut self.vdis, &uuid)?.parent = Some(parent_uuid);
        }
        self.vdi_trees = trees;
        Ok(())
    }

    // ─── Map surgery ────────────────────────────────────────────────────

    /// Unlink a childless VDI from the map and trees.
    pub(crate) fn remove_from_map(&mut self, uuid: &str) -> GcResult<Vdi> {
        let vdi = self
            .vdis
            .remove(uuid)
            .ok_or_else(|| GcError::Invariant(format!("VDI {} not in SR map", uuid)))?;
        if let Some(parent) = vdi.parent.as_ref().and_then(|p| self.vdis.get_mut(p)) {
            parent.children.retain(|c| c != uuid);
        }
        self.vdi_trees.retain(|r| r != uuid);
        Ok(vdi)
    }

    /// Rename a VDI's volume and re-key it in the map, fixing up links.
    pub(crate) async fn rename_vdi(&mut self, old_uuid: &str, new_uuid: &str) -> GcResult<()> {
        let lvhd = self
            .driver
            .lvhd()
            .ok_or_else(|| GcError::Invariant("rename needs an LVHD SR".into()))?;
        let mut vdi = self
            .vdis
            .remove(old_uuid)
            .ok_or_else(|| GcError::Invariant(format!("VDI {} not in SR map", old_uuid)))?;
        if let Err(e) = lvhd.rename(&mut vdi, new_uuid).await {
            self.vdis.insert(old_uuid.to_string(), vdi);
            return Err(e);
        }
        if let Some(parent) = vdi.parent.as_ref().and_then(|p| self.vdis.get_mut(p)) {
            for child in parent.children.iter_mut().filter(|c| *c == old_uuid) {
                *child = new_uuid.to_string();
            }
        }
        for child in &vdi.children {
            if let Some(c) = self.vdis.get_mut(child) {
                c.parent = Some(new_uuid.to_string());
                c.parent_uuid = new_uuid.to_string();
            }
        }
        for root in self.vdi_trees.iter_mut().filter(|r| *r == old_uuid) {
            *root = new_uuid.to_string();
        }
        self.vdis.insert(new_uuid.to_string(), vdi);
        Ok(())
    }

    // ─── Storage queries ────────────────────────────────────────────────

    pub async fn free_space(&self) -> GcResult<u64> {
        self.driver.backend().free_space().await
    }

    /// Physical VHD size, read from storage once and cached.
    pub async fn size_vhd(&mut self, uuid: &str) -> GcResult<u64> {
        if let Some(size) = self.vdi_ref(uuid)?.size_vhd {
            return Ok(size);
        }
        self.activate(uuid).await?;
        let vdi = entry_mut(&mut self.vdis, uuid)?;
        let size = self.driver.backend().size_vhd(vdi).await?;
        vdi.size_vhd = Some(size);
        Ok(size)
    }

    /// Re-read the physical size, dropping the cached value.
    pub async fn reload_size_vhd(&mut self, uuid: &str) -> GcResult<u64> {
        entry_mut(&mut self.vdis, uuid)?.size_vhd = None;
        self.size_vhd(uuid).await
    }

    /// Activate the VDI's volume (LVHD only).
    pub async fn activate(&mut self, uuid: &str) -> GcResult<()> {
        if let Some(lvhd) = self.driver.lvhd() {
            let vdi = entry_mut(&mut self.vdis, uuid)?;
            lvhd.activate(vdi).await?;
        }
        Ok(())
    }

    /// Activate the VDI and all its ancestors.
    pub async fn activate_chain(&mut self, uuid: &str) -> GcResult<()> {
        for u in ancestry(&self.vdis, uuid) {
            self.activate(&u).await?;
        }
        Ok(())
    }

    pub async fn set_hidden(&mut self, uuid: &str, hidden: bool) -> GcResult<()> {
        if self.vdi_ref(uuid)?.hidden == hidden {
            return Ok(());
        }
        self.activate(uuid).await?;
        let vdi = entry_mut(&mut self.vdis, uuid)?;
        self.driver.backend().set_hidden(vdi, hidden).await
    }

    /// Check VHD integrity; raw volumes carry no metadata to check.
    pub async fn validate(&mut self, uuid: &str) -> GcResult<()> {
        if self.vdi_ref(uuid)?.is_raw() {
            return Ok(());
        }
        self.activate(uuid).await?;
        let path = self.vdi_ref(uuid)?.path.clone();
        self.driver.backend().vhd().check(&path).await
    }

    // ─── Volume state (LVHD only, no-ops on file SRs) ──────────────────

    pub async fn set_readonly(&mut self, uuid: &str, readonly: bool) -> GcResult<()> {
        if let Some(lvhd) = self.driver.lvhd() {
            let vdi = entry_mut(&mut self.vdis, uuid)?;
            lvhd.set_readonly(vdi, readonly).await?;
        }
        Ok(())
    }

    pub async fn inflate(&mut self, uuid: &str, size: u64) -> GcResult<()> {
        if let Some(lvhd) = self.driver.lvhd() {
            let vdi = entry_mut(&mut self.vdis, uuid)?;
            lvhd.inflate(vdi, size).await?;
        }
        Ok(())
    }

    pub async fn inflate_fully(&mut self, uuid: &str) -> GcResult<()> {
        if self.driver.is_lvhd() {
            self.activate(uuid).await?;
        }
        if let Some(lvhd) = self.driver.lvhd() {
            let vdi = entry_mut(&mut self.vdis, uuid)?;
            lvhd.inflate_fully(vdi).await?;
        }
        Ok(())
    }

    pub async fn deflate(&mut self, uuid: &str) -> GcResult<()> {
        if self.driver.is_lvhd() {
            self.activate(uuid).await?;
        }
        if let Some(lvhd) = self.driver.lvhd() {
            let vdi = entry_mut(&mut self.vdis, uuid)?;
            lvhd.deflate(vdi).await?;
        }
        Ok(())
    }

    /// Release all storage state held by this run. Errors are logged.
    pub async fn cleanup(&self) {
        if let Err(e) = self.driver.backend().cleanup().await {
            error!("sr: cleanup of {} failed: {}", self.uuid, e);
        }
    }

    // ─── SR switches and VDI config ─────────────────────────────────────

    async fn sr_flag(&self, key: &str) -> GcResult<bool> {
        let other = self.control.sr_other_config(&self.uuid).await?;
        Ok(other.get(key).map(String::as_str) != Some("false"))
    }

    pub async fn gc_enabled(&self) -> GcResult<bool> {
        self.sr_flag(DB_GC).await
    }

    pub async fn coalesce_enabled(&self) -> GcResult<bool> {
        self.sr_flag(DB_COALESCE).await
    }

    pub async fn leaf_coalesce_forbidden(&self) -> GcResult<bool> {
        Ok(!self.sr_flag(DB_LEAFCLSC).await?)
    }

    pub async fn is_plugged_here(&self) -> GcResult<bool> {
        self.control.is_plugged_here(&self.uuid).await
    }

    /// Config of a VDI; a VDI without a control-plane record has none.
    pub async fn vdi_config(&self, uuid: &str) -> GcResult<VdiConfig> {
        match self.control.vdi_config(uuid).await {
            Err(e) if e.is_benign_race() => {
                debug!("sr: no record for VDI {}", uuid);
                Ok(VdiConfig::default())
            }
            res => res,
        }
    }

    pub async fn leaf_policy(&self, uuid: &str) -> GcResult<LeafCoalescePolicy> {
        let cfg = self.vdi_config(uuid).await?;
        Ok(LeafCoalescePolicy::from_config(
            cfg.get(ConfigNamespace::Other, DB_LEAFCLSC),
        ))
    }

    pub async fn set_leaf_policy(&self, uuid: &str, policy: LeafCoalescePolicy) -> GcResult<()> {
        match policy.as_config() {
            Some(value) => {
                self.control
                    .set_vdi_config(uuid, ConfigNamespace::Other, DB_LEAFCLSC, value)
                    .await
            }
            None => {
                self.control
                    .remove_vdi_config(uuid, ConfigNamespace::Other, DB_LEAFCLSC)
                    .await
            }
        }
    }

    /// Forget a VDI record; a record that is already gone is fine.
    pub(crate) async fn forget_vdi(&self, uuid: &str) -> GcResult<()> {
        match self.control.forget_vdi(uuid).await {
            Err(e) if e.is_benign_race() => {
                debug!("sr: VDI {} already forgotten", uuid);
                Ok(())
            }
            res => res,
        }
    }

    // ─── Block allocation info ──────────────────────────────────────────

    async fn read_block_bitmap(&mut self, uuid: &str) -> GcResult<Vec<u8>> {
        self.activate(uuid).await?;
        let path = self.vdi_ref(uuid)?.path.clone();
        self.driver.backend().vhd().block_bitmap(&path).await
    }

    /// Read the bitmap from storage and cache it in the VDI config.
    pub async fn update_block_info_for(&mut self, uuid: &str) -> GcResult<Vec<u8>> {
        let bitmap = self.read_block_bitmap(uuid).await?;
        let encoded = encode_blocks(&bitmap)?;
        match self
            .control
            .set_vdi_config(uuid, ConfigNamespace::Internal, DB_VHD_BLOCKS, &encoded)
            .await
        {
            Err(e) if e.is_benign_race() => debug!("sr: not caching blocks of {}: {}", uuid, e),
            res => res?,
        }
        Ok(bitmap)
    }

    /// Block bitmap of a VHD, from the config cache when present.
    pub async fn vhd_blocks(&mut self, uuid: &str) -> GcResult<Vec<u8>> {
        let cfg = self.vdi_config(uuid).await?;
        if let Some(encoded) = cfg.get(ConfigNamespace::Internal, DB_VHD_BLOCKS) {
            match decode_blocks(encoded) {
                Ok(bitmap) => return Ok(bitmap),
                Err(e) => warn!("sr: dropping bad block cache of {}: {}", uuid, e),
            }
        }
        self.update_block_info_for(uuid).await
    }

    fn block_info_candidates(&self) -> Vec<String> {
        self.vdis
            .values()
            .filter(|v| !v.scan_error && !v.children.is_empty() && !v.is_raw())
            .map(|v| v.uuid.clone())
            .collect()
    }

    /// Whether a non-leaf VHD lacks its cached block bitmap.
    pub async fn need_update_block_info(&self) -> GcResult<bool> {
        for uuid in self.block_info_candidates() {
            let cfg = self.vdi_config(&uuid).await?;
            if cfg.get(ConfigNamespace::Internal, DB_VHD_BLOCKS).is_none() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Cache the block bitmap of every non-leaf VHD that lacks one.
    pub async fn update_block_info(&mut self) -> GcResult<()> {
        for uuid in self.block_info_candidates() {
            let cfg = self.vdi_config(&uuid).await?;
            if cfg.get(ConfigNamespace::Internal, DB_VHD_BLOCKS).is_none() {
                debug!("sr: caching block info of {}", uuid);
                self.update_block_info_for(&uuid).await?;
            }
        }
        Ok(())
    }

    // ─── Journals ───────────────────────────────────────────────────────

    /// Drop `coalesce` markers; they only describe in-flight work of a
    /// process that is no longer running.
    pub fn cleanup_coalesce_journals(&self) -> GcResult<()> {
        for uuid in self.journal.get_all(JournalKind::Coalesce)?.into_keys() {
            debug!("sr: removing stale coalesce journal of {}", uuid);
            self.journal.remove(JournalKind::Coalesce, &uuid)?;
        }
        Ok(())
    }

    // ─── Remote hosts ───────────────────────────────────────────────────

    pub(crate) async fn attached_hosts(&self, vdi_uuids: &[String]) -> GcResult<Vec<HostRecord>> {
        self.control.attached_hosts(&self.uuid, vdi_uuids).await
    }

    pub(crate) async fn call_on_hosts(
        &self,
        hosts: &[HostRecord],
        plugin: &str,
        action: &str,
        args: &BTreeMap<String, String>,
    ) -> GcResult<()> {
        for host in hosts {
            debug!("sr: calling {}.{} on {}", plugin, action, host.hostname);
            self.control.call_plugin(host, plugin, action, args).await?;
        }
        Ok(())
    }

    // ─── Reporting ──────────────────────────────────────────────────────

    pub fn tree_lines(&self) -> Vec<String> {
        tree_lines(&self.vdis, &self.vdi_trees)
    }

    pub fn print_vdis(&self) {
        debug!(
            "SR {} ({} VDIs in {} trees)",
            self.uuid,
            self.vdis.len(),
            self.vdi_trees.len()
        );
        for line in self.tree_lines() {
            debug!("    {}", line);
        }
    }

    /// Whether a GC iteration would do anything.
    pub async fn has_work(&mut self) -> GcResult<bool> {
        if !self.find_garbage()?.is_empty() {
            return Ok(true);
        }
        if self.find_coalesceable().await?.is_some() {
            return Ok(true);
        }
        if self.find_leaf_coalesceable().await?.is_some() {
            return Ok(true);
        }
        self.need_update_block_info().await
    }

    /// Ask the control plane to refresh the SR record and wait a bounded
    /// time for it. The task is left running when the wait runs out.
    pub async fn update(&self) -> GcResult<()> {
        let task = self.control.start_sr_update(&self.uuid).await?;
        for _ in 0..self.config.sr_update_poll_iterations {
            match self.control.task_status(&task).await? {
                TaskStatus::Pending => {}
                status => {
                    debug!("sr: update of {} finished: {:?}", self.uuid, status);
                    return Ok(());
                }
            }
            if self.abort.is_set() {
                info!("sr: abort during update of {}, cancelling", self.uuid);
                if let Err(e) = self.control.cancel_task(&task).await {
                    warn!("sr: failed to cancel update task {}: {}", task, e);
                }
                return Ok(());
            }
            tokio::time::sleep(self.config.sr_update_poll_interval()).await;
        }
        warn!("sr: update of {} still running, no longer waiting", self.uuid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use vhdgc_core::sim::SimVhd;
    use vhdgc_core::{AbortSignal, LockManager};

    use super::*;
    use crate::testutil::{Fixture, MIB, SR_UUID};

    #[tokio::test]
    async fn test_scan_links_trees() {
        let t = Fixture::file();
        t.add("base", SimVhd::new(8 * MIB).hidden());
        t.add("mid", SimVhd::new(8 * MIB).parent("base").hidden());
        t.add("leaf", SimVhd::new(8 * MIB).parent("mid"));
        t.add("other", SimVhd::new(8 * MIB));
        let mut sr = t.sr();
        sr.scan(false).await.unwrap();

        assert_eq!(sr.vdi_trees, vec!["base", "other"]);
        for vdi in sr.vdis.values() {
            if let Some(parent) = &vdi.parent {
                assert!(sr.vdi(parent).unwrap().children.contains(&vdi.uuid));
            } else {
                assert!(vdi.parent_uuid.is_empty());
            }
        }
        assert_eq!(sr.vdi("mid").unwrap().children, vec!["leaf"]);
    }

    #[tokio::test]
    async fn test_scan_drops_vanished_vdis() {
        let t = Fixture::file();
        t.add("base", SimVhd::new(8 * MIB).hidden());
        let mut sr = t.sr();
        sr.scan(false).await.unwrap();
        t.add("new", SimVhd::new(8 * MIB).parent("base"));
        sr.scan(false).await.unwrap();
        assert_eq!(sr.vdi("base").unwrap().children, vec!["new"]);

        sr.delete_vdi("new").await.unwrap();
        sr.scan(false).await.unwrap();
        assert!(sr.vdi("new").is_none());
        assert!(sr.vdi("base").unwrap().children.is_empty());
    }

    #[tokio::test]
    async fn test_missing_parent_needs_force() {
        let t = Fixture::file();
        t.add("base", SimVhd::new(8 * MIB).hidden());
        t.add("leaf", SimVhd::new(8 * MIB).parent("base"));
        t.add("orphan", SimVhd::new(8 * MIB).parent("gone"));
        let mut sr = t.sr();

        assert!(matches!(sr.scan(false).await, Err(GcError::ScanFailed(_))));
        assert!(sr.vdi_trees.is_empty());
        assert!(sr.vdis.values().all(|v| v.parent.is_none() && v.children.is_empty()));
        sr.scan(true).await.unwrap();
        assert_eq!(sr.vdi_trees, vec!["base", "orphan"]);
        assert_eq!(sr.vdi("base").unwrap().children, vec!["leaf"]);
    }

    #[tokio::test]
    async fn test_unreadable_vdi_needs_force() {
        let t = Fixture::file();
        let bad = t.add("bad", SimVhd::new(8 * MIB));
        t.storage.set_scan_error(&bad, true);
        let mut sr = t.sr();

        assert!(matches!(sr.scan(false).await, Err(GcError::ScanFailed(_))));
        sr.scan(true).await.unwrap();
        assert!(sr.vdi("bad").unwrap().scan_error);
    }

    #[tokio::test]
    async fn test_sr_lock_nests() {
        let t = Fixture::file();
        let mut sr = t.sr();

        sr.lock().await.unwrap();
        sr.lock().await.unwrap();
        assert!(t.locks.is_held(SR_UUID, LOCK_TYPE_SR));
        sr.unlock().unwrap();
        assert!(t.locks.is_held(SR_UUID, LOCK_TYPE_SR));
        sr.unlock().unwrap();
        assert!(!t.locks.is_held(SR_UUID, LOCK_TYPE_SR));
        assert!(matches!(sr.unlock(), Err(GcError::Invariant(_))));
    }

    #[tokio::test]
    async fn test_sr_lock_contention() {
        let t = Fixture::file();
        assert!(t.locks.try_acquire(SR_UUID, LOCK_TYPE_SR).unwrap());
        let mut sr = t.sr();

        assert!(matches!(sr.lock().await, Err(GcError::LockTimeout(_))));
        assert!(!sr.is_locked());

        // waiting gives way to an abort
        t.abort.set(SR_UUID).unwrap();
        assert_eq!(sr.lock().await, Err(GcError::Aborted));
    }

    #[tokio::test]
    async fn test_update_waits_for_task() {
        let t = Fixture::file();
        t.control.set_pending_polls(3);
        let sr = t.sr();

        sr.update().await.unwrap();
        assert_eq!(t.control.sr_updates(), 1);
        assert!(t.control.cancelled_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_update_cancelled_on_abort() {
        let t = Fixture::file();
        t.control.set_pending_polls(1000);
        t.abort.set(SR_UUID).unwrap();
        let sr = t.sr();

        sr.update().await.unwrap();
        assert_eq!(t.control.cancelled_tasks(), vec!["task-1"]);
    }

    #[tokio::test]
    async fn test_update_stops_waiting() {
        let mut t = Fixture::file();
        t.config.sr_update_poll_iterations = 3;
        t.control.set_pending_polls(1000);
        let sr = t.sr();

        sr.update().await.unwrap();
        assert!(t.control.cancelled_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_block_info_counts_as_work() {
        let t = Fixture::file();
        t.add("base", SimVhd::new(8 * MIB).hidden().blocks(&[0, 2]));
        t.add("leaf", SimVhd::new(8 * MIB).parent("base"));
        let mut sr = t.sr();
        sr.scan(false).await.unwrap();

        assert!(sr.find_garbage().unwrap().is_empty());
        assert!(sr.has_work().await.unwrap());

        sr.update_block_info().await.unwrap();
        assert!(!sr.has_work().await.unwrap());
        let cached = t.control.config("base");
        assert!(cached.get(ConfigNamespace::Internal, DB_VHD_BLOCKS).is_some());
        let blocks = sr.vhd_blocks("base").await.unwrap();
        assert_eq!(blocks[0], 0b1010_0000);
    }

    #[tokio::test]
    async fn test_sr_switches() {
        let t = Fixture::file();
        let sr = t.sr();
        assert!(sr.gc_enabled().await.unwrap());
        assert!(sr.coalesce_enabled().await.unwrap());
        assert!(!sr.leaf_coalesce_forbidden().await.unwrap());

        t.control.set_sr_config(DB_GC, "false");
        t.control.set_sr_config(DB_COALESCE, "false");
        t.control.set_sr_config(DB_LEAFCLSC, "false");
        assert!(!sr.gc_enabled().await.unwrap());
        assert!(!sr.coalesce_enabled().await.unwrap());
        assert!(sr.leaf_coalesce_forbidden().await.unwrap());
    }
}
