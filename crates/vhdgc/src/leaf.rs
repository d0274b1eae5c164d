//! Leaf-coalescing: folding an attached, writable leaf into its parent.
//!
//! A leaf that is too large to merge during a short pause is first
//! shrunk by snapshot-coalescing: a snapshot freezes the current data
//! under a new hidden parent, which is then coalesced the ordinary way
//! while the VM keeps writing to a fresh, small leaf. The final merge
//! runs as a control-plane atomic operation with the leaf paused; the
//! process executing it calls back into [`Sr::do_coalesce_leaf`].
//!
//! The merge itself ends with a rename swap (child to `OLD_<uuid>`, then
//! parent to the child's uuid) so the surviving volume keeps the uuid
//! the VM knows. A `leaf` journal entry covers the swap; on the next
//! scan an interrupted swap is undone or finished.

use std::collections::BTreeMap;

use tracing::{debug, error, info, warn};
use vhdgc_core::lvm::lv_name;
use vhdgc_core::{AtomicOpOutcome, RefCount};
use vhdgc_proto::constants::{
    ATOMIC_OP_COALESCE_LEAF, DB_VDI_TYPE, DB_VHD_BLOCKS, DB_VHD_PARENT, PLUGIN_ON_SLAVE,
    TMP_RENAME_PREFIX,
};
use vhdgc_proto::{
    ConfigNamespace, GcError, GcResult, JournalKind, LeafCoalescePolicy, VdiType,
};

use crate::fist::{
    LEAF_AFTER_COALESCE, LEAF_AFTER_DELETE, LEAF_BEFORE_COALESCE, LEAF_BEFORE_DELETE,
    LEAF_BEFORE_REMOVE_JOURNAL, LEAF_BOTH_RENAMED, LEAF_ONE_RENAMED, LEAF_STOP_AFTER_RECOVERY,
};
use crate::sr::Sr;
use crate::vdi::{is_coalesceable, is_leaf_coalesceable};

impl Sr {
    /// Pick the next leaf to coalesce. File SRs never offer one.
    pub async fn find_leaf_coalesceable(&mut self) -> GcResult<Option<String>> {
        if !self.driver.is_lvhd() {
            return Ok(None);
        }
        if self.leaf_coalesce_forbidden().await? {
            info!("leaf: leaf-coalesce forbidden on SR {}", self.uuid);
            return Ok(None);
        }

        let leaves: Vec<String> = self
            .vdis
            .keys()
            .filter(|u| is_leaf_coalesceable(&self.vdis, u))
            .filter(|u| !self.failed_coalesce_targets.contains(*u))
            .cloned()
            .collect();
        let mut candidates = Vec::new();
        for uuid in leaves {
            match self.leaf_policy(&uuid).await? {
                LeafCoalescePolicy::Disabled => {
                    debug!("leaf: {} has leaf-coalesce disabled", uuid);
                }
                LeafCoalescePolicy::Force => candidates.push(uuid),
                _ if self.config.auto_online_leaf_coalesce => candidates.push(uuid),
                _ => {}
            }
        }
        if candidates.is_empty() {
            return Ok(None);
        }

        let free = self.free_space().await? as i64;
        for uuid in candidates {
            let sizes = async {
                let snapshot = self.extra_space_for_snapshot_coalescing(&uuid).await?;
                let live = self.extra_space_for_leaf_coalescing(&uuid).await?;
                let can_live = self.can_live_coalesce(&uuid).await?;
                Ok::<_, GcError>((snapshot, live, can_live))
            }
            .await;
            let (snapshot, live, can_live) = match sizes {
                Ok(sizes) => sizes,
                Err(e) if e.is_abort() => return Err(e),
                Err(e) => {
                    error!("leaf: cannot size {}, skipping: {}", uuid, e);
                    continue;
                }
            };
            let needed = if can_live { live } else { snapshot };
            if needed <= free {
                info!("leaf: candidate {} (needs {}, free {})", uuid, needed, free);
                return Ok(Some(uuid));
            }
            info!(
                "leaf: no space to leaf-coalesce {} (need {}, free {})",
                uuid, needed, free
            );
            if live <= free {
                info!("leaf: {} fits only if coalesced offline", uuid);
                self.set_leaf_policy(&uuid, LeafCoalescePolicy::Offline)
                    .await?;
            }
        }
        Ok(None)
    }

    /// Whether the leaf is small enough to merge during a pause.
    pub async fn can_live_coalesce(&mut self, uuid: &str) -> GcResult<bool> {
        if self.size_vhd(uuid).await? <= self.config.live_leaf_coalesce_max_size {
            return Ok(true);
        }
        Ok(self.leaf_policy(uuid).await? == LeafCoalescePolicy::Force)
    }

    /// Leaf-coalesce `uuid`, snapshot-coalescing first while it is too
    /// large. Failure handling matches [`Sr::coalesce`].
    pub async fn coalesce_leaf(&mut self, uuid: &str, dry_run: bool) -> GcResult<()> {
        info!("leaf: coalescing leaf {}", uuid);
        if dry_run {
            return Ok(());
        }
        let res = self.coalesce_leaf_steps(uuid).await;
        self.cleanup().await;
        match res {
            Err(e) if e.is_abort() => Err(e),
            Err(e) => {
                error!("leaf: leaf-coalesce of {} failed, skipping: {}", uuid, e);
                self.failed_coalesce_targets.insert(uuid.to_string());
                Ok(())
            }
            Ok(false) => {
                info!("leaf: leaf-coalesce of {} did not complete, skipping", uuid);
                self.failed_coalesce_targets.insert(uuid.to_string());
                Ok(())
            }
            Ok(true) => Ok(()),
        }
    }

    async fn coalesce_leaf_steps(&mut self, uuid: &str) -> GcResult<bool> {
        while !self.can_live_coalesce(uuid).await? {
            let before = self.size_vhd(uuid).await?;
            if !self.snapshot_coalesce(uuid).await? {
                return Ok(false);
            }
            let after = self.reload_size_vhd(uuid).await?;
            if after >= before {
                info!(
                    "leaf: snapshot-coalesce did not shrink {} ({} -> {}), giving up",
                    uuid, before, after
                );
                self.set_leaf_policy(uuid, LeafCoalescePolicy::Offline)
                    .await?;
                break;
            }
        }
        self.live_leaf_coalesce(uuid).await
    }

    /// Snapshot the leaf and coalesce the snapshot into the leaf's old
    /// parent. Returns `false` when a concurrent change got in the way.
    async fn snapshot_coalesce(&mut self, uuid: &str) -> GcResult<bool> {
        info!("leaf: snapshot-coalescing {}", uuid);
        match self.control.single_snapshot(uuid).await {
            Ok(snap) => debug!("leaf: took snapshot {} of {}", snap, uuid),
            Err(e) if e.is_benign_race() => {
                info!("leaf: {} vanished before snapshot: {}", uuid, e);
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
        self.scan_locked(false).await?;

        let Some(temp) = self.vdi(uuid).and_then(|v| v.parent.clone()) else {
            info!("leaf: {} is gone or has no parent after snapshot", uuid);
            return Ok(false);
        };
        if !is_coalesceable(&self.vdis, &temp) {
            info!("leaf: {} appears to have been snapshotted concurrently", uuid);
            return Ok(false);
        }
        info!("leaf: coalescing snapshot parent {}", temp);
        self.coalesce_one(&temp).await?;
        if !is_leaf_coalesceable(&self.vdis, uuid) {
            info!("leaf: tree of {} changed during snapshot-coalesce", uuid);
            return Ok(false);
        }
        Ok(true)
    }

    /// Have the control plane pause the leaf and run the final merge.
    async fn live_leaf_coalesce(&mut self, uuid: &str) -> GcResult<bool> {
        self.scan_locked(false).await?;
        if !is_leaf_coalesceable(&self.vdis, uuid) {
            info!("leaf: {} is no longer leaf-coalesceable", uuid);
            return Ok(false);
        }
        let args = BTreeMap::from([
            ("sr_uuid".to_string(), self.uuid.clone()),
            ("vdi_uuid".to_string(), uuid.to_string()),
        ]);
        info!("leaf: live leaf-coalesce of {}", uuid);
        match self
            .control
            .atomic_op(&[uuid.to_string()], ATOMIC_OP_COALESCE_LEAF, &args, true)
            .await
        {
            Ok(AtomicOpOutcome::Success) => Ok(true),
            Ok(outcome) => Err(GcError::failed(format!(
                "atomic leaf-coalesce of {} reported {:?}",
                uuid, outcome
            ))),
            Err(e) if e.is_benign_race() => {
                info!("leaf: {} vanished before the atomic op: {}", uuid, e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// The merge and rename swap. The caller guarantees the leaf is
    /// paused everywhere and holds the SR lock.
    pub async fn do_coalesce_leaf(&mut self, uuid: &str) -> GcResult<()> {
        if !self.driver.is_lvhd() {
            return Err(GcError::failed(format!(
                "leaf-coalesce of {} needs an LVHD SR",
                uuid
            )));
        }
        let parent = self.parent_of(uuid)?;
        let timeout = match self.leaf_policy(uuid).await? {
            LeafCoalescePolicy::Force => None,
            _ => self.config.live_leaf_coalesce_timeout(),
        };
        info!("leaf: merging {} into {}", uuid, parent);

        self.activate_chain(uuid).await?;
        self.journal.create(JournalKind::Leaf, uuid, &parent)?;
        self.set_readonly(&parent, false).await?;
        self.set_hidden(&parent, false).await?;
        self.deflate(uuid).await?;
        self.inflate_parent_for_coalesce(uuid).await?;
        let size_virt = self.vdi_ref(uuid)?.size_virt;
        self.increase_size_virt(&parent, size_virt, false).await?;
        self.validate(uuid).await?;
        self.validate(&parent).await?;

        self.fist.activate(LEAF_BEFORE_COALESCE)?;
        self.coalesce_vhd(uuid, timeout).await?;
        self.fist.activate(LEAF_AFTER_COALESCE)?;
        self.validate(&parent).await?;

        let old_uuid = format!("{}{}", TMP_RENAME_PREFIX, uuid);
        let old_lv = self.lv_name_of(uuid)?;
        self.rename_vdi(uuid, &old_uuid).await?;
        self.fist.activate(LEAF_ONE_RENAMED)?;
        self.rename_vdi(&parent, uuid).await?;
        self.fist.activate(LEAF_BOTH_RENAMED)?;
        let new_lv = self.lv_name_of(uuid)?;
        self.notify_hosts(
            uuid,
            &[("deactivateNoRefcount", old_lv), ("refresh", new_lv)],
        )
        .await?;

        // `uuid` now names the merged volume
        self.drop_vdi_config(uuid, DB_VHD_PARENT).await?;
        if self.vdi_ref(uuid)?.is_raw() {
            self.set_vdi_config(uuid, DB_VDI_TYPE, VdiType::Raw.as_str())
                .await?;
        }
        self.drop_vdi_config(uuid, DB_VHD_BLOCKS).await?;

        // The survivor keeps the leaf's online count and the parent's
        // normal count minus the online one it held as a non-leaf.
        if let Some(lvhd) = self.driver.lvhd() {
            let (ns, rc) = (lvhd.ns(), lvhd.refcount());
            let child = rc.check(&old_uuid, &ns)?;
            let parent_rc = rc.check(uuid, &ns)?;
            let count = parent_rc.count.checked_sub(child.binary).ok_or_else(|| {
                GcError::Invariant(format!(
                    "refcount of {} below the online count of {}",
                    parent, uuid
                ))
            })?;
            rc.set(
                uuid,
                RefCount {
                    count,
                    binary: child.binary,
                },
                &ns,
            )?;
        }

        self.set_hidden(&old_uuid, true).await?;
        self.fist.activate(LEAF_BEFORE_DELETE)?;
        self.delete_vdi(&old_uuid).await?;
        self.fist.activate(LEAF_AFTER_DELETE)?;
        self.forget_vdi(&parent).await?;
        self.inflate_fully(uuid).await?;
        self.fist.activate(LEAF_BEFORE_REMOVE_JOURNAL)?;
        self.journal.remove(JournalKind::Leaf, uuid)?;
        info!("leaf: {} merged into {}", parent, uuid);
        Ok(())
    }

    /// Resolve `leaf` journal entries left by an interrupted merge.
    /// Returns whether any were found, in which case the map is stale.
    pub(crate) async fn handle_interrupted_coalesce_leaf(&mut self) -> GcResult<bool> {
        let entries = self.journal.get_all(JournalKind::Leaf)?;
        for (child, parent) in &entries {
            let old_uuid = format!("{}{}", TMP_RENAME_PREFIX, child);
            if self.vdis.contains_key(parent) || self.vdis.contains_key(&old_uuid) {
                self.undo_interrupted_coalesce_leaf(child, parent).await?;
            } else {
                self.finish_interrupted_coalesce_leaf(child, parent).await?;
            }
            self.journal.remove(JournalKind::Leaf, child)?;
        }
        Ok(!entries.is_empty())
    }

    async fn undo_interrupted_coalesce_leaf(&mut self, child: &str, parent: &str) -> GcResult<()> {
        info!("leaf: undoing interrupted leaf-coalesce of {} into {}", child, parent);
        let old_uuid = format!("{}{}", TMP_RENAME_PREFIX, child);
        if !self.vdis.contains_key(parent) {
            if !self.vdis.contains_key(child) {
                return Err(GcError::Invariant(format!(
                    "neither {} nor {} found",
                    parent, child
                )));
            }
            info!("leaf: renaming parent back: {} -> {}", child, parent);
            self.rename_vdi(child, parent).await?;
        }
        if !self.vdis.contains_key(child) {
            if !self.vdis.contains_key(&old_uuid) {
                return Err(GcError::Invariant(format!(
                    "neither {} nor {} found",
                    child, old_uuid
                )));
            }
            info!("leaf: renaming child back: {} -> {}", old_uuid, child);
            self.rename_vdi(&old_uuid, child).await?;
            self.set_vdi_config(child, DB_VHD_PARENT, parent).await?;
            self.set_vdi_config(child, DB_VDI_TYPE, VdiType::Vhd.as_str())
                .await?;

            // The swap moved the leaf's binary holder onto the parent.
            if let Some(lvhd) = self.driver.lvhd() {
                let (ns, rc) = (lvhd.ns(), lvhd.refcount());
                let c = rc.check(child, &ns)?;
                let p = rc.check(parent, &ns)?;
                rc.set(
                    parent,
                    RefCount {
                        count: p.count + c.binary,
                        binary: 0,
                    },
                    &ns,
                )?;
            }
        }

        self.deflate(parent).await?;
        self.inflate_fully(child).await?;
        self.set_hidden(child, false).await?;
        self.set_hidden(parent, true).await?;
        self.set_readonly(parent, true).await?;

        let old_lv = lv_name(&old_uuid, VdiType::Vhd);
        let child_lv = self.lv_name_of(child)?;
        let parent_lv = self.lv_name_of(parent)?;
        self.notify_hosts(
            child,
            &[
                ("deactivateNoRefcount", old_lv),
                ("deactivateNoRefcount", child_lv.clone()),
                ("refresh", child_lv),
                ("refresh", parent_lv),
            ],
        )
        .await?;
        info!("leaf: undo of {} successful", child);

        if self.fist.is_active(LEAF_STOP_AFTER_RECOVERY) {
            self.set_leaf_policy(child, LeafCoalescePolicy::Disabled)
                .await?;
        }
        Ok(())
    }

    async fn finish_interrupted_coalesce_leaf(&mut self, child: &str, parent: &str) -> GcResult<()> {
        info!("leaf: finishing interrupted leaf-coalesce of {}", child);
        if !self.vdis.contains_key(child) {
            return Err(GcError::Invariant(format!("VDI {} not found", child)));
        }
        self.inflate_fully(child).await?;
        if let Err(e) = self.forget_vdi(parent).await {
            warn!("leaf: failed to forget old parent {}: {}", parent, e);
        }
        info!("leaf: finished leaf-coalesce of {}", child);
        Ok(())
    }

    fn lv_name_of(&self, uuid: &str) -> GcResult<String> {
        self.vdi_ref(uuid)?
            .lv()
            .map(|lv| lv.lv_name.clone())
            .ok_or_else(|| GcError::Invariant(format!("VDI {} has no volume", uuid)))
    }

    async fn set_vdi_config(&self, uuid: &str, key: &str, value: &str) -> GcResult<()> {
        match self
            .control
            .set_vdi_config(uuid, ConfigNamespace::Internal, key, value)
            .await
        {
            Err(e) if e.is_benign_race() => {
                debug!("leaf: no record for {}, not setting {}", uuid, key);
                Ok(())
            }
            res => res,
        }
    }

    async fn drop_vdi_config(&self, uuid: &str, key: &str) -> GcResult<()> {
        match self
            .control
            .remove_vdi_config(uuid, ConfigNamespace::Internal, key)
            .await
        {
            Err(e) if e.is_benign_race() => Ok(()),
            res => res,
        }
    }

    /// Run volume `actions` on every other host where `uuid` is
    /// attached, refreshing their LVM view after a rename.
    async fn notify_hosts(&self, uuid: &str, actions: &[(&str, String)]) -> GcResult<()> {
        let Some(lvhd) = self.driver.lvhd() else {
            return Ok(());
        };
        let hosts = self.attached_hosts(&[uuid.to_string()]).await?;
        if hosts.is_empty() {
            return Ok(());
        }
        let mut args = BTreeMap::from([("vgName".to_string(), lvhd.vg().to_string())]);
        for (i, (action, lv)) in actions.iter().enumerate() {
            args.insert(format!("action{}", i + 1), action.to_string());
            args.insert(format!("lvName{}", i + 1), lv.clone());
        }
        self.call_on_hosts(&hosts, PLUGIN_ON_SLAVE, "multi", &args)
            .await
    }
}
