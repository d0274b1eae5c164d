//! Coalescing hidden interior VDIs into their parents.
//!
//! A coalesce runs in two journaled phases. While the `coalesce` entry
//! exists the child's data is being folded into the parent; the entry
//! is only advisory and dropped by the next run. Once the `relink` entry
//! exists the data is in the parent and only the children still need to
//! be pointed at it, so a crashed run resumes from there.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use vhdgc_core::lvm::{calc_size_lv, calc_size_vhd_lv};
use vhdgc_core::vhd::{calc_overhead_bitmap, calc_overhead_empty};
use vhdgc_proto::constants::{DB_VHD_BLOCKS, DB_VHD_PARENT, PLUGIN_TAPDISK};
use vhdgc_proto::{ConfigNamespace, GcError, GcResult, JournalKind};

use crate::fist::COALESCE_BEFORE_RELINK_JOURNAL;
use crate::sr::{entry_mut, Sr};
use crate::vdi::{all_leaves, is_coalesceable, merged_data_size, tree_height, tree_root};

impl Sr {
    /// Pick the next VDI to coalesce: a VDI with an unfinished relink
    /// first, then the first candidate that fits in free space, taking
    /// the tallest trees first.
    pub async fn find_coalesceable(&mut self) -> GcResult<Option<String>> {
        if !self.coalesce_enabled().await? {
            info!("coalesce: disabled for SR {}", self.uuid);
            return Ok(None);
        }
        for uuid in self.journal.get_all(JournalKind::Relink)?.into_keys() {
            if self.vdis.contains_key(&uuid) && !self.failed_coalesce_targets.contains(&uuid) {
                info!("coalesce: resuming relink of {}", uuid);
                return Ok(Some(uuid));
            }
        }

        let mut by_height: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for uuid in self.vdis.keys() {
            if is_coalesceable(&self.vdis, uuid) && !self.failed_coalesce_targets.contains(uuid) {
                debug!("coalesce: {} is coalesceable", uuid);
                let height = tree_height(&self.vdis, tree_root(&self.vdis, uuid));
                by_height.entry(height).or_default().push(uuid.clone());
            }
        }
        if by_height.is_empty() {
            return Ok(None);
        }

        let free = self.free_space().await? as i64;
        for (height, group) in by_height.into_iter().rev() {
            for uuid in group {
                let needed = match self.extra_space_for_coalescing(&uuid).await {
                    Ok(needed) => needed,
                    Err(e) if e.is_abort() => return Err(e),
                    Err(e) => {
                        error!("coalesce: cannot size {}, skipping: {}", uuid, e);
                        continue;
                    }
                };
                if needed <= free {
                    info!("coalesce: candidate {} (tree height {})", uuid, height);
                    return Ok(Some(uuid));
                }
                info!(
                    "coalesce: no space to coalesce {} (need {}, free {})",
                    uuid, needed, free
                );
            }
        }
        Ok(None)
    }

    /// Coalesce `uuid` into its parent. Failures other than an abort
    /// mark the VDI as failed for this process and are swallowed.
    pub async fn coalesce(&mut self, uuid: &str, dry_run: bool) -> GcResult<()> {
        let parent = self
            .vdi(uuid)
            .and_then(|v| v.parent.clone())
            .unwrap_or_default();
        info!("coalesce: {} -> {}", uuid, parent);
        if dry_run {
            return Ok(());
        }
        let res = self.coalesce_one(uuid).await;
        self.cleanup().await;
        match res {
            Err(e) if e.is_abort() => Err(e),
            Err(e) => {
                error!("coalesce: {} failed, skipping: {}", uuid, e);
                self.failed_coalesce_targets.insert(uuid.to_string());
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    /// Both journaled phases of a coalesce, then removal of the
    /// emptied VDI.
    pub(crate) async fn coalesce_one(&mut self, uuid: &str) -> GcResult<()> {
        if self.journal.get(JournalKind::Relink, uuid)?.is_some() {
            info!("coalesce: {} already coalesced, relinking only", uuid);
        } else {
            self.journal.remove(JournalKind::Coalesce, uuid)?;
            self.journal.create(JournalKind::Coalesce, uuid, "1")?;
            self.coalesce_begin(uuid).await?;
            self.journal.remove(JournalKind::Coalesce, uuid)?;
            self.fist.activate(COALESCE_BEFORE_RELINK_JOURNAL)?;
            self.journal.create(JournalKind::Relink, uuid, "1")?;
        }

        // Children may have changed while the data was being merged.
        self.lock().await?;
        let res = async {
            self.scan(false).await?;
            self.relink_skip(uuid).await
        }
        .await;
        let res = self.unlock_after(res);

        if let Some(parent) = self.vdi(uuid).and_then(|v| v.parent.clone()) {
            if let Err(e) = self.reload_children(&parent, uuid).await {
                error!("coalesce: reloading children of {} failed: {}", parent, e);
                res.clone()?;
                return Err(e);
            }
        }
        res?;

        self.journal.remove(JournalKind::Relink, uuid)?;
        self.delete_vdi(uuid).await
    }

    async fn coalesce_begin(&mut self, uuid: &str) -> GcResult<()> {
        let parent = self.parent_of(uuid)?;
        let lvhd = self.driver.is_lvhd();
        if lvhd {
            self.activate_chain(uuid).await?;
            self.set_readonly(&parent, false).await?;
        }
        let res = self.coalesce_data(uuid, &parent).await;
        if lvhd {
            let restored = async {
                self.reload_size_vhd(&parent).await?;
                self.deflate(&parent).await?;
                self.set_readonly(&parent, true).await
            }
            .await;
            if let Err(e) = restored {
                error!("coalesce: restoring parent {} failed: {}", parent, e);
                res.clone()?;
                return Err(e);
            }
        }
        res
    }

    async fn coalesce_data(&mut self, uuid: &str, parent: &str) -> GcResult<()> {
        self.validate(uuid).await?;
        self.validate(parent).await?;
        if self.driver.is_lvhd() {
            self.inflate_parent_for_coalesce(uuid).await?;
        }
        let size_virt = self.vdi_ref(uuid)?.size_virt;
        self.increase_size_virt(parent, size_virt, true).await?;
        self.coalesce_vhd(uuid, self.config.coalesce_timeout()).await?;
        self.validate(parent).await?;
        if !self.vdi_ref(parent)?.is_raw() {
            self.update_block_info_for(parent).await?;
        }
        Ok(())
    }

    /// Run the backend coalesce of `uuid` into its parent. When it
    /// fails or is killed the parent VHD gets a best-effort repair.
    pub(crate) async fn coalesce_vhd(&mut self, uuid: &str, timeout: Option<Duration>) -> GcResult<()> {
        info!("coalesce: running VHD coalesce on {}", uuid);
        let path = self.vdi_ref(uuid)?.path.clone();
        let vhd = self.driver.backend().vhd().clone();
        let (op_vhd, op_path) = (vhd.clone(), path.clone());
        let res = self
            .abort
            .run(timeout, move |_| async move { op_vhd.coalesce(&op_path).await })
            .await;
        if let Err(e) = res {
            let parent = self.parent_of(uuid)?;
            let parent = self.vdi_ref(&parent)?;
            if !parent.is_raw() {
                warn!("coalesce: {} failed, repairing parent {}", uuid, parent.uuid);
                if let Err(re) = vhd.repair(&parent.path).await {
                    error!("coalesce: repair of {} failed: {}", parent.uuid, re);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Point every child of `uuid` at the parent of `uuid`.
    async fn relink_skip(&mut self, uuid: &str) -> GcResult<()> {
        let parent = self.parent_of(uuid)?;
        let children = self.vdi_ref(uuid)?.children.clone();
        for child in &children {
            self.abort.check()?;
            info!("coalesce: relinking {} from {} to {}", child, uuid, parent);
            self.set_parent(child, &parent).await?;
        }
        entry_mut(&mut self.vdis, uuid)?.children.clear();
        Ok(())
    }

    /// Re-parent `child` onto `parent` on storage, in the map and in
    /// the child's config.
    pub(crate) async fn set_parent(&mut self, child: &str, parent: &str) -> GcResult<()> {
        self.activate(child).await?;
        let readonly = self.vdi_ref(child)?.lv().is_some_and(|lv| lv.readonly);
        if readonly {
            self.set_readonly(child, false).await?;
        }
        let res = {
            let (c, p) = (self.vdi_ref(child)?, self.vdi_ref(parent)?);
            self.driver.backend().set_parent(c, p).await
        };
        if readonly {
            if let Err(e) = self.set_readonly(child, true).await {
                error!("coalesce: failed to restore read-only on {}: {}", child, e);
            }
        }
        res?;

        let old_parent = self.vdi_ref(child)?.parent.clone();
        if let Some(old) = old_parent.and_then(|p| self.vdis.get_mut(&p)) {
            old.children.retain(|c| c != child);
        }
        let c = entry_mut(&mut self.vdis, child)?;
        c.parent = Some(parent.to_string());
        c.parent_uuid = parent.to_string();
        entry_mut(&mut self.vdis, parent)?.children.push(child.to_string());

        if let Err(e) = self
            .control
            .set_vdi_config(child, ConfigNamespace::Internal, DB_VHD_PARENT, parent)
            .await
        {
            warn!("coalesce: failed to record vhd-parent of {}: {}", child, e);
        }
        Ok(())
    }

    /// Make attached leaves under the children of `parent` (except
    /// `skip`) re-read their VHD chain.
    pub(crate) async fn reload_children(&self, parent: &str, skip: &str) -> GcResult<()> {
        let children = self.vdi_ref(parent)?.children.clone();
        for child in children.iter().filter(|c| *c != skip) {
            let leaves = all_leaves(&self.vdis, child);
            self.tapdisk(&leaves, "pause").await?;
            self.tapdisk(&leaves, "unpause").await?;
        }
        Ok(())
    }

    /// Call a tapdisk action for each leaf on every host it is attached
    /// to. Leaves deleted meanwhile are skipped.
    pub(crate) async fn tapdisk(&self, leaves: &[String], action: &str) -> GcResult<()> {
        for leaf in leaves {
            let hosts = self.attached_hosts(std::slice::from_ref(leaf)).await?;
            let args = BTreeMap::from([
                ("sr_uuid".to_string(), self.uuid.clone()),
                ("vdi_uuid".to_string(), leaf.clone()),
            ]);
            for host in &hosts {
                match self.control.call_plugin(host, PLUGIN_TAPDISK, action, &args).await {
                    Err(e) if e.is_benign_race() => {
                        debug!("coalesce: {} vanished during {}: {}", leaf, action, e)
                    }
                    res => {
                        res?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Grow the virtual size of `uuid` to at least `size`. Growth
    /// beyond the in-place limit is journaled; with `atomic` it runs
    /// under the SR lock with the subtree's attached leaves paused.
    pub(crate) async fn increase_size_virt(&mut self, uuid: &str, size: u64, atomic: bool) -> GcResult<()> {
        let vdi = self.vdi_ref(uuid)?;
        if vdi.size_virt >= size {
            return Ok(());
        }
        info!(
            "coalesce: growing virtual size of {} from {} to {}",
            uuid, vdi.size_virt, size
        );
        if vdi.is_raw() {
            self.inflate(uuid, calc_size_lv(size)).await?;
            let v = entry_mut(&mut self.vdis, uuid)?;
            v.size_virt = v.lv().map_or(size, |lv| lv.size_lv);
            return Ok(());
        }

        self.activate(uuid).await?;
        let path = self.vdi_ref(uuid)?.path.clone();
        let vhd = self.driver.backend().vhd().clone();
        if size <= vhd.max_resize_size(&path).await? {
            vhd.set_size_virt_fast(&path, size).await?;
        } else if atomic {
            let leaves = all_leaves(&self.vdis, uuid);
            self.lock().await?;
            let res = async {
                self.tapdisk(&leaves, "pause").await?;
                let resized = self.set_size_virt(uuid, size).await;
                let resumed = self.tapdisk(&leaves, "unpause").await;
                resized.and(resumed)
            }
            .await;
            self.unlock_after(res)?;
        } else {
            self.set_size_virt(uuid, size).await?;
        }
        let size_virt = vhd.size_virt(&path).await?;
        entry_mut(&mut self.vdis, uuid)?.size_virt = size_virt;
        Ok(())
    }

    async fn set_size_virt(&mut self, uuid: &str, size: u64) -> GcResult<()> {
        let vdi = entry_mut(&mut self.vdis, uuid)?;
        self.driver.backend().set_size_virt(vdi, size).await
    }

    /// Inflate the parent of `uuid` just enough to take the merge.
    pub(crate) async fn inflate_parent_for_coalesce(&mut self, uuid: &str) -> GcResult<()> {
        let parent = self.parent_of(uuid)?;
        let Some(size_lv) = self.vdi_ref(&parent)?.lv().map(|lv| lv.size_lv) else {
            return Ok(());
        };
        if self.vdi_ref(&parent)?.is_raw() {
            return Ok(());
        }
        let inc = self.extra_space_for_coalescing(uuid).await?;
        if inc > 0 {
            self.inflate(&parent, size_lv + inc as u64).await?;
        }
        Ok(())
    }

    // ─── Space accounting ───────────────────────────────────────────────

    /// Data size of the parent of `uuid` after the merge.
    pub(crate) async fn coalesced_size_data(&mut self, uuid: &str) -> GcResult<u64> {
        let parent = self.parent_of(uuid)?;
        // the child may have been written since the bitmap was cached
        match self
            .control
            .remove_vdi_config(uuid, ConfigNamespace::Internal, DB_VHD_BLOCKS)
            .await
        {
            Err(e) if e.is_benign_race() => {}
            res => res?,
        }
        let child_blocks = self.vhd_blocks(uuid).await?;
        let parent_blocks = self.vhd_blocks(&parent).await?;
        let size = merged_data_size(&child_blocks, &parent_blocks);
        let size_virt = self.vdi_ref(uuid)?.size_virt;
        if size > size_virt {
            return Err(GcError::Invariant(format!(
                "coalesced data of {} ({}) exceeds its virtual size ({})",
                uuid, size, size_virt
            )));
        }
        Ok(size)
    }

    /// Bytes of free space a coalesce of `uuid` consumes.
    pub async fn extra_space_for_coalescing(&mut self, uuid: &str) -> GcResult<i64> {
        let parent = self.parent_of(uuid)?;
        if self.driver.is_lvhd() {
            let Some(lv) = self.vdi_ref(&parent)?.lv().cloned() else {
                return Ok(0);
            };
            // raw parents are never deflated
            if lv.raw {
                return Ok(0);
            }
            let data = self.coalesced_size_data(uuid).await?;
            return Ok(calc_size_vhd_lv(data) as i64 - lv.size_lv as i64);
        }
        let data = self.coalesced_size_data(uuid).await?;
        let size_virt = self.vdi_ref(uuid)?.size_virt;
        let coalesced = data + calc_overhead_bitmap(data) + calc_overhead_empty(size_virt);
        Ok(coalesced as i64 - self.size_vhd(&parent).await? as i64)
    }

    /// Extra space for a live leaf-coalesce. An LVHD leaf is deflated
    /// first, which gives some space back.
    pub async fn extra_space_for_leaf_coalescing(&mut self, uuid: &str) -> GcResult<i64> {
        let extra = self.extra_space_for_coalescing(uuid).await?;
        let Some(size_lv) = self.vdi_ref(uuid)?.lv().map(|lv| lv.size_lv) else {
            return Ok(extra);
        };
        let size_vhd = self.size_vhd(uuid).await?;
        Ok(extra - (size_lv as i64 - calc_size_lv(size_vhd) as i64))
    }

    /// Extra space when a snapshot is taken first: the snapshot leaf
    /// adds one more VHD.
    pub async fn extra_space_for_snapshot_coalescing(&mut self, uuid: &str) -> GcResult<i64> {
        let extra = self.extra_space_for_coalescing(uuid).await?;
        if self.driver.is_lvhd() {
            let size_vhd = self.size_vhd(uuid).await?;
            return Ok(extra + calc_size_lv(size_vhd) as i64);
        }
        Ok(extra + calc_overhead_empty(self.vdi_ref(uuid)?.size_virt) as i64)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use vhdgc_core::sim::SimVhd;
    use vhdgc_core::{AbortSignal, Journal, VhdBackend};
    use vhdgc_proto::constants::{DB_COALESCE, DB_VHD_BLOCKS, DB_VHD_PARENT};
    use vhdgc_proto::ConfigNamespace;

    use super::*;
    use crate::fist::COALESCE_BEFORE_RELINK_JOURNAL;
    use crate::testutil::{Fixture, MIB, SR_UUID};

    fn chain(t: &Fixture) {
        t.add("base", SimVhd::new(8 * MIB).hidden().blocks(&[0]));
        t.add("mid", SimVhd::new(8 * MIB).parent("base").hidden().blocks(&[1]));
        t.add("leaf", SimVhd::new(8 * MIB).parent("mid").blocks(&[2]));
    }

    #[tokio::test]
    async fn test_coalesce_folds_and_removes_link() {
        let t = Fixture::file();
        chain(&t);
        let mut sr = t.sr();
        sr.scan(false).await.unwrap();

        let candidate = sr.find_coalesceable().await.unwrap();
        assert_eq!(candidate.as_deref(), Some("mid"));
        sr.coalesce("mid", false).await.unwrap();

        assert_eq!(t.storage.coalesced(), vec!["mid"]);
        let base = t.storage.vhd(&Path::new("/sr").join("base.vhd")).unwrap();
        assert_eq!(base.blocks.count_ones(), 2);
        let leaf = t.storage.vhd(&Path::new("/sr").join("leaf.vhd")).unwrap();
        assert_eq!(leaf.parent.as_deref(), Some("base"));

        assert!(sr.vdi("mid").is_none());
        assert_eq!(sr.vdi("base").unwrap().children, vec!["leaf"]);
        assert_eq!(sr.vdi("leaf").unwrap().parent.as_deref(), Some("base"));
        assert_eq!(t.control.forgotten(), vec!["mid"]);

        let leaf_cfg = t.control.config("leaf");
        assert_eq!(leaf_cfg.get(ConfigNamespace::Internal, DB_VHD_PARENT), Some("base"));
        let base_cfg = t.control.config("base");
        assert!(base_cfg.get(ConfigNamespace::Internal, DB_VHD_BLOCKS).is_some());

        assert!(t.journal.get_all(JournalKind::Coalesce).unwrap().is_empty());
        assert!(t.journal.get_all(JournalKind::Relink).unwrap().is_empty());
        assert!(sr.find_coalesceable().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tallest_tree_first() {
        let t = Fixture::file();
        chain(&t);
        t.add("b0", SimVhd::new(8 * MIB).hidden());
        t.add("b1", SimVhd::new(8 * MIB).parent("b0").hidden());
        t.add("b2", SimVhd::new(8 * MIB).parent("b1").hidden());
        t.add("b3", SimVhd::new(8 * MIB).parent("b2"));
        let mut sr = t.sr();
        sr.scan(false).await.unwrap();

        assert_eq!(sr.find_coalesceable().await.unwrap().as_deref(), Some("b1"));
    }

    #[tokio::test]
    async fn test_no_space_no_candidate() {
        let t = Fixture::file();
        chain(&t);
        t.storage.set_free_space(0);
        let mut sr = t.sr();
        sr.scan(false).await.unwrap();

        assert!(sr.extra_space_for_coalescing("mid").await.unwrap() > 0);
        assert!(sr.find_coalesceable().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sr_switch_disables_coalesce() {
        let t = Fixture::file();
        chain(&t);
        t.control.set_sr_config(DB_COALESCE, "false");
        let mut sr = t.sr();
        sr.scan(false).await.unwrap();

        assert!(sr.find_coalesceable().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_space_accounting() {
        let t = Fixture::file();
        chain(&t);
        let mut sr = t.sr();
        sr.scan(false).await.unwrap();

        let data = sr.coalesced_size_data("mid").await.unwrap();
        assert_eq!(data, 2 * vhdgc_proto::constants::VHD_BLOCK_SIZE);
        let extra = sr.extra_space_for_coalescing("mid").await.unwrap();
        let base_phys = SimVhd::new(8 * MIB).blocks(&[0]).size_phys() as i64;
        let expected = (data + calc_overhead_bitmap(data) + calc_overhead_empty(8 * MIB)) as i64;
        assert_eq!(extra, expected - base_phys);
        assert_eq!(sr.extra_space_for_leaf_coalescing("mid").await.unwrap(), extra);
        assert_eq!(
            sr.extra_space_for_snapshot_coalescing("mid").await.unwrap(),
            extra + calc_overhead_empty(8 * MIB) as i64
        );
    }

    #[tokio::test]
    async fn test_parent_grows_by_estimate() {
        let t = Fixture::file();
        chain(&t);
        let base = Path::new("/sr").join("base.vhd");
        let mut sr = t.sr();
        sr.scan(false).await.unwrap();

        let before = t.storage.vhd(&base).unwrap().size_phys() as i64;
        let extra = sr.extra_space_for_coalescing("mid").await.unwrap();
        sr.coalesce("mid", false).await.unwrap();

        assert!(sr.vdi("mid").is_none());
        let after = t.storage.vhd(&base).unwrap().size_phys() as i64;
        assert_eq!(after, before + extra);
        assert_eq!(sr.reload_size_vhd("base").await.unwrap() as i64, after);
    }

    #[tokio::test]
    async fn test_unsizable_candidate_is_retried() {
        let t = Fixture::file();
        chain(&t);
        let mut sr = t.sr();
        sr.scan(false).await.unwrap();

        let mid = Path::new("/sr").join("mid.vhd");
        let saved = t.storage.vhd(&mid).unwrap();
        t.storage.destroy(&mid).await.unwrap();
        assert!(sr.find_coalesceable().await.unwrap().is_none());
        assert!(!sr.failed_coalesce_targets.contains("mid"));

        t.add("mid", saved);
        assert_eq!(sr.find_coalesceable().await.unwrap().as_deref(), Some("mid"));
    }

    #[tokio::test]
    async fn test_failed_coalesce_is_skipped_and_repaired() {
        let t = Fixture::file();
        chain(&t);
        t.storage.fail_coalesce("mid");
        let mut sr = t.sr();
        sr.scan(false).await.unwrap();

        sr.coalesce("mid", false).await.unwrap();

        assert!(sr.failed_coalesce_targets.contains("mid"));
        assert_eq!(t.storage.repaired(), vec![Path::new("/sr").join("base.vhd")]);
        assert!(sr.vdi("mid").is_some());
        assert!(t.journal.get(JournalKind::Relink, "mid").unwrap().is_none());
        assert!(sr.find_coalesceable().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resume_from_relink_journal() {
        let t = Fixture::file();
        chain(&t);
        t.journal.create(JournalKind::Relink, "mid", "1").unwrap();
        t.storage.set_free_space(0);
        let mut sr = t.sr();
        sr.scan(false).await.unwrap();

        // garbage collection must not touch a VDI that is mid-relink
        assert!(sr.find_garbage().unwrap().is_empty());
        assert_eq!(sr.find_coalesceable().await.unwrap().as_deref(), Some("mid"));
        sr.coalesce("mid", false).await.unwrap();

        assert!(t.storage.coalesced().is_empty());
        assert!(sr.vdi("mid").is_none());
        assert_eq!(sr.vdi("leaf").unwrap().parent.as_deref(), Some("base"));
        assert!(t.journal.get(JournalKind::Relink, "mid").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_crash_before_relink_journal() {
        let mut t = Fixture::file();
        chain(&t);
        t.config.fist_points = vec![COALESCE_BEFORE_RELINK_JOURNAL.to_string()];
        let mut sr = t.sr();
        sr.scan(false).await.unwrap();

        sr.coalesce("mid", false).await.unwrap();

        assert_eq!(t.storage.coalesced(), vec!["mid"]);
        assert!(sr.failed_coalesce_targets.contains("mid"));
        assert!(t.journal.get(JournalKind::Coalesce, "mid").unwrap().is_none());
        assert!(t.journal.get(JournalKind::Relink, "mid").unwrap().is_none());
        assert_eq!(sr.vdi("leaf").unwrap().parent.as_deref(), Some("mid"));
    }

    #[tokio::test]
    async fn test_dry_run_coalesce() {
        let t = Fixture::file();
        chain(&t);
        let mut sr = t.sr();
        sr.scan(false).await.unwrap();

        sr.coalesce("mid", true).await.unwrap();
        assert!(t.storage.coalesced().is_empty());
        assert!(sr.vdi("mid").is_some());
    }

    #[tokio::test]
    async fn test_abort_kills_coalesce() {
        let t = Fixture::file();
        chain(&t);
        t.storage.set_coalesce_delay(Duration::from_secs(30));
        let mut sr = t.sr();
        sr.scan(false).await.unwrap();

        let flag = t.abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.set(SR_UUID).unwrap();
        });
        let res = sr.coalesce("mid", false).await;

        assert_eq!(res, Err(GcError::Aborted));
        assert!(t.storage.coalesced().is_empty());
        assert_eq!(t.storage.repaired(), vec![Path::new("/sr").join("base.vhd")]);
        assert!(!sr.failed_coalesce_targets.contains("mid"));
    }

    #[tokio::test]
    async fn test_parent_grown_with_leaves_paused() {
        let t = Fixture::file();
        t.add("base", SimVhd::new(4 * MIB).hidden().blocks(&[0]));
        t.add("mid", SimVhd::new(8 * MIB).parent("base").hidden().blocks(&[3]));
        t.add("leaf", SimVhd::new(8 * MIB).parent("mid"));
        t.control.attach("leaf", "host2");
        let mut sr = t.sr();
        sr.scan(false).await.unwrap();

        sr.coalesce("mid", false).await.unwrap();

        let base_path = Path::new("/sr").join("base.vhd");
        assert_eq!(t.storage.journaled_resizes(), vec![base_path.clone()]);
        assert_eq!(t.storage.vhd(&base_path).unwrap().size_virt, 8 * MIB);
        let actions: Vec<String> = t
            .control
            .plugin_calls()
            .into_iter()
            .filter(|c| c.hostname == "host2")
            .map(|c| c.action)
            .collect();
        assert_eq!(actions, vec!["pause", "unpause", "pause", "unpause"]);
        assert!(!t.locks.is_held(SR_UUID, vhdgc_proto::constants::LOCK_TYPE_SR));
    }

    #[tokio::test]
    async fn test_lvhd_coalesce_restores_parent() {
        let t = Fixture::lvhd();
        chain(&t);
        let mut sr = t.sr();
        sr.scan(false).await.unwrap();

        assert_eq!(sr.find_coalesceable().await.unwrap().as_deref(), Some("mid"));
        sr.coalesce("mid", false).await.unwrap();

        let vg = t.vg();
        assert!(t.storage.lv(&vg, "VHD-mid").is_none());
        let base = t.storage.lv(&vg, "VHD-base").unwrap();
        assert!(base.readonly);
        assert!(!base.active);
        let base_vhd = t.storage.vhd(&Path::new("/dev").join(&vg).join("VHD-base")).unwrap();
        assert_eq!(base.size, calc_size_lv(base_vhd.size_phys()));
        assert_eq!(base_vhd.blocks.count_ones(), 2);
        assert_eq!(sr.vdi("leaf").unwrap().parent.as_deref(), Some("base"));
        for uuid in ["base", "leaf"] {
            assert!(t.refcount_of(uuid).is_zero());
        }
    }
}
