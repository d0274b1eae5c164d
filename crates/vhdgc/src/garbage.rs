//! Garbage collection: deleting hidden VDIs nothing depends on.

use tracing::{debug, info};
use vhdgc_proto::{GcError, GcResult, JournalKind};

use crate::sr::Sr;

impl Sr {
    /// Every prunable VDI, children before their parents.
    ///
    /// A hidden leaf is prunable; an interior VDI is prunable when it is
    /// hidden and all its children are. VDIs with a pending relink are
    /// never prunable since their children may still point at them.
    pub fn find_garbage(&self) -> GcResult<Vec<String>> {
        let relinking = self.journal.get_all(JournalKind::Relink)?;
        let mut garbage = Vec::new();
        for root in &self.vdi_trees {
            self.collect_prunable(root, &relinking, &mut garbage);
        }
        Ok(garbage)
    }

    /// Appends the prunable VDIs under `uuid`; returns whether `uuid`
    /// itself is prunable.
    fn collect_prunable(
        &self,
        uuid: &str,
        relinking: &std::collections::BTreeMap<String, String>,
        out: &mut Vec<String>,
    ) -> bool {
        let Some(vdi) = self.vdis.get(uuid) else {
            return false;
        };
        let mut all_children = true;
        for child in &vdi.children {
            all_children &= self.collect_prunable(child, relinking, out);
        }
        let prunable =
            all_children && vdi.hidden && !vdi.scan_error && !relinking.contains_key(uuid);
        if prunable {
            out.push(uuid.to_string());
        }
        prunable
    }

    /// Delete all garbage, then drop journal entries of vanished VDIs.
    /// Under `dry_run` only reports.
    pub async fn garbage_collect(&mut self, dry_run: bool) -> GcResult<()> {
        let garbage = self.find_garbage()?;
        info!("gc: found {} VDIs for deletion in {}", garbage.len(), self.uuid);
        for uuid in &garbage {
            info!("gc:   {}", uuid);
        }
        if !dry_run {
            self.delete_vdis(&garbage).await?;
        }
        self.cleanup_journals(dry_run)
    }

    pub async fn delete_vdis(&mut self, uuids: &[String]) -> GcResult<()> {
        for uuid in uuids {
            self.abort.check()?;
            info!("gc: deleting unlinked VDI {}", uuid);
            self.delete_vdi(uuid).await?;
        }
        Ok(())
    }

    /// Remove a childless VDI from the map, from storage and from the
    /// control plane.
    pub async fn delete_vdi(&mut self, uuid: &str) -> GcResult<()> {
        if !self.vdi_ref(uuid)?.children.is_empty() {
            return Err(GcError::Invariant(format!(
                "VDI {} still has children",
                uuid
            )));
        }
        let vdi = self.remove_from_map(uuid)?;
        self.driver.backend().delete(&vdi).await?;
        self.forget_vdi(uuid).await
    }

    /// Remove `zero`, `relink` and `clone` entries whose VDI is gone.
    pub fn cleanup_journals(&self, dry_run: bool) -> GcResult<()> {
        for kind in [JournalKind::Zero, JournalKind::Relink, JournalKind::Clone] {
            for (uuid, value) in self.journal.get_all(kind)? {
                let target = match kind {
                    // value is "<base uuid>_<clone uuid>"
                    JournalKind::Clone => value.split('_').next().unwrap_or_default(),
                    _ => uuid.as_str(),
                };
                if self.vdis.contains_key(target) {
                    continue;
                }
                debug!("gc: stale {} journal entry {} ({})", kind, uuid, value);
                if !dry_run {
                    self.journal.remove(kind, &uuid)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use vhdgc_core::sim::SimVhd;
    use vhdgc_core::{AbortSignal, Journal};

    use super::*;
    use crate::testutil::{Fixture, MIB, SR_UUID};

    #[tokio::test]
    async fn test_prunable_propagates_up() {
        let t = Fixture::file();
        t.add("base", SimVhd::new(8 * MIB).hidden());
        t.add("mid", SimVhd::new(8 * MIB).parent("base").hidden());
        t.add("dead", SimVhd::new(8 * MIB).parent("mid").hidden());
        t.add("live", SimVhd::new(8 * MIB).parent("base"));
        let mut sr = t.sr();
        sr.scan(false).await.unwrap();

        assert_eq!(sr.find_garbage().unwrap(), vec!["dead", "mid"]);
    }

    #[tokio::test]
    async fn test_error_leaf_pins_ancestors() {
        let t = Fixture::file();
        t.add("base", SimVhd::new(8 * MIB).hidden());
        let bad = t.add("bad", SimVhd::new(8 * MIB).parent("base").hidden());
        t.storage.set_scan_error(&bad, true);
        let mut sr = t.sr();
        sr.scan(true).await.unwrap();

        assert!(sr.find_garbage().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_relink_journal_excludes() {
        let t = Fixture::file();
        t.add("base", SimVhd::new(8 * MIB).hidden());
        t.add("gone", SimVhd::new(8 * MIB).parent("base").hidden());
        t.journal.create(JournalKind::Relink, "gone", "1").unwrap();
        let mut sr = t.sr();
        sr.scan(false).await.unwrap();

        // base is not prunable either: its only child is pinned
        assert!(sr.find_garbage().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_garbage_collect_deletes_and_forgets() {
        let t = Fixture::file();
        t.add("base", SimVhd::new(8 * MIB).hidden());
        t.add("snap", SimVhd::new(8 * MIB).parent("base").hidden());
        t.add("leaf", SimVhd::new(8 * MIB).parent("base"));
        t.journal.create(JournalKind::Zero, "vanished", "4096").unwrap();
        t.journal.create(JournalKind::Clone, "c1", "vanished_c2").unwrap();
        t.journal.create(JournalKind::Clone, "c3", "base_c4").unwrap();
        let mut sr = t.sr();
        sr.scan(false).await.unwrap();

        sr.garbage_collect(false).await.unwrap();

        assert!(sr.vdi("snap").is_none());
        assert_eq!(sr.vdi("base").unwrap().children, vec!["leaf"]);
        assert!(t.storage.vhd(&Path::new("/sr").join("snap.vhd")).is_none());
        assert_eq!(t.control.forgotten(), vec!["snap"]);
        assert!(t.journal.get(JournalKind::Zero, "vanished").unwrap().is_none());
        assert!(t.journal.get(JournalKind::Clone, "c1").unwrap().is_none());
        assert!(t.journal.get(JournalKind::Clone, "c3").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_dry_run_reports_what_a_real_run_deletes() {
        let t = Fixture::file();
        t.add("base", SimVhd::new(8 * MIB).hidden());
        t.add("mid", SimVhd::new(8 * MIB).parent("base").hidden());
        t.add("dead", SimVhd::new(8 * MIB).parent("mid").hidden());
        t.add("live", SimVhd::new(8 * MIB).parent("base"));
        t.add("solo", SimVhd::new(8 * MIB).hidden());
        t.journal.create(JournalKind::Zero, "vanished", "1").unwrap();
        let mut sr = t.sr();
        sr.scan(false).await.unwrap();
        let reported = sr.find_garbage().unwrap();
        assert_eq!(reported, vec!["dead", "mid", "solo"]);

        sr.garbage_collect(true).await.unwrap();

        assert_eq!(sr.vdis.len(), 5);
        assert_eq!(t.storage.vhd_paths().len(), 5);
        assert!(t.control.forgotten().is_empty());
        assert!(t.journal.get(JournalKind::Zero, "vanished").unwrap().is_some());
        assert_eq!(sr.find_garbage().unwrap(), reported);

        sr.garbage_collect(false).await.unwrap();

        assert_eq!(t.control.forgotten(), reported);
        for uuid in &reported {
            assert!(sr.vdi(uuid).is_none());
        }
        assert_eq!(t.storage.vhd_paths().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_checks_abort() {
        let t = Fixture::file();
        t.add("base", SimVhd::new(8 * MIB).hidden());
        let mut sr = t.sr();
        sr.scan(false).await.unwrap();
        t.abort.set(SR_UUID).unwrap();

        let res = sr.garbage_collect(false).await;
        assert_eq!(res, Err(GcError::Aborted));
        assert_eq!(t.storage.vhd_paths().len(), 1);
    }
}
