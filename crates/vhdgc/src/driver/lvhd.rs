//! LVHD SR: one logical volume per VDI in the SR's volume group.
//!
//! VHD volumes are kept deflated while idle. Every volume this run
//! activates is reference counted in namespace `lvm-<sr uuid>` and
//! tracked, so [`StorageBackend::cleanup`] can drop exactly the
//! activations taken here.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};
use vhdgc_core::lvm::{calc_size_lv, calc_size_vhd_lv, lv_name};
use vhdgc_core::{Journal, LvBackend, RefCounter, VhdBackend};
use vhdgc_proto::constants::{LV_PREFIX_JOURNAL, MAX_VHD_JOURNAL_SIZE, NS_PREFIX_LVM};
use vhdgc_proto::{GcError, GcResult, JournalKind, VdiType};

use super::StorageBackend;
use crate::abortable::AbortScope;
use crate::vdi::{Backing, LvState, Vdi};

pub struct LvhdDriver {
    sr_uuid: String,
    vg: String,
    lv: Arc<dyn LvBackend>,
    vhd: Arc<dyn VhdBackend>,
    refcount: Arc<dyn RefCounter>,
    journal: Arc<dyn Journal>,
    abort: AbortScope,
    /// `(uuid, lv name)` of every volume activated by this run.
    activated: Mutex<Vec<(String, String)>>,
}

impl LvhdDriver {
    pub fn new(
        sr_uuid: &str,
        vg: &str,
        lv: Arc<dyn LvBackend>,
        vhd: Arc<dyn VhdBackend>,
        refcount: Arc<dyn RefCounter>,
        journal: Arc<dyn Journal>,
        abort: AbortScope,
    ) -> Self {
        Self {
            sr_uuid: sr_uuid.to_string(),
            vg: vg.to_string(),
            lv,
            vhd,
            refcount,
            journal,
            abort,
            activated: Mutex::new(Vec::new()),
        }
    }

    pub fn vg(&self) -> &str {
        &self.vg
    }

    pub fn lv_backend(&self) -> &Arc<dyn LvBackend> {
        &self.lv
    }

    pub fn refcount(&self) -> &Arc<dyn RefCounter> {
        &self.refcount
    }

    /// Refcount namespace of this SR.
    pub fn ns(&self) -> String {
        format!("{}{}", NS_PREFIX_LVM, self.sr_uuid)
    }

    fn activated(&self) -> GcResult<MutexGuard<'_, Vec<(String, String)>>> {
        self.activated
            .lock()
            .map_err(|_| GcError::Invariant("activation list mutex poisoned".into()))
    }

    fn lv_state(vdi: &Vdi) -> GcResult<&LvState> {
        vdi.lv()
            .ok_or_else(|| GcError::Invariant(format!("VDI {} has no volume", vdi.uuid)))
    }

    fn lv_state_mut(vdi: &mut Vdi) -> GcResult<&mut LvState> {
        let uuid = vdi.uuid.clone();
        vdi.lv_mut()
            .ok_or_else(|| GcError::Invariant(format!("VDI {} has no volume", uuid)))
    }

    /// Activate the VDI's volume once per run, taking a reference.
    pub async fn activate(&self, vdi: &mut Vdi) -> GcResult<()> {
        if self.activated()?.iter().any(|(u, _)| *u == vdi.uuid) {
            return Ok(());
        }
        let lv_name = Self::lv_state(vdi)?.lv_name.clone();
        let ns = self.ns();
        let mut rc = self.refcount.check(&vdi.uuid, &ns)?;
        rc.count += 1;
        self.refcount.set(&vdi.uuid, rc, &ns)?;
        if let Err(e) = self.lv.activate(&self.vg, &lv_name).await {
            rc.count -= 1;
            self.refcount.set(&vdi.uuid, rc, &ns)?;
            return Err(e);
        }
        self.activated()?.push((vdi.uuid.clone(), lv_name));
        Self::lv_state_mut(vdi)?.active = true;
        debug!("lvhd: activated {}", vdi.uuid);
        Ok(())
    }

    /// Drop the references taken by [`activate`](Self::activate) and
    /// deactivate volumes nobody else holds.
    pub async fn deactivate_all(&self) -> GcResult<()> {
        let tracked: Vec<(String, String)> = std::mem::take(&mut *self.activated()?);
        let ns = self.ns();
        let mut first_err = None;
        for (uuid, lv_name) in tracked {
            let res = async {
                let mut rc = self.refcount.check(&uuid, &ns)?;
                rc.count = rc.count.saturating_sub(1);
                self.refcount.set(&uuid, rc, &ns)?;
                if rc.is_zero() && self.lv.exists(&self.vg, &lv_name).await? {
                    self.lv.deactivate(&self.vg, &lv_name).await?;
                }
                Ok::<_, GcError>(())
            }
            .await;
            if let Err(e) = res {
                error!("lvhd: failed to release {}: {}", uuid, e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Grow the volume to `size`. A `zero` journal entry holding the old
    /// size covers the grow.
    pub async fn inflate(&self, vdi: &mut Vdi, size: u64) -> GcResult<()> {
        let lv = Self::lv_state(vdi)?;
        if lv.size_lv >= size {
            return Ok(());
        }
        let old_size = lv.size_lv;
        let lv_name = lv.lv_name.clone();
        info!("lvhd: inflating {} from {} to {}", vdi.uuid, old_size, size);

        self.journal.remove(JournalKind::Zero, &vdi.uuid)?;
        self.journal
            .create(JournalKind::Zero, &vdi.uuid, &old_size.to_string())?;
        let backend = self.lv.clone();
        let vg = self.vg.clone();
        self.abort
            .run(None, move |_| async move { backend.inflate(&vg, &lv_name, size).await })
            .await?;
        self.journal.remove(JournalKind::Zero, &vdi.uuid)?;
        Self::lv_state_mut(vdi)?.size_lv = size;
        Ok(())
    }

    /// Shrink the volume to fit its VHD.
    pub async fn deflate(&self, vdi: &mut Vdi) -> GcResult<()> {
        if vdi.is_raw() {
            return Ok(());
        }
        let size_vhd = self.vhd.size_phys(&vdi.path).await?;
        vdi.size_vhd = Some(size_vhd);
        let size = calc_size_lv(size_vhd);
        let lv = Self::lv_state(vdi)?;
        if lv.size_lv <= size {
            return Ok(());
        }
        debug!("lvhd: deflating {} from {} to {}", vdi.uuid, lv.size_lv, size);
        let lv_name = lv.lv_name.clone();
        self.lv.deflate(&self.vg, &lv_name, size).await?;
        Self::lv_state_mut(vdi)?.size_lv = size;
        Ok(())
    }

    /// Inflate to the size of a fully allocated VHD.
    pub async fn inflate_fully(&self, vdi: &mut Vdi) -> GcResult<()> {
        if vdi.is_raw() {
            return Ok(());
        }
        let size = calc_size_vhd_lv(vdi.size_virt);
        self.inflate(vdi, size).await
    }

    pub async fn set_readonly(&self, vdi: &mut Vdi, readonly: bool) -> GcResult<()> {
        let lv = Self::lv_state(vdi)?;
        if lv.readonly == readonly {
            return Ok(());
        }
        let lv_name = lv.lv_name.clone();
        self.lv.set_readonly(&self.vg, &lv_name, readonly).await?;
        Self::lv_state_mut(vdi)?.readonly = readonly;
        Ok(())
    }

    /// Rename the VDI's volume to the name of `new_uuid`, carrying its
    /// refcounts and activation along.
    pub async fn rename(&self, vdi: &mut Vdi, new_uuid: &str) -> GcResult<()> {
        let lv = Self::lv_state(vdi)?;
        let vdi_type = if lv.raw { VdiType::Raw } else { VdiType::Vhd };
        let old_name = lv.lv_name.clone();
        let new_name = lv_name(new_uuid, vdi_type);
        info!("lvhd: renaming {} to {}", old_name, new_name);
        self.lv.rename(&self.vg, &old_name, &new_name).await?;

        let ns = self.ns();
        let rc = self.refcount.check(&vdi.uuid, &ns)?;
        self.refcount.set(new_uuid, rc, &ns)?;
        self.refcount.reset(&vdi.uuid, &ns)?;
        for entry in self.activated()?.iter_mut().filter(|(u, _)| *u == vdi.uuid) {
            *entry = (new_uuid.to_string(), new_name.clone());
        }

        vdi.uuid = new_uuid.to_string();
        vdi.path = self.lv.lv_path(&self.vg, &new_name);
        Self::lv_state_mut(vdi)?.lv_name = new_name;
        Ok(())
    }

    fn to_vdi(&self, info: vhdgc_core::LvVdiInfo) -> Vdi {
        let raw = info.vdi_type == VdiType::Raw;
        Vdi {
            path: self.lv.lv_path(&self.vg, &info.lv_name),
            uuid: info.uuid,
            parent_uuid: info.parent_uuid,
            parent: None,
            children: Vec::new(),
            size_virt: info.size_virt,
            size_vhd: raw.then_some(info.size_lv),
            hidden: info.hidden,
            scan_error: info.scan_error,
            backing: Backing::Lvm(LvState {
                lv_name: info.lv_name,
                size_lv: info.size_lv,
                active: info.active,
                readonly: info.readonly,
                raw,
            }),
        }
    }
}

#[async_trait]
impl StorageBackend for LvhdDriver {
    fn name(&self) -> &str {
        "lvhd"
    }

    async fn scan_once(&self) -> GcResult<Vec<Vdi>> {
        self.lv.refresh(&self.vg).await?;
        let infos = self.lv.scan_vdis(&self.vg).await?;
        Ok(infos
            .into_iter()
            .map(|info| {
                if info.scan_error {
                    error!("scan: error reading {}/{}", self.vg, info.lv_name);
                }
                self.to_vdi(info)
            })
            .collect())
    }

    async fn free_space(&self) -> GcResult<u64> {
        Ok(self.lv.vg_stats(&self.vg).await?.free())
    }

    async fn size_vhd(&self, vdi: &Vdi) -> GcResult<u64> {
        if vdi.is_raw() {
            return Ok(Self::lv_state(vdi)?.size_lv);
        }
        self.vhd.size_phys(&vdi.path).await
    }

    async fn set_hidden(&self, vdi: &mut Vdi, hidden: bool) -> GcResult<()> {
        if vdi.is_raw() {
            let lv_name = Self::lv_state(vdi)?.lv_name.clone();
            self.lv.set_hidden(&self.vg, &lv_name, hidden).await?;
        } else {
            self.vhd.set_hidden(&vdi.path, hidden).await?;
        }
        vdi.hidden = hidden;
        Ok(())
    }

    async fn set_parent(&self, child: &Vdi, parent: &Vdi) -> GcResult<()> {
        self.vhd
            .set_parent(&child.path, &parent.path, parent.is_raw())
            .await
    }

    async fn set_size_virt(&self, vdi: &mut Vdi, size: u64) -> GcResult<()> {
        self.inflate(vdi, calc_size_vhd_lv(size)).await?;

        let jname = format!("{}{}", LV_PREFIX_JOURNAL, vdi.uuid);
        if self.lv.exists(&self.vg, &jname).await? {
            warn!("lvhd: removing leftover resize journal {}", jname);
            self.lv.remove(&self.vg, &jname).await?;
        }
        self.lv.create(&self.vg, &jname, MAX_VHD_JOURNAL_SIZE).await?;
        let jpath = self.lv.lv_path(&self.vg, &jname);
        let res = self.vhd.set_size_virt(&vdi.path, size, &jpath).await;
        if let Err(e) = self.lv.remove(&self.vg, &jname).await {
            error!("lvhd: failed to remove resize journal {}: {}", jname, e);
        }
        res?;
        vdi.size_virt = size;
        Ok(())
    }

    async fn delete(&self, vdi: &Vdi) -> GcResult<()> {
        let lv_name = Self::lv_state(vdi)?.lv_name.clone();
        debug!("lvhd: removing {}/{}", self.vg, lv_name);
        self.lv.remove(&self.vg, &lv_name).await?;
        self.refcount.reset(&vdi.uuid, &self.ns())?;
        self.activated()?.retain(|(u, _)| *u != vdi.uuid);
        Ok(())
    }

    async fn cleanup(&self) -> GcResult<()> {
        self.deactivate_all().await
    }

    fn vhd(&self) -> &Arc<dyn VhdBackend> {
        &self.vhd
    }
}


#[cfg(test)]
mod tests {
    use vhdgc_core::lvm::calc_size_lv;
    use vhdgc_core::sim::SimVhd;
    use vhdgc_core::RefCount;

    use super::*;
    use crate::testutil::{Fixture, MIB};

    #[tokio::test]
    async fn test_activation_counted_once_per_run() {
        let t = Fixture::lvhd();
        t.add("p1", SimVhd::new(8 * MIB).blocks(&[0]));
        let mut sr = t.sr();
        sr.scan(false).await.unwrap();

        sr.activate("p1").await.unwrap();
        sr.activate("p1").await.unwrap();
        assert_eq!(t.refcount_of("p1").count, 1);
        assert!(t.storage.lv(&t.vg(), "VHD-p1").unwrap().active);

        sr.cleanup().await;
        assert!(t.refcount_of("p1").is_zero());
        assert!(!t.storage.lv(&t.vg(), "VHD-p1").unwrap().active);
    }

    #[tokio::test]
    async fn test_cleanup_leaves_volume_used_elsewhere() {
        let t = Fixture::lvhd();
        t.add("p1", SimVhd::new(8 * MIB));
        t.refcount
            .set("p1", RefCount { count: 1, binary: 0 }, "lvm-sr1")
            .unwrap();
        let mut sr = t.sr();
        sr.scan(false).await.unwrap();

        sr.activate("p1").await.unwrap();
        assert_eq!(t.refcount_of("p1").count, 2);
        sr.cleanup().await;

        assert_eq!(t.refcount_of("p1").count, 1);
        assert!(t.storage.lv(&t.vg(), "VHD-p1").unwrap().active);
    }

    #[tokio::test]
    async fn test_inflate_and_deflate() {
        let t = Fixture::lvhd();
        t.add("p1", SimVhd::new(8 * MIB).blocks(&[0, 1]));
        let mut sr = t.sr();
        sr.scan(false).await.unwrap();
        let size_phys = t.storage.vhd(&sr.vdi("p1").unwrap().path).unwrap().size_phys();
        let small = calc_size_lv(size_phys);

        sr.inflate("p1", small + 16 * MIB).await.unwrap();
        assert_eq!(t.storage.lv(&t.vg(), "VHD-p1").unwrap().size, small + 16 * MIB);
        assert!(t.journal.get(JournalKind::Zero, "p1").unwrap().is_none());

        // never shrinks
        sr.inflate("p1", small).await.unwrap();
        assert_eq!(sr.vdi("p1").unwrap().lv().unwrap().size_lv, small + 16 * MIB);

        sr.deflate("p1").await.unwrap();
        assert_eq!(t.storage.lv(&t.vg(), "VHD-p1").unwrap().size, small);
        assert_eq!(sr.vdi("p1").unwrap().lv().unwrap().size_lv, small);
        sr.cleanup().await;
    }

    #[tokio::test]
    async fn test_raw_volume_is_not_deflated() {
        let t = Fixture::lvhd();
        t.storage.add_lv_raw(&t.vg(), "r1", 8 * MIB, false);
        let mut sr = t.sr();
        sr.scan(false).await.unwrap();
        assert!(sr.vdi("r1").unwrap().is_raw());

        sr.deflate("r1").await.unwrap();
        assert_eq!(t.storage.lv(&t.vg(), "LV-r1").unwrap().size, 8 * MIB);
        sr.cleanup().await;
    }

    #[tokio::test]
    async fn test_rename_moves_refcount_and_activation() {
        let t = Fixture::lvhd();
        t.add("p1", SimVhd::new(8 * MIB).hidden());
        t.add("c1", SimVhd::new(8 * MIB).parent("p1"));
        let mut sr = t.sr();
        sr.scan(false).await.unwrap();
        sr.activate("c1").await.unwrap();

        sr.rename_vdi("c1", "OLD_c1").await.unwrap();

        assert!(t.storage.lv(&t.vg(), "VHD-c1").is_none());
        assert!(t.storage.lv(&t.vg(), "VHD-OLD_c1").is_some());
        assert!(t.refcount_of("c1").is_zero());
        assert_eq!(t.refcount_of("OLD_c1").count, 1);
        assert_eq!(sr.vdi("p1").unwrap().children, vec!["OLD_c1"]);
        assert_eq!(sr.vdi("OLD_c1").unwrap().lv().unwrap().lv_name, "VHD-OLD_c1");

        sr.cleanup().await;
        assert!(t.refcount_of("OLD_c1").is_zero());
    }

    #[tokio::test]
    async fn test_delete_drops_volume_and_counts() {
        let t = Fixture::lvhd();
        t.add("p1", SimVhd::new(8 * MIB).hidden());
        let mut sr = t.sr();
        sr.scan(false).await.unwrap();
        sr.activate("p1").await.unwrap();

        sr.delete_vdi("p1").await.unwrap();

        assert!(t.storage.lv(&t.vg(), "VHD-p1").is_none());
        assert!(t.refcount_of("p1").is_zero());
        assert_eq!(t.control.forgotten(), vec!["p1"]);
        sr.cleanup().await;
        assert!(t.refcount_of("p1").is_zero());
    }
}
