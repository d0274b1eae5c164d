//! Logical volume capability for LVHD SRs.
//!
//! Every VDI of an LVHD SR lives in its own LV named `VHD-<uuid>` (VHD
//! format) or `LV-<uuid>` (raw). VHD LVs are kept deflated to their
//! physical size while not in use and inflated to the full VHD size when
//! they are written to.

use std::path::PathBuf;

use async_trait::async_trait;
use vhdgc_proto::constants::{LVM_SIZE_INCREMENT, LV_PREFIX_RAW, LV_PREFIX_VHD, VG_PREFIX};
use vhdgc_proto::{GcResult, VdiType};

use crate::vhd::calc_overhead_full;

/// One VDI as enumerated from the volume group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LvVdiInfo {
    pub uuid: String,
    pub lv_name: String,
    pub vdi_type: VdiType,
    pub size_lv: u64,
    pub size_virt: u64,
    pub hidden: bool,
    pub active: bool,
    pub readonly: bool,
    /// Empty when the VDI has no parent.
    pub parent_uuid: String,
    pub scan_error: bool,
}

/// Volume group usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VgStats {
    pub physical_size: u64,
    pub physical_utilisation: u64,
}

impl VgStats {
    pub fn free(&self) -> u64 {
        self.physical_size.saturating_sub(self.physical_utilisation)
    }
}

/// Operations on the logical volumes of one volume group.
#[async_trait]
pub trait LvBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Drop cached LVM metadata.
    async fn refresh(&self, vg: &str) -> GcResult<()>;

    /// Enumerate every VDI volume in the group in one batch.
    async fn scan_vdis(&self, vg: &str) -> GcResult<Vec<LvVdiInfo>>;

    async fn exists(&self, vg: &str, lv: &str) -> GcResult<bool>;

    async fn create(&self, vg: &str, lv: &str, size: u64) -> GcResult<()>;

    async fn remove(&self, vg: &str, lv: &str) -> GcResult<()>;

    async fn rename(&self, vg: &str, old: &str, new: &str) -> GcResult<()>;

    async fn size(&self, vg: &str, lv: &str) -> GcResult<u64>;

    /// Grow a VHD volume to `size` and move the VHD footer to the new end.
    async fn inflate(&self, vg: &str, lv: &str, size: u64) -> GcResult<()>;

    /// Shrink a VHD volume to `size`, which covers the VHD's physical size.
    async fn deflate(&self, vg: &str, lv: &str, size: u64) -> GcResult<()>;

    async fn activate(&self, vg: &str, lv: &str) -> GcResult<()>;

    async fn deactivate(&self, vg: &str, lv: &str) -> GcResult<()>;

    /// Hidden flag stored in LV metadata (used for raw volumes).
    async fn set_hidden(&self, vg: &str, lv: &str, hidden: bool) -> GcResult<()>;

    async fn set_readonly(&self, vg: &str, lv: &str, readonly: bool) -> GcResult<()>;

    async fn vg_stats(&self, vg: &str) -> GcResult<VgStats>;

    /// Device node of a volume.
    fn lv_path(&self, vg: &str, lv: &str) -> PathBuf {
        PathBuf::from("/dev").join(vg).join(lv)
    }
}

/// Volume group name of an LVHD SR.
pub fn vg_name(sr_uuid: &str) -> String {
    format!("{}{}", VG_PREFIX, sr_uuid)
}

/// LV name of a VDI.
pub fn lv_name(uuid: &str, vdi_type: VdiType) -> String {
    match vdi_type {
        VdiType::Vhd => format!("{}{}", LV_PREFIX_VHD, uuid),
        VdiType::Raw => format!("{}{}", LV_PREFIX_RAW, uuid),
    }
}

/// Split an LV name into uuid and type; `None` for non-VDI volumes.
pub fn parse_lv_name(name: &str) -> Option<(String, VdiType)> {
    if let Some(uuid) = name.strip_prefix(LV_PREFIX_VHD) {
        Some((uuid.to_string(), VdiType::Vhd))
    } else {
        name.strip_prefix(LV_PREFIX_RAW)
            .map(|uuid| (uuid.to_string(), VdiType::Raw))
    }
}

/// LV size needed to hold a VHD of physical size `size_vhd`.
pub fn calc_size_lv(size_vhd: u64) -> u64 {
    size_vhd.div_ceil(LVM_SIZE_INCREMENT) * LVM_SIZE_INCREMENT
}

/// LV size of a fully inflated VHD of virtual size `size_virt`.
pub fn calc_size_vhd_lv(size_virt: u64) -> u64 {
    calc_size_lv(calc_overhead_full(size_virt) + size_virt)
}
