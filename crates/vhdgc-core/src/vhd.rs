//! VHD format capability.
//!
//! Paths identify a VHD: a file in a file SR, or the device node of a
//! logical volume in an LVHD SR. Parent pointers are reported as the
//! parent's uuid, derived from the parent's file or volume name.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use vhdgc_proto::constants::{FILE_EXTN_VHD, LV_PREFIX_RAW, LV_PREFIX_VHD, VHD_BLOCK_SIZE};
use vhdgc_proto::GcResult;

use crate::space::get_disk_space;

/// Metadata of one VHD as read by a batch scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhdInfo {
    pub uuid: String,
    pub path: PathBuf,
    /// Empty when the VHD has no parent.
    pub parent_uuid: String,
    pub size_virt: u64,
    pub size_phys: u64,
    pub hidden: bool,
    /// The metadata could not be read.
    pub error: bool,
}

/// Operations on VHD images.
#[async_trait]
pub trait VhdBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Read all VHDs in `dir` whose file name matches `pattern` (a shell
    /// glob). Unreadable entries are returned with `error` set.
    async fn scan(&self, dir: &Path, pattern: &str) -> GcResult<Vec<VhdInfo>>;

    async fn info(&self, path: &Path) -> GcResult<VhdInfo>;

    /// Parent uuid, or `None` for a base VHD.
    async fn parent(&self, path: &Path) -> GcResult<Option<String>>;

    async fn set_parent(&self, path: &Path, parent: &Path, parent_raw: bool) -> GcResult<()>;

    async fn set_hidden(&self, path: &Path, hidden: bool) -> GcResult<()>;

    async fn size_virt(&self, path: &Path) -> GcResult<u64>;

    async fn size_phys(&self, path: &Path) -> GcResult<u64>;

    /// Largest virtual size reachable without relocating metadata.
    async fn max_resize_size(&self, path: &Path) -> GcResult<u64>;

    /// In-place resize within [`max_resize_size`](Self::max_resize_size).
    async fn set_size_virt_fast(&self, path: &Path, size: u64) -> GcResult<()>;

    /// Journaled resize; `journal` is scratch space for the resize journal.
    async fn set_size_virt(&self, path: &Path, size: u64, journal: &Path) -> GcResult<()>;

    /// Merge the VHD at `path` into its parent.
    async fn coalesce(&self, path: &Path) -> GcResult<()>;

    /// Uncompressed block allocation bitmap, one bit per block, MSB first.
    async fn block_bitmap(&self, path: &Path) -> GcResult<Vec<u8>>;

    /// Verify the integrity of the VHD.
    async fn check(&self, path: &Path) -> GcResult<()>;

    async fn repair(&self, path: &Path) -> GcResult<()>;

    /// Remove a VHD file.
    async fn destroy(&self, path: &Path) -> GcResult<()>;

    /// Free bytes on the filesystem holding `dir`.
    async fn free_space(&self, dir: &Path) -> GcResult<u64> {
        Ok(get_disk_space(dir)?.available)
    }

    fn overhead_bitmap(&self, size: u64) -> u64 {
        calc_overhead_bitmap(size)
    }

    fn overhead_empty(&self, size_virt: u64) -> u64 {
        calc_overhead_empty(size_virt)
    }
}

fn roundup(divisor: u64, value: u64) -> u64 {
    value.div_ceil(divisor) * divisor
}

/// Metadata overhead of an empty VHD: footer, header, parent locators,
/// the BAT and the batmap.
pub fn calc_overhead_empty(size_virt: u64) -> u64 {
    let size_mb = size_virt / (1024 * 1024);
    let mut overhead = 3 * 1024;
    overhead += (size_mb / 2) * 4;
    overhead = roundup(512, overhead);
    overhead += (size_mb / 2) / 8;
    roundup(4096, overhead)
}

/// Sector bitmap overhead for `size` bytes of allocated data.
pub fn calc_overhead_bitmap(size: u64) -> u64 {
    size.div_ceil(VHD_BLOCK_SIZE) * 4096
}

pub fn calc_overhead_full(size_virt: u64) -> u64 {
    calc_overhead_empty(size_virt) + calc_overhead_bitmap(size_virt)
}

/// The VDI uuid encoded in a VHD file or LV name.
pub fn uuid_from_path(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let name = name.strip_suffix(FILE_EXTN_VHD).unwrap_or(name);
    let name = name
        .strip_prefix(LV_PREFIX_VHD)
        .or_else(|| name.strip_prefix(LV_PREFIX_RAW))
        .unwrap_or(name);
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overhead_empty() {
        // 1 GiB: 3 KiB + 512*4 B of BAT rounded to 512, plus 64 B batmap,
        // rounded to 4 KiB.
        assert_eq!(calc_overhead_empty(1024 * 1024 * 1024), 8192);
        assert_eq!(calc_overhead_empty(0), 4096);
    }

    #[test]
    fn test_overhead_bitmap() {
        assert_eq!(calc_overhead_bitmap(0), 0);
        assert_eq!(calc_overhead_bitmap(1), 4096);
        assert_eq!(calc_overhead_bitmap(VHD_BLOCK_SIZE), 4096);
        assert_eq!(calc_overhead_bitmap(VHD_BLOCK_SIZE + 1), 8192);
        assert_eq!(
            calc_overhead_full(VHD_BLOCK_SIZE * 4),
            calc_overhead_empty(VHD_BLOCK_SIZE * 4) + 4 * 4096
        );
    }

    #[test]
    fn test_uuid_from_path() {
        assert_eq!(uuid_from_path(Path::new("/sr/abc.vhd")).as_deref(), Some("abc"));
        assert_eq!(uuid_from_path(Path::new("/dev/VG/VHD-abc")).as_deref(), Some("abc"));
        assert_eq!(uuid_from_path(Path::new("/dev/VG/LV-abc")).as_deref(), Some("abc"));
        assert_eq!(
            uuid_from_path(Path::new("/dev/VG/VHD-OLD_abc")).as_deref(),
            Some("OLD_abc")
        );
        assert_eq!(uuid_from_path(Path::new("/")), None);
    }
}
