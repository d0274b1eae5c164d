//! Filesystem space queries for file SRs.

use std::path::Path;

use tracing::warn;
use vhdgc_proto::{GcError, GcResult};

/// Space figures of the filesystem holding an SR, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpace {
    pub total: u64,
    pub free: u64,
    /// Free space usable by unprivileged writers.
    pub available: u64,
}

impl DiskSpace {
    /// Bytes in use, as the storage manager counts utilisation.
    pub fn used(&self) -> u64 {
        self.total.saturating_sub(self.free)
    }
}

/// Query the filesystem containing `path`.
pub fn get_disk_space(path: &Path) -> GcResult<DiskSpace> {
    use nix::sys::statvfs::statvfs;

    let stat = statvfs(path).map_err(|e| {
        warn!("statvfs failed for {}: {}", path.display(), e);
        GcError::failed(format!("statvfs {}: {}", path.display(), e))
    })?;

    let block_size = stat.fragment_size() as u64;
    Ok(DiskSpace {
        total: stat.blocks() as u64 * block_size,
        free: stat.blocks_free() as u64 * block_size,
        available: stat.blocks_available() as u64 * block_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_space_of_temp_dir() {
        let space = get_disk_space(&std::env::temp_dir()).unwrap();
        assert!(space.total > 0);
        assert!(space.free <= space.total);
        assert_eq!(space.used(), space.total - space.free);
    }

    #[test]
    fn test_disk_space_missing_path() {
        let path = std::env::temp_dir().join("vhdgc_no_such_dir").join("x");
        assert!(get_disk_space(&path).is_err());
    }
}
