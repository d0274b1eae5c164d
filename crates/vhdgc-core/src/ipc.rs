//! SR-scoped abort flag shared between processes.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};
use vhdgc_proto::constants::FLAG_TYPE_ABORT;
use vhdgc_proto::{GcError, GcResult};

/// Cooperative cancellation flag, one per SR.
pub trait AbortSignal: Send + Sync {
    /// Raise the flag. Returns `false` if it was already set.
    fn set(&self, sr_uuid: &str) -> GcResult<bool>;

    fn clear(&self, sr_uuid: &str) -> GcResult<()>;

    /// Whether the flag is raised. Errors reading the flag count as not set.
    fn test(&self, sr_uuid: &str) -> bool;
}

/// Flag files `<dir>/<sr uuid>/abort`.
pub struct FileAbortFlag {
    dir: PathBuf,
}

impl FileAbortFlag {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn flag_path(&self, sr_uuid: &str) -> PathBuf {
        self.dir.join(sr_uuid).join(FLAG_TYPE_ABORT)
    }
}

impl AbortSignal for FileAbortFlag {
    fn set(&self, sr_uuid: &str) -> GcResult<bool> {
        let path = self.flag_path(sr_uuid);
        if path.exists() {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, b"")?;
        info!("abort flag set for SR {}", sr_uuid);
        Ok(true)
    }

    fn clear(&self, sr_uuid: &str) -> GcResult<()> {
        match std::fs::remove_file(self.flag_path(sr_uuid)) {
            Ok(()) => {
                debug!("abort flag cleared for SR {}", sr_uuid);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn test(&self, sr_uuid: &str) -> bool {
        self.flag_path(sr_uuid).exists()
    }
}

/// In-process abort flags. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryAbortFlag {
    set: Arc<Mutex<HashSet<String>>>,
}

impl MemoryAbortFlag {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AbortSignal for MemoryAbortFlag {
    fn set(&self, sr_uuid: &str) -> GcResult<bool> {
        let mut set = self
            .set
            .lock()
            .map_err(|_| GcError::Invariant("abort flag mutex poisoned".into()))?;
        Ok(set.insert(sr_uuid.to_string()))
    }

    fn clear(&self, sr_uuid: &str) -> GcResult<()> {
        let mut set = self
            .set
            .lock()
            .map_err(|_| GcError::Invariant("abort flag mutex poisoned".into()))?;
        set.remove(sr_uuid);
        Ok(())
    }

    fn test(&self, sr_uuid: &str) -> bool {
        self.set.lock().map(|s| s.contains(sr_uuid)).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_flag() {
        let dir = tempfile::TempDir::new().unwrap();
        let flag = FileAbortFlag::new(dir.path());
        let other = FileAbortFlag::new(dir.path());

        assert!(!flag.test("sr1"));
        assert!(flag.set("sr1").unwrap());
        assert!(!flag.set("sr1").unwrap());
        assert!(other.test("sr1"));
        assert!(!other.test("sr2"));

        other.clear("sr1").unwrap();
        assert!(!flag.test("sr1"));
        flag.clear("sr1").unwrap();
    }

    #[test]
    fn test_memory_flag() {
        let flag = MemoryAbortFlag::new();
        let view = flag.clone();
        assert!(flag.set("sr").unwrap());
        assert!(view.test("sr"));
        view.clear("sr").unwrap();
        assert!(!flag.test("sr"));
    }
}
