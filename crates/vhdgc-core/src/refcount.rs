//! Activation reference counts.
//!
//! Each `(uuid, namespace)` pair carries a normal count (contexts that
//! need the volume active) and a binary count (0 or 1: the volume is
//! attached as an online leaf). A volume may be deactivated only when
//! both are zero.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use vhdgc_proto::{GcError, GcResult};

/// Persisted pair of counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefCount {
    pub count: u32,
    pub binary: u32,
}

impl RefCount {
    pub fn is_zero(&self) -> bool {
        self.count == 0 && self.binary == 0
    }
}

/// Durable reference counter.
pub trait RefCounter: Send + Sync {
    fn check(&self, uuid: &str, ns: &str) -> GcResult<RefCount>;

    fn set(&self, uuid: &str, count: RefCount, ns: &str) -> GcResult<()>;

    fn reset(&self, uuid: &str, ns: &str) -> GcResult<()>;
}

/// One bincode file per counter at `<dir>/<ns>/<uuid>`.
pub struct FileRefCounter {
    dir: PathBuf,
}

impl FileRefCounter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, uuid: &str, ns: &str) -> PathBuf {
        self.dir.join(ns).join(uuid)
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> GcResult<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

impl RefCounter for FileRefCounter {
    fn check(&self, uuid: &str, ns: &str) -> GcResult<RefCount> {
        let path = self.path(uuid, ns);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(RefCount::default()),
            Err(e) => {
                error!("refcount: failed to read {}: {}", path.display(), e);
                return Err(e.into());
            }
        };
        bincode::deserialize(&data).map_err(|_| {
            error!("refcount: corrupt counter file {}", path.display());
            GcError::failed(format!("corrupt refcount {}", path.display()))
        })
    }

    fn set(&self, uuid: &str, count: RefCount, ns: &str) -> GcResult<()> {
        if count.is_zero() {
            return self.reset(uuid, ns);
        }
        let path = self.path(uuid, ns);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = bincode::serialize(&count)
            .map_err(|e| GcError::failed(format!("refcount encode: {}", e)))?;
        write_atomic(&path, &data)?;
        debug!("refcount: {}/{} = ({}, {})", ns, uuid, count.count, count.binary);
        Ok(())
    }

    fn reset(&self, uuid: &str, ns: &str) -> GcResult<()> {
        match std::fs::remove_file(self.path(uuid, ns)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process counters. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryRefCounter {
    counts: Arc<Mutex<HashMap<(String, String), RefCount>>>,
}

impl MemoryRefCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut HashMap<(String, String), RefCount>) -> T) -> GcResult<T> {
        let mut counts = self
            .counts
            .lock()
            .map_err(|_| GcError::Invariant("refcount mutex poisoned".into()))?;
        Ok(f(&mut counts))
    }
}

impl RefCounter for MemoryRefCounter {
    fn check(&self, uuid: &str, ns: &str) -> GcResult<RefCount> {
        self.with(|c| c.get(&(ns.to_string(), uuid.to_string())).copied().unwrap_or_default())
    }

    fn set(&self, uuid: &str, count: RefCount, ns: &str) -> GcResult<()> {
        self.with(|c| {
            if count.is_zero() {
                c.remove(&(ns.to_string(), uuid.to_string()));
            } else {
                c.insert((ns.to_string(), uuid.to_string()), count);
            }
        })
    }

    fn reset(&self, uuid: &str, ns: &str) -> GcResult<()> {
        self.with(|c| {
            c.remove(&(ns.to_string(), uuid.to_string()));
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_refcount_persists() {
        let dir = tempfile::TempDir::new().unwrap();
        let rc = FileRefCounter::new(dir.path());
        assert_eq!(rc.check("v1", "lvm-sr").unwrap(), RefCount::default());

        rc.set("v1", RefCount { count: 2, binary: 1 }, "lvm-sr").unwrap();
        let again = FileRefCounter::new(dir.path());
        assert_eq!(again.check("v1", "lvm-sr").unwrap(), RefCount { count: 2, binary: 1 });
        assert_eq!(again.check("v1", "lvm-other").unwrap(), RefCount::default());

        again.reset("v1", "lvm-sr").unwrap();
        assert!(rc.check("v1", "lvm-sr").unwrap().is_zero());
        rc.reset("v1", "lvm-sr").unwrap();
    }

    #[test]
    fn test_setting_zero_removes() {
        let dir = tempfile::TempDir::new().unwrap();
        let rc = FileRefCounter::new(dir.path());
        rc.set("v", RefCount { count: 1, binary: 0 }, "ns").unwrap();
        rc.set("v", RefCount::default(), "ns").unwrap();
        assert!(!dir.path().join("ns").join("v").exists());
    }

    #[test]
    fn test_memory_refcount() {
        let rc = MemoryRefCounter::new();
        rc.set("a", RefCount { count: 3, binary: 0 }, "ns").unwrap();
        assert_eq!(rc.clone().check("a", "ns").unwrap().count, 3);
        rc.reset("a", "ns").unwrap();
        assert!(rc.check("a", "ns").unwrap().is_zero());
    }
}
