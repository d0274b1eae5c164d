//! Advisory process locks keyed by `(namespace, name)`.
//!
//! Locks are non-blocking: callers that need to wait retry on their own
//! schedule so they can keep checking the abort flag.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use tracing::debug;
use vhdgc_proto::{GcError, GcResult};

/// Non-blocking advisory lock primitive.
pub trait LockManager: Send + Sync {
    /// Try to take the lock. Returns `false` if anyone holds it,
    /// including this manager.
    fn try_acquire(&self, ns: &str, name: &str) -> GcResult<bool>;

    /// Release a lock taken through this manager.
    fn release(&self, ns: &str, name: &str) -> GcResult<()>;
}

type LockKey = (String, String);

fn poisoned() -> GcError {
    GcError::Invariant("lock table mutex poisoned".into())
}

/// `flock(2)` locks on `<dir>/<ns>/<name>`.
///
/// The file descriptor is kept open while the lock is held; other
/// processes (and other managers in this process) see the lock as busy.
pub struct FileLockManager {
    dir: PathBuf,
    held: Mutex<HashMap<LockKey, File>>,
}

impl FileLockManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            held: Mutex::new(HashMap::new()),
        }
    }

    fn held(&self) -> GcResult<MutexGuard<'_, HashMap<LockKey, File>>> {
        self.held.lock().map_err(|_| poisoned())
    }
}

impl LockManager for FileLockManager {
    fn try_acquire(&self, ns: &str, name: &str) -> GcResult<bool> {
        let key = (ns.to_string(), name.to_string());
        let mut held = self.held()?;
        if held.contains_key(&key) {
            return Ok(false);
        }

        let dir = self.dir.join(ns);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(name);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {}
            Err(e) if e == Errno::EWOULDBLOCK => {
                debug!("lock: {}/{} is busy", ns, name);
                return Ok(false);
            }
            Err(e) => return Err(std::io::Error::from(e).into()),
        }

        debug!("lock: acquired {}/{}", ns, name);
        held.insert(key, file);
        Ok(true)
    }

    fn release(&self, ns: &str, name: &str) -> GcResult<()> {
        let key = (ns.to_string(), name.to_string());
        let Some(file) = self.held()?.remove(&key) else {
            return Err(GcError::Invariant(format!("lock {}/{} not held", ns, name)));
        };
        flock(file.as_raw_fd(), FlockArg::Unlock).map_err(std::io::Error::from)?;
        debug!("lock: released {}/{}", ns, name);
        Ok(())
    }
}

/// In-process lock table. Clones share the table, so each clone behaves
/// like a separate process contending for the same locks.
#[derive(Clone, Default)]
pub struct MemoryLockManager {
    held: Arc<Mutex<HashSet<LockKey>>>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, ns: &str, name: &str) -> bool {
        self.held
            .lock()
            .map(|h| h.contains(&(ns.to_string(), name.to_string())))
            .unwrap_or(false)
    }
}

impl LockManager for MemoryLockManager {
    fn try_acquire(&self, ns: &str, name: &str) -> GcResult<bool> {
        let mut held = self.held.lock().map_err(|_| poisoned())?;
        Ok(held.insert((ns.to_string(), name.to_string())))
    }

    fn release(&self, ns: &str, name: &str) -> GcResult<()> {
        let mut held = self.held.lock().map_err(|_| poisoned())?;
        if !held.remove(&(ns.to_string(), name.to_string())) {
            return Err(GcError::Invariant(format!("lock {}/{} not held", ns, name)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_lock_excludes_second_holder() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = FileLockManager::new(dir.path());
        let b = FileLockManager::new(dir.path());

        assert!(a.try_acquire("sr1", "running").unwrap());
        assert!(!a.try_acquire("sr1", "running").unwrap());
        assert!(!b.try_acquire("sr1", "running").unwrap());
        // Different name, different lock.
        assert!(b.try_acquire("sr1", "sr").unwrap());

        a.release("sr1", "running").unwrap();
        assert!(b.try_acquire("sr1", "running").unwrap());
        assert!(a.release("sr1", "running").is_err());
    }

    #[test]
    fn test_file_lock_released_on_drop() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let a = FileLockManager::new(dir.path());
            assert!(a.try_acquire("sr2", "running").unwrap());
        }
        let b = FileLockManager::new(dir.path());
        assert!(b.try_acquire("sr2", "running").unwrap());
    }

    #[test]
    fn test_memory_lock_shared_between_clones() {
        let a = MemoryLockManager::new();
        let b = a.clone();
        assert!(a.try_acquire("sr", "running").unwrap());
        assert!(!b.try_acquire("sr", "running").unwrap());
        assert!(b.is_held("sr", "running"));
        a.release("sr", "running").unwrap();
        assert!(b.try_acquire("sr", "running").unwrap());
    }
}
