//! Per-SR crash-durable journal of in-flight operations.
//!
//! Entries are keyed by `(kind, object uuid)` and carry a short string
//! value. Multi-step operations write an entry before their first
//! destructive step and remove it after the last one, so an interrupted
//! operation is found again on the next run.
//!
//! ## Journal file format
//!
//! The journal is a fixed-size memory-mapped file holding a log of
//! create and remove records. Opening the file replays the log into an
//! in-memory map. When the log fills up it is compacted into a fresh
//! file holding one create record per live entry, which then replaces
//! the old file by rename.
//!
//! A header at offset 0 stores:
//! ```text
//! +----------+----------+
//! | magic(4) | tail (8) |
//! +----------+----------+
//! ```
//!
//! Each record has the following layout:
//!
//! ```text
//! +----------+-------+---------+-----------+-----------+----+-------+
//! | magic(4) | op(1) | kind(1) | id_len(2) | val_len(4)| id | value |
//! +----------+-------+---------+-----------+-----------+----+-------+
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use memmap2::MmapMut;
use tracing::{debug, error, info, warn};
use vhdgc_proto::{GcError, GcResult, JournalKind};

/// Magic number for journal header validation.
const JOURNAL_MAGIC: u32 = 0x5647_4A4C; // "VGJL"

/// Magic number for journal records.
const ENTRY_MAGIC: u32 = 0x5647_5245; // "VGRE"

/// Size of the journal header.
const HEADER_SIZE: usize = 12; // magic(4) + tail(8)

/// Size of a record header (before id and value).
const ENTRY_HEADER_SIZE: usize = 12; // magic(4) + op(1) + kind(1) + id_len(2) + val_len(4)

const OP_CREATE: u8 = 1;
const OP_REMOVE: u8 = 2;

/// Journal operations used by the engine.
pub trait Journal: Send + Sync {
    /// Record an entry. Fails if an entry with the same key exists.
    fn create(&self, kind: JournalKind, id: &str, value: &str) -> GcResult<()>;

    /// Remove an entry. Removing a missing entry is a no-op.
    fn remove(&self, kind: JournalKind, id: &str) -> GcResult<()>;

    fn get(&self, kind: JournalKind, id: &str) -> GcResult<Option<String>>;

    /// All entries of one kind, keyed by object uuid.
    fn get_all(&self, kind: JournalKind) -> GcResult<BTreeMap<String, String>>;
}

type EntryMap = BTreeMap<(JournalKind, String), String>;

struct Inner {
    mmap: MmapMut,
    entries: EntryMap,
}

/// Journal backed by a memory-mapped file.
pub struct MmapJournal {
    inner: Mutex<Inner>,
    /// Path to the journal file.
    path: PathBuf,
    /// Total size of the journal file in bytes.
    size: usize,
}

impl MmapJournal {
    /// Open or create a journal file at `path` with the given `size` in bytes.
    ///
    /// An existing journal is replayed; a file without a valid header is
    /// initialized empty.
    pub fn open(path: &Path, size: usize) -> GcResult<Self> {
        if size < HEADER_SIZE + ENTRY_HEADER_SIZE {
            return Err(GcError::Config(format!("journal size {} too small", size)));
        }
        let mut mmap = map_file(path, size)?;

        let magic = u32::from_le_bytes(read_array(&mmap, 0));
        let entries = if magic != JOURNAL_MAGIC {
            init_header(&mut mmap)?;
            info!("journal: initialized new journal at {}", path.display());
            EntryMap::new()
        } else {
            let entries = replay(&mmap);
            info!(
                "journal: opened {} with {} live entries",
                path.display(),
                entries.len()
            );
            entries
        };

        Ok(Self {
            inner: Mutex::new(Inner { mmap, entries }),
            path: path.to_path_buf(),
            size,
        })
    }

    fn lock(&self) -> GcResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| GcError::Invariant("journal mutex poisoned".into()))
    }

    /// Append a record, compacting the file once if it is full.
    fn append(&self, inner: &mut Inner, op: u8, kind: JournalKind, id: &str, value: &str) -> GcResult<()> {
        if append_record(&mut inner.mmap, self.size, op, kind, id, value).is_none() {
            self.compact(inner)?;
            if append_record(&mut inner.mmap, self.size, op, kind, id, value).is_none() {
                warn!("journal: no space for {} entry of {}", kind, id);
                return Err(GcError::failed(format!(
                    "journal {} is full",
                    self.path.display()
                )));
            }
        }
        inner.mmap.flush().map_err(|e| {
            error!("journal: failed to flush {}: {}", self.path.display(), e);
            GcError::from(e)
        })
    }

    /// Rewrite the live entries into a fresh file and swap it in.
    fn compact(&self, inner: &mut Inner) -> GcResult<()> {
        let tmp = self.path.with_extension("compact");
        let _ = std::fs::remove_file(&tmp);
        let mut fresh = map_file(&tmp, self.size)?;
        init_header(&mut fresh)?;
        for ((kind, id), value) in &inner.entries {
            if append_record(&mut fresh, self.size, OP_CREATE, *kind, id, value).is_none() {
                let _ = std::fs::remove_file(&tmp);
                return Err(GcError::failed(format!(
                    "journal {} cannot hold {} live entries",
                    self.path.display(),
                    inner.entries.len()
                )));
            }
        }
        fresh.flush()?;
        std::fs::rename(&tmp, &self.path)?;
        inner.mmap = fresh;
        debug!("journal: compacted {} ({} entries)", self.path.display(), inner.entries.len());
        Ok(())
    }

    /// Bytes of log in use.
    pub fn used_bytes(&self) -> GcResult<usize> {
        let inner = self.lock()?;
        Ok(read_tail(&inner.mmap) - HEADER_SIZE)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Journal for MmapJournal {
    fn create(&self, kind: JournalKind, id: &str, value: &str) -> GcResult<()> {
        let mut inner = self.lock()?;
        let key = (kind, id.to_string());
        if let Some(existing) = inner.entries.get(&key) {
            return Err(GcError::failed(format!(
                "journal entry {}/{} already exists ({})",
                kind, id, existing
            )));
        }
        self.append(&mut inner, OP_CREATE, kind, id, value)?;
        inner.entries.insert(key, value.to_string());
        debug!("journal: created {}/{} = {}", kind, id, value);
        Ok(())
    }

    fn remove(&self, kind: JournalKind, id: &str) -> GcResult<()> {
        let mut inner = self.lock()?;
        let key = (kind, id.to_string());
        if !inner.entries.contains_key(&key) {
            debug!("journal: no {}/{} entry to remove", kind, id);
            return Ok(());
        }
        self.append(&mut inner, OP_REMOVE, kind, id, "")?;
        inner.entries.remove(&key);
        debug!("journal: removed {}/{}", kind, id);
        Ok(())
    }

    fn get(&self, kind: JournalKind, id: &str) -> GcResult<Option<String>> {
        let inner = self.lock()?;
        Ok(inner.entries.get(&(kind, id.to_string())).cloned())
    }

    fn get_all(&self, kind: JournalKind) -> GcResult<BTreeMap<String, String>> {
        let inner = self.lock()?;
        Ok(entries_of(&inner.entries, kind))
    }
}

fn entries_of(entries: &EntryMap, kind: JournalKind) -> BTreeMap<String, String> {
    entries
        .iter()
        .filter(|((k, _), _)| *k == kind)
        .map(|((_, id), v)| (id.clone(), v.clone()))
        .collect()
}

fn map_file(path: &Path, size: usize) -> GcResult<MmapMut> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| {
            error!("journal: failed to open {}: {}", path.display(), e);
            GcError::from(e)
        })?;

    if file.metadata()?.len() < size as u64 {
        file.set_len(size as u64)?;
    }

    // SAFETY: the journal file is only mapped by the process holding the
    // SR run-lock or SR lock.
    unsafe {
        MmapMut::map_mut(&file).map_err(|e| {
            error!("journal: failed to mmap {}: {}", path.display(), e);
            GcError::from(e)
        })
    }
}

fn read_array<const N: usize>(mmap: &[u8], pos: usize) -> [u8; N] {
    let mut buf = [0u8; N];
    buf.copy_from_slice(&mmap[pos..pos + N]);
    buf
}

fn read_tail(mmap: &[u8]) -> usize {
    u64::from_le_bytes(read_array(mmap, 4)) as usize
}

fn write_tail(mmap: &mut [u8], tail: usize) {
    mmap[4..12].copy_from_slice(&(tail as u64).to_le_bytes());
}

fn init_header(mmap: &mut MmapMut) -> GcResult<()> {
    mmap[0..4].copy_from_slice(&JOURNAL_MAGIC.to_le_bytes());
    write_tail(mmap, HEADER_SIZE);
    mmap.flush().map_err(|e| {
        error!("journal: failed to flush header: {}", e);
        GcError::from(e)
    })
}

/// Write one record at the tail. Returns `None` when it does not fit.
fn append_record(
    mmap: &mut [u8],
    size: usize,
    op: u8,
    kind: JournalKind,
    id: &str,
    value: &str,
) -> Option<()> {
    let id_len = u16::try_from(id.len()).ok()?;
    let val_len = u32::try_from(value.len()).ok()?;
    let tail = read_tail(mmap);
    let end = tail + ENTRY_HEADER_SIZE + id.len() + value.len();
    if end > size {
        return None;
    }

    let pos = tail;
    mmap[pos..pos + 4].copy_from_slice(&ENTRY_MAGIC.to_le_bytes());
    mmap[pos + 4] = op;
    mmap[pos + 5] = kind.code();
    mmap[pos + 6..pos + 8].copy_from_slice(&id_len.to_le_bytes());
    mmap[pos + 8..pos + 12].copy_from_slice(&val_len.to_le_bytes());
    let body = pos + ENTRY_HEADER_SIZE;
    mmap[body..body + id.len()].copy_from_slice(id.as_bytes());
    mmap[body + id.len()..end].copy_from_slice(value.as_bytes());

    write_tail(mmap, end);
    Some(())
}

/// Walk the log from the header to the tail and fold it into a map.
fn replay(mmap: &[u8]) -> EntryMap {
    let tail = read_tail(mmap).min(mmap.len());
    let mut entries = EntryMap::new();
    let mut pos = HEADER_SIZE;

    while pos + ENTRY_HEADER_SIZE <= tail {
        let magic = u32::from_le_bytes(read_array(mmap, pos));
        if magic != ENTRY_MAGIC {
            warn!("journal: bad record magic at offset {}", pos);
            break;
        }
        let op = mmap[pos + 4];
        let Some(kind) = JournalKind::from_code(mmap[pos + 5]) else {
            warn!("journal: unknown record kind at offset {}", pos);
            break;
        };
        let id_len = u16::from_le_bytes(read_array(mmap, pos + 6)) as usize;
        let val_len = u32::from_le_bytes(read_array(mmap, pos + 8)) as usize;
        let body = pos + ENTRY_HEADER_SIZE;
        if body + id_len + val_len > tail {
            warn!("journal: truncated record at offset {}", pos);
            break;
        }

        let id = String::from_utf8_lossy(&mmap[body..body + id_len]).into_owned();
        let value = String::from_utf8_lossy(&mmap[body + id_len..body + id_len + val_len]).into_owned();
        match op {
            OP_CREATE => {
                entries.insert((kind, id), value);
            }
            OP_REMOVE => {
                entries.remove(&(kind, id));
            }
            other => {
                warn!("journal: unknown record op {} at offset {}", other, pos);
                break;
            }
        }
        pos = body + id_len + val_len;
    }

    entries
}

/// Journal held in memory only.
#[derive(Default)]
pub struct MemoryJournal {
    entries: Mutex<EntryMap>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> GcResult<MutexGuard<'_, EntryMap>> {
        self.entries
            .lock()
            .map_err(|_| GcError::Invariant("journal mutex poisoned".into()))
    }
}

impl Journal for MemoryJournal {
    fn create(&self, kind: JournalKind, id: &str, value: &str) -> GcResult<()> {
        let mut entries = self.lock()?;
        let key = (kind, id.to_string());
        if entries.contains_key(&key) {
            return Err(GcError::failed(format!("journal entry {}/{} already exists", kind, id)));
        }
        entries.insert(key, value.to_string());
        Ok(())
    }

    fn remove(&self, kind: JournalKind, id: &str) -> GcResult<()> {
        self.lock()?.remove(&(kind, id.to_string()));
        Ok(())
    }

    fn get(&self, kind: JournalKind, id: &str) -> GcResult<Option<String>> {
        Ok(self.lock()?.get(&(kind, id.to_string())).cloned())
    }

    fn get_all(&self, kind: JournalKind) -> GcResult<BTreeMap<String, String>> {
        let entries = self.lock()?;
        Ok(entries_of(&entries, kind))
    }
}
