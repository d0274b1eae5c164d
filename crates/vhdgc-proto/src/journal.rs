//! Journal entry kinds.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GcError;

/// Type of a journal entry. Entries are keyed by `(kind, object uuid)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JournalKind {
    /// A non-leaf VDI is being coalesced into its parent.
    Coalesce,
    /// The children of a coalesced VDI still need relinking.
    Relink,
    /// Leaf-coalesce in progress: child uuid -> parent uuid.
    Leaf,
    /// A volume is being grown; value is the old size.
    Zero,
    /// Written by the clone operation: `base_clone` uuids.
    Clone,
}

impl JournalKind {
    pub const ALL: [JournalKind; 5] = [
        JournalKind::Coalesce,
        JournalKind::Relink,
        JournalKind::Leaf,
        JournalKind::Zero,
        JournalKind::Clone,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JournalKind::Coalesce => "coalesce",
            JournalKind::Relink => "relink",
            JournalKind::Leaf => "leaf",
            JournalKind::Zero => "zero",
            JournalKind::Clone => "clone",
        }
    }

    /// Stable one-byte tag used by binary journal formats.
    pub fn code(&self) -> u8 {
        match self {
            JournalKind::Coalesce => 1,
            JournalKind::Relink => 2,
            JournalKind::Leaf => 3,
            JournalKind::Zero => 4,
            JournalKind::Clone => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        JournalKind::ALL.into_iter().find(|k| k.code() == code)
    }
}

impl fmt::Display for JournalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JournalKind {
    type Err = GcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JournalKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| GcError::Invariant(format!("unknown journal type '{}'", s)))
    }
}
