//! Error taxonomy for garbage collection and coalescing.
//!
//! Higher layers only need to tell an abort apart from everything else;
//! the remaining variants exist so the CLI can report a meaningful exit
//! status and so call sites can swallow control-plane races.

/// Unified error type for all GC operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GcError {
    /// The SR abort flag was observed.
    #[error("aborted by signal")]
    Aborted,
    /// A specific operation failed; the candidate can be skipped.
    #[error("operation failed: {0}")]
    Transient(String),
    /// Backend metadata was unreadable or inconsistent.
    #[error("scan failed: {0}")]
    ScanFailed(String),
    /// A lock could not be acquired within the retry budget.
    #[error("lock timeout: {0}")]
    LockTimeout(String),
    /// A programming invariant was violated.
    #[error("invariant violated: {0}")]
    Invariant(String),
    /// The control plane no longer knows the object.
    #[error("object no longer exists: {0}")]
    NoObject(String),
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Convenience result alias.
pub type GcResult<T> = Result<T, GcError>;

impl GcError {
    /// Shorthand for a [`GcError::Transient`] with a formatted message.
    pub fn failed(msg: impl Into<String>) -> Self {
        GcError::Transient(msg.into())
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, GcError::Aborted)
    }

    /// Races with a concurrent delete or snapshot that callers may ignore.
    pub fn is_benign_race(&self) -> bool {
        matches!(self, GcError::NoObject(_))
    }

    /// Process exit status for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            GcError::Aborted => 2,
            GcError::Transient(_) => 1,
            GcError::ScanFailed(_) => 3,
            GcError::LockTimeout(_) => 4,
            GcError::Invariant(_) => 5,
            GcError::NoObject(_) => 6,
            GcError::Config(_) => 7,
        }
    }
}

impl From<std::io::Error> for GcError {
    fn from(e: std::io::Error) -> Self {
        GcError::Transient(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_is_distinguished() {
        assert!(GcError::Aborted.is_abort());
        assert!(!GcError::failed("x").is_abort());
        assert!(!GcError::LockTimeout("sr".into()).is_abort());
    }

    #[test]
    fn test_benign_race() {
        assert!(GcError::NoObject("vdi".into()).is_benign_race());
        assert!(!GcError::ScanFailed("bad".into()).is_benign_race());
    }

    #[test]
    fn test_exit_codes_distinct() {
        let all = [
            GcError::Aborted,
            GcError::failed(""),
            GcError::ScanFailed(String::new()),
            GcError::LockTimeout(String::new()),
            GcError::Invariant(String::new()),
            GcError::NoObject(String::new()),
            GcError::Config(String::new()),
        ];
        let mut codes: Vec<i32> = all.iter().map(|e| e.exit_code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
        assert!(codes.iter().all(|&c| c != 0));
    }

    #[test]
    fn test_from_io_error() {
        let e: GcError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(e, GcError::Transient(ref m) if m.contains("gone")));
    }
}
