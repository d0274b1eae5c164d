//! Tunable operational defaults.
//!
//! Format and schema constants live in [`crate::constants`]. Everything
//! here can be overridden through the YAML configuration file.

// ─── Leaf-coalesce ──────────────────────────────────────────────────────────

/// Leaves smaller than this can be coalesced while the VM is paused.
pub const DEFAULT_LIVE_LEAF_COALESCE_MAX_SIZE: u64 = 100 * 1024 * 1024;

/// Bound on the paused VHD coalesce (seconds).
pub const DEFAULT_LIVE_LEAF_COALESCE_TIMEOUT_SECS: u64 = 10;

/// Whether leaves are live-coalesced without an explicit `force` policy.
pub const DEFAULT_AUTO_ONLINE_LEAF_COALESCE: bool = true;

// ─── Abortable operations ───────────────────────────────────────────────────

/// Interval at which abortable operations test the abort flag (ms).
pub const DEFAULT_ABORT_POLL_INTERVAL_MS: u64 = 1000;

/// Timeout of the plain (non-leaf) VHD coalesce, 0 for unbounded (seconds).
pub const DEFAULT_COALESCE_TIMEOUT_SECS: u64 = 0;

// ─── Lock retries ───────────────────────────────────────────────────────────

/// Delay between lock attempts (ms).
pub const DEFAULT_LOCK_RETRY_INTERVAL_MS: u64 = 3000;

/// Attempts made while waiting for an aborted instance to yield the run-lock.
pub const DEFAULT_LOCK_RETRY_ATTEMPTS: u32 = 20;

/// Attempts made to take the SR lock.
pub const DEFAULT_SR_LOCK_RETRY_ATTEMPTS: u32 = 100;

// ─── Scanning ───────────────────────────────────────────────────────────────

/// Full batch rescans made when an individual VDI reports a scan error.
pub const DEFAULT_SCAN_RETRY_ATTEMPTS: u32 = 3;

// ─── Control plane ──────────────────────────────────────────────────────────

/// One-second polls of an SR update task before leaving it running.
pub const DEFAULT_SR_UPDATE_POLL_ITERATIONS: u32 = 60;

// ─── Local state ────────────────────────────────────────────────────────────

/// Root of lock files, abort flags, refcounts and journals.
pub const DEFAULT_STATE_DIR: &str = "/var/lib/vhdgc";

/// Per-SR journal size in bytes.
pub const DEFAULT_JOURNAL_SIZE: usize = 1024 * 1024;

/// Append-only log file.
pub const DEFAULT_LOG_FILE: &str = "/var/log/vhdgc.log";

/// Mount point prefix of file SRs; the SR uuid is appended.
pub const DEFAULT_SR_MOUNT_DIR: &str = "/var/run/sr-mount";
