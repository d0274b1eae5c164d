//! Engine configuration.
//!
//! Every field has a default from [`vhdgc_proto::defaults`]; a YAML file
//! only needs the keys it overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use vhdgc_proto::defaults::*;
use vhdgc_proto::{GcError, GcResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Leaves up to this physical size are coalesced live (bytes).
    pub live_leaf_coalesce_max_size: u64,
    pub live_leaf_coalesce_timeout_secs: u64,
    pub auto_online_leaf_coalesce: bool,
    pub abort_poll_interval_ms: u64,
    /// 0 means unbounded.
    pub coalesce_timeout_secs: u64,
    pub lock_retry_interval_ms: u64,
    pub lock_retry_attempts: u32,
    pub sr_lock_retry_attempts: u32,
    pub scan_retry_attempts: u32,
    pub sr_update_poll_iterations: u32,
    pub sr_update_poll_interval_ms: u64,
    /// Active fault-injection points.
    pub fist_points: Vec<String>,
    pub state_dir: PathBuf,
    pub journal_size: usize,
    pub log_file: PathBuf,
    /// Command run by the local control plane for atomic operations.
    pub atomic_op_helper: Vec<String>,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            live_leaf_coalesce_max_size: DEFAULT_LIVE_LEAF_COALESCE_MAX_SIZE,
            live_leaf_coalesce_timeout_secs: DEFAULT_LIVE_LEAF_COALESCE_TIMEOUT_SECS,
            auto_online_leaf_coalesce: DEFAULT_AUTO_ONLINE_LEAF_COALESCE,
            abort_poll_interval_ms: DEFAULT_ABORT_POLL_INTERVAL_MS,
            coalesce_timeout_secs: DEFAULT_COALESCE_TIMEOUT_SECS,
            lock_retry_interval_ms: DEFAULT_LOCK_RETRY_INTERVAL_MS,
            lock_retry_attempts: DEFAULT_LOCK_RETRY_ATTEMPTS,
            sr_lock_retry_attempts: DEFAULT_SR_LOCK_RETRY_ATTEMPTS,
            scan_retry_attempts: DEFAULT_SCAN_RETRY_ATTEMPTS,
            sr_update_poll_iterations: DEFAULT_SR_UPDATE_POLL_ITERATIONS,
            sr_update_poll_interval_ms: 1000,
            fist_points: Vec::new(),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            journal_size: DEFAULT_JOURNAL_SIZE,
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            atomic_op_helper: vec!["vhdgc".to_string()],
        }
    }
}

impl GcConfig {
    pub fn from_path(path: &Path) -> GcResult<GcConfig> {
        let config: GcConfig = Figment::new()
            .merge(Serialized::defaults(GcConfig::default()))
            .merge(Yaml::file(path))
            .extract()
            .map_err(|e| GcError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> GcResult<()> {
        if self.abort_poll_interval_ms == 0 {
            return Err(GcError::Config("abort_poll_interval_ms must be positive".into()));
        }
        if self.lock_retry_attempts == 0 || self.sr_lock_retry_attempts == 0 {
            return Err(GcError::Config("lock retry attempts must be positive".into()));
        }
        if self.scan_retry_attempts == 0 {
            return Err(GcError::Config("scan_retry_attempts must be positive".into()));
        }
        if self.journal_size < 4096 {
            return Err(GcError::Config(format!(
                "journal_size {} is too small",
                self.journal_size
            )));
        }
        Ok(())
    }

    pub fn abort_poll_interval(&self) -> Duration {
        Duration::from_millis(self.abort_poll_interval_ms)
    }

    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }

    pub fn sr_update_poll_interval(&self) -> Duration {
        Duration::from_millis(self.sr_update_poll_interval_ms)
    }

    pub fn coalesce_timeout(&self) -> Option<Duration> {
        secs_or_unbounded(self.coalesce_timeout_secs)
    }

    pub fn live_leaf_coalesce_timeout(&self) -> Option<Duration> {
        secs_or_unbounded(self.live_leaf_coalesce_timeout_secs)
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    pub fn flag_dir(&self) -> PathBuf {
        self.state_dir.join("flags")
    }

    pub fn journal_path(&self, sr_uuid: &str) -> PathBuf {
        self.state_dir.join("journal").join(sr_uuid)
    }

    pub fn refcount_dir(&self) -> PathBuf {
        self.state_dir.join("refcount")
    }

    pub fn local_control_path(&self) -> PathBuf {
        self.state_dir.join("local-control.json")
    }
}

fn secs_or_unbounded(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = GcConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.coalesce_timeout(), None);
        assert_eq!(cfg.live_leaf_coalesce_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(cfg.journal_path("sr1"), PathBuf::from("/var/lib/vhdgc/journal/sr1"));
    }

    #[test]
    fn test_yaml_overrides_some_keys() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("vhdgc.yaml");
        std::fs::write(
            &path,
            "lock_retry_attempts: 5\nauto_online_leaf_coalesce: false\nfist_points:\n  - leaf_one_renamed\n",
        )
        .unwrap();
        let cfg = GcConfig::from_path(&path).unwrap();
        assert_eq!(cfg.lock_retry_attempts, 5);
        assert!(!cfg.auto_online_leaf_coalesce);
        assert_eq!(cfg.fist_points, vec!["leaf_one_renamed".to_string()]);
        assert_eq!(cfg.sr_lock_retry_attempts, DEFAULT_SR_LOCK_RETRY_ATTEMPTS);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "abort_poll_interval_ms: 0\n").unwrap();
        assert!(matches!(GcConfig::from_path(&path), Err(GcError::Config(_))));

        std::fs::write(&path, "scan_retry_attempts: [1, 2]\n").unwrap();
        assert!(matches!(GcConfig::from_path(&path), Err(GcError::Config(_))));
    }
}
