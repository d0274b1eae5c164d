//! Standalone control plane for a single host without an orchestrator.
//!
//! VDI configuration is kept in a JSON state file that is re-read on every
//! call, since the atomic-op helper runs in a separate process and edits
//! the same file. No VDI is ever attached elsewhere, snapshots are not
//! available and SR updates have nothing to refresh.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, error, info};
use vhdgc_proto::{ConfigNamespace, GcError, GcResult, VdiConfig};

use crate::control::{AtomicOpOutcome, ControlPlane, HostRecord, TaskStatus};

#[derive(Debug, Default, Serialize, Deserialize)]
struct LocalState {
    #[serde(default)]
    sr_other_config: BTreeMap<String, String>,
    #[serde(default)]
    vdis: BTreeMap<String, VdiConfig>,
}

pub struct LocalControlPlane {
    state_path: PathBuf,
    /// Program and leading arguments used to run atomic actions.
    helper: Vec<String>,
    sr_uuid: String,
    io: Mutex<()>,
}

impl LocalControlPlane {
    pub fn new(state_path: impl Into<PathBuf>, sr_uuid: &str, helper: Vec<String>) -> Self {
        Self {
            state_path: state_path.into(),
            helper,
            sr_uuid: sr_uuid.to_string(),
            io: Mutex::new(()),
        }
    }

    fn load(path: &Path) -> GcResult<LocalState> {
        match std::fs::read(path) {
            Ok(data) => serde_json::from_slice(&data).map_err(|e| {
                error!("local: corrupt state file {}: {}", path.display(), e);
                GcError::Config(format!("corrupt state file {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LocalState::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(path: &Path, state: &LocalState) -> GcResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(state)
            .map_err(|e| GcError::failed(format!("state encode: {}", e)))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut LocalState) -> T, write: bool) -> GcResult<T> {
        let _io = self
            .io
            .lock()
            .map_err(|_| GcError::Invariant("local state mutex poisoned".into()))?;
        let mut state = Self::load(&self.state_path)?;
        let out = f(&mut state);
        if write {
            Self::save(&self.state_path, &state)?;
        }
        Ok(out)
    }

    /// `<helper...> --sr <uuid> <action> --vdi <uuid>`
    fn helper_command(&self, action: &str, args: &BTreeMap<String, String>) -> GcResult<Command> {
        let (program, leading) = self
            .helper
            .split_first()
            .ok_or_else(|| GcError::Config("no atomic-op helper configured".into()))?;
        let sr = args.get("sr_uuid").map(String::as_str).unwrap_or(&self.sr_uuid);
        let mut cmd = Command::new(program);
        cmd.args(leading)
            .arg("--sr")
            .arg(sr)
            .arg(action.replace('_', "-"))
            .kill_on_drop(true);
        if let Some(vdi) = args.get("vdi_uuid") {
            cmd.arg("--vdi").arg(vdi);
        }
        Ok(cmd)
    }
}

#[async_trait]
impl ControlPlane for LocalControlPlane {
    fn name(&self) -> &str {
        "local"
    }

    async fn sr_other_config(&self, _sr_uuid: &str) -> GcResult<BTreeMap<String, String>> {
        self.with_state(|s| s.sr_other_config.clone(), false)
    }

    async fn is_plugged_here(&self, _sr_uuid: &str) -> GcResult<bool> {
        Ok(true)
    }

    async fn vdi_config(&self, vdi_uuid: &str) -> GcResult<VdiConfig> {
        self.with_state(|s| s.vdis.get(vdi_uuid).cloned().unwrap_or_default(), false)
    }

    async fn set_vdi_config(
        &self,
        vdi_uuid: &str,
        ns: ConfigNamespace,
        key: &str,
        value: &str,
    ) -> GcResult<()> {
        self.with_state(
            |s| s.vdis.entry(vdi_uuid.to_string()).or_default().set(ns, key, value),
            true,
        )
    }

    async fn remove_vdi_config(
        &self,
        vdi_uuid: &str,
        ns: ConfigNamespace,
        key: &str,
    ) -> GcResult<()> {
        self.with_state(
            |s| {
                if let Some(cfg) = s.vdis.get_mut(vdi_uuid) {
                    cfg.remove(ns, key);
                }
            },
            true,
        )
    }

    async fn forget_vdi(&self, vdi_uuid: &str) -> GcResult<()> {
        self.with_state(
            |s| {
                s.vdis.remove(vdi_uuid);
            },
            true,
        )?;
        debug!("local: forgot VDI {}", vdi_uuid);
        Ok(())
    }

    async fn attached_hosts(
        &self,
        _sr_uuid: &str,
        _vdi_uuids: &[String],
    ) -> GcResult<Vec<HostRecord>> {
        Ok(Vec::new())
    }

    async fn single_snapshot(&self, vdi_uuid: &str) -> GcResult<String> {
        Err(GcError::failed(format!(
            "cannot snapshot {}: snapshots need an orchestrator",
            vdi_uuid
        )))
    }

    async fn call_plugin(
        &self,
        host: &HostRecord,
        plugin: &str,
        action: &str,
        _args: &BTreeMap<String, String>,
    ) -> GcResult<String> {
        Err(GcError::failed(format!(
            "cannot call {}.{} on {}: no remote hosts",
            plugin, action, host.hostname
        )))
    }

    async fn atomic_op(
        &self,
        vdi_uuids: &[String],
        action: &str,
        args: &BTreeMap<String, String>,
        _must_exist: bool,
    ) -> GcResult<AtomicOpOutcome> {
        let mut cmd = self.helper_command(action, args)?;
        info!("local: running {} for {:?}", action, vdi_uuids);
        match cmd.status().await {
            Ok(status) if status.success() => Ok(AtomicOpOutcome::Success),
            Ok(status) => {
                error!("local: {} exited with {}", action, status);
                Ok(AtomicOpOutcome::Failure)
            }
            Err(e) => {
                error!("local: failed to run {}: {}", action, e);
                Ok(AtomicOpOutcome::Exception)
            }
        }
    }

    async fn start_sr_update(&self, sr_uuid: &str) -> GcResult<String> {
        Ok(format!("local-sr-update-{}", sr_uuid))
    }

    async fn task_status(&self, _task: &str) -> GcResult<TaskStatus> {
        Ok(TaskStatus::Success)
    }

    async fn cancel_task(&self, _task: &str) -> GcResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_config_persists_across_instances() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("local-control.json");
        let cp = LocalControlPlane::new(&path, "sr1", vec![]);
        cp.set_vdi_config("v1", ConfigNamespace::Other, "leaf-coalesce", "force")
            .await
            .unwrap();

        let again = LocalControlPlane::new(&path, "sr1", vec![]);
        let cfg = again.vdi_config("v1").await.unwrap();
        assert_eq!(cfg.get(ConfigNamespace::Other, "leaf-coalesce"), Some("force"));

        again.forget_vdi("v1").await.unwrap();
        assert_eq!(cp.vdi_config("v1").await.unwrap(), VdiConfig::default());
        assert!(cp.single_snapshot("v1").await.is_err());
    }

    #[tokio::test]
    async fn test_atomic_op_maps_exit_status() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let ok = LocalControlPlane::new(&path, "sr1", vec!["true".into()]);
        let fail = LocalControlPlane::new(&path, "sr1", vec!["false".into()]);
        let missing = LocalControlPlane::new(&path, "sr1", vec!["/nonexistent/helper".into()]);
        let args = BTreeMap::new();
        let vdis = vec!["v1".to_string()];

        assert_eq!(ok.atomic_op(&vdis, "coalesce_leaf", &args, true).await.unwrap(), AtomicOpOutcome::Success);
        assert_eq!(fail.atomic_op(&vdis, "coalesce_leaf", &args, true).await.unwrap(), AtomicOpOutcome::Failure);
        assert_eq!(
            missing.atomic_op(&vdis, "coalesce_leaf", &args, true).await.unwrap(),
            AtomicOpOutcome::Exception
        );

        let none = LocalControlPlane::new(&path, "sr1", vec![]);
        assert!(matches!(
            none.atomic_op(&vdis, "coalesce_leaf", &args, true).await,
            Err(GcError::Config(_))
        ));
    }
}
