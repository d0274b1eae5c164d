//! Simulated control plane.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;
use vhdgc_proto::{ConfigNamespace, GcError, GcResult, VdiConfig};

use super::storage::SimStorage;
use crate::control::{AtomicOpOutcome, ControlPlane, HostRecord, TaskStatus};

/// A recorded plugin invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginCall {
    pub hostname: String,
    pub plugin: String,
    pub action: String,
    pub args: BTreeMap<String, String>,
}

/// Future returned by an atomic-op handler.
pub type AtomicOpFuture = Pin<Box<dyn Future<Output = GcResult<AtomicOpOutcome>> + Send>>;

/// Runs the action of an atomic op while the VDIs are "paused".
pub type AtomicOpHandler =
    Arc<dyn Fn(Vec<String>, String, BTreeMap<String, String>) -> AtomicOpFuture + Send + Sync>;

struct ControlState {
    sr_other_config: BTreeMap<String, String>,
    plugged: bool,
    configs: BTreeMap<String, VdiConfig>,
    missing: HashSet<String>,
    forgotten: Vec<String>,
    attached: BTreeMap<String, Vec<HostRecord>>,
    plugin_calls: Vec<PluginCall>,
    atomic_ops: Vec<(Vec<String>, String)>,
    atomic_outcome: AtomicOpOutcome,
    atomic_handler: Option<AtomicOpHandler>,
    snapshots_enabled: bool,
    next_task: u64,
    pending_polls: u32,
    cancelled: Vec<String>,
}

/// In-memory [`ControlPlane`]. Snapshots are taken on the shared
/// [`SimStorage`].
#[derive(Clone)]
pub struct SimControlPlane {
    storage: SimStorage,
    state: Arc<Mutex<ControlState>>,
}

impl SimControlPlane {
    pub fn new(storage: SimStorage) -> Self {
        Self {
            storage,
            state: Arc::new(Mutex::new(ControlState {
                sr_other_config: BTreeMap::new(),
                plugged: true,
                configs: BTreeMap::new(),
                missing: HashSet::new(),
                forgotten: Vec::new(),
                attached: BTreeMap::new(),
                plugin_calls: Vec::new(),
                atomic_ops: Vec::new(),
                atomic_outcome: AtomicOpOutcome::Success,
                atomic_handler: None,
                snapshots_enabled: true,
                next_task: 0,
                pending_polls: 0,
                cancelled: Vec::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_sr_config(&self, key: &str, value: &str) {
        self.state()
            .sr_other_config
            .insert(key.to_string(), value.to_string());
    }

    pub fn set_plugged(&self, plugged: bool) {
        self.state().plugged = plugged;
    }

    /// Set a VDI config key directly.
    pub fn put_config(&self, vdi_uuid: &str, ns: ConfigNamespace, key: &str, value: &str) {
        self.state()
            .configs
            .entry(vdi_uuid.to_string())
            .or_default()
            .set(ns, key, value);
    }

    pub fn config(&self, vdi_uuid: &str) -> VdiConfig {
        self.state()
            .configs
            .get(vdi_uuid)
            .cloned()
            .unwrap_or_default()
    }

    /// Report `vdi_uuid` as unknown from now on.
    pub fn mark_missing(&self, vdi_uuid: &str) {
        self.state().missing.insert(vdi_uuid.to_string());
    }

    pub fn forgotten(&self) -> Vec<String> {
        self.state().forgotten.clone()
    }

    /// Attach `vdi_uuid` on another host.
    pub fn attach(&self, vdi_uuid: &str, hostname: &str) {
        self.state()
            .attached
            .entry(vdi_uuid.to_string())
            .or_default()
            .push(HostRecord {
                host_ref: format!("OpaqueRef:{}", hostname),
                hostname: hostname.to_string(),
            });
    }

    pub fn plugin_calls(&self) -> Vec<PluginCall> {
        self.state().plugin_calls.clone()
    }

    /// Recorded atomic ops as `(vdis, action)`.
    pub fn atomic_ops(&self) -> Vec<(Vec<String>, String)> {
        self.state().atomic_ops.clone()
    }

    /// Outcome of atomic ops when no handler is installed.
    pub fn set_atomic_outcome(&self, outcome: AtomicOpOutcome) {
        self.state().atomic_outcome = outcome;
    }

    pub fn set_atomic_handler(&self, handler: AtomicOpHandler) {
        self.state().atomic_handler = Some(handler);
    }

    pub fn disable_snapshots(&self) {
        self.state().snapshots_enabled = false;
    }

    /// Number of SR update tasks started.
    pub fn sr_updates(&self) -> u64 {
        self.state().next_task
    }

    /// Tasks report `Pending` this many times before succeeding.
    pub fn set_pending_polls(&self, polls: u32) {
        self.state().pending_polls = polls;
    }

    pub fn cancelled_tasks(&self) -> Vec<String> {
        self.state().cancelled.clone()
    }

    fn check_exists(state: &ControlState, vdi_uuid: &str) -> GcResult<()> {
        if state.missing.contains(vdi_uuid) {
            return Err(GcError::NoObject(format!("VDI {}", vdi_uuid)));
        }
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for SimControlPlane {
    fn name(&self) -> &str {
        "sim"
    }

    async fn sr_other_config(&self, _sr_uuid: &str) -> GcResult<BTreeMap<String, String>> {
        Ok(self.state().sr_other_config.clone())
    }

    async fn is_plugged_here(&self, _sr_uuid: &str) -> GcResult<bool> {
        Ok(self.state().plugged)
    }

    async fn vdi_config(&self, vdi_uuid: &str) -> GcResult<VdiConfig> {
        let st = self.state();
        Self::check_exists(&st, vdi_uuid)?;
        Ok(st.configs.get(vdi_uuid).cloned().unwrap_or_default())
    }

    async fn set_vdi_config(
        &self,
        vdi_uuid: &str,
        ns: ConfigNamespace,
        key: &str,
        value: &str,
    ) -> GcResult<()> {
        let mut st = self.state();
        Self::check_exists(&st, vdi_uuid)?;
        st.configs
            .entry(vdi_uuid.to_string())
            .or_default()
            .set(ns, key, value);
        Ok(())
    }

    async fn remove_vdi_config(
        &self,
        vdi_uuid: &str,
        ns: ConfigNamespace,
        key: &str,
    ) -> GcResult<()> {
        let mut st = self.state();
        Self::check_exists(&st, vdi_uuid)?;
        if let Some(cfg) = st.configs.get_mut(vdi_uuid) {
            cfg.remove(ns, key);
        }
        Ok(())
    }

    async fn forget_vdi(&self, vdi_uuid: &str) -> GcResult<()> {
        let mut st = self.state();
        st.configs.remove(vdi_uuid);
        st.forgotten.push(vdi_uuid.to_string());
        st.missing.insert(vdi_uuid.to_string());
        debug!("sim: forgot VDI {}", vdi_uuid);
        Ok(())
    }

    async fn attached_hosts(
        &self,
        _sr_uuid: &str,
        vdi_uuids: &[String],
    ) -> GcResult<Vec<HostRecord>> {
        let st = self.state();
        let mut hosts: Vec<HostRecord> = Vec::new();
        for host in vdi_uuids.iter().filter_map(|v| st.attached.get(v)).flatten() {
            if !hosts.contains(host) {
                hosts.push(host.clone());
            }
        }
        Ok(hosts)
    }

    async fn single_snapshot(&self, vdi_uuid: &str) -> GcResult<String> {
        {
            let st = self.state();
            Self::check_exists(&st, vdi_uuid)?;
            if !st.snapshots_enabled {
                return Err(GcError::failed("snapshots are disabled"));
            }
        }
        let base = uuid::Uuid::new_v4().to_string();
        self.storage.snapshot_leaf(vdi_uuid, &base)?;
        Ok(base)
    }

    async fn call_plugin(
        &self,
        host: &HostRecord,
        plugin: &str,
        action: &str,
        args: &BTreeMap<String, String>,
    ) -> GcResult<String> {
        self.state().plugin_calls.push(PluginCall {
            hostname: host.hostname.clone(),
            plugin: plugin.to_string(),
            action: action.to_string(),
            args: args.clone(),
        });
        Ok("True".to_string())
    }

    async fn atomic_op(
        &self,
        vdi_uuids: &[String],
        action: &str,
        args: &BTreeMap<String, String>,
        must_exist: bool,
    ) -> GcResult<AtomicOpOutcome> {
        let (handler, outcome) = {
            let mut st = self.state();
            if must_exist {
                for vdi in vdi_uuids {
                    Self::check_exists(&st, vdi)?;
                }
            }
            st.atomic_ops.push((vdi_uuids.to_vec(), action.to_string()));
            (st.atomic_handler.clone(), st.atomic_outcome)
        };
        match handler {
            Some(handler) => handler(vdi_uuids.to_vec(), action.to_string(), args.clone()).await,
            None => Ok(outcome),
        }
    }

    async fn start_sr_update(&self, sr_uuid: &str) -> GcResult<String> {
        let mut st = self.state();
        st.next_task += 1;
        debug!("sim: SR update {} for {}", st.next_task, sr_uuid);
        Ok(format!("task-{}", st.next_task))
    }

    async fn task_status(&self, _task: &str) -> GcResult<TaskStatus> {
        let mut st = self.state();
        if st.pending_polls > 0 {
            st.pending_polls -= 1;
            return Ok(TaskStatus::Pending);
        }
        Ok(TaskStatus::Success)
    }

    async fn cancel_task(&self, task: &str) -> GcResult<()> {
        self.state().cancelled.push(task.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::sim::SimVhd;

    #[tokio::test]
    async fn test_forgotten_vdi_is_no_object() {
        let cp = SimControlPlane::new(SimStorage::new());
        cp.put_config("v1", ConfigNamespace::Other, "leaf-coalesce", "force");
        assert_eq!(
            cp.vdi_config("v1").await.unwrap().get(ConfigNamespace::Other, "leaf-coalesce"),
            Some("force")
        );
        cp.forget_vdi("v1").await.unwrap();
        assert!(cp.vdi_config("v1").await.unwrap_err().is_benign_race());
        assert_eq!(cp.forgotten(), vec!["v1".to_string()]);
    }

    #[tokio::test]
    async fn test_snapshot_creates_base() {
        let storage = SimStorage::new();
        storage.add_file_vhd(Path::new("/sr"), "leaf", SimVhd::new(1 << 20));
        let cp = SimControlPlane::new(storage.clone());
        let base = cp.single_snapshot("leaf").await.unwrap();
        assert!(storage.find_vhd_path(&base).is_some());

        cp.disable_snapshots();
        assert!(cp.single_snapshot("leaf").await.is_err());
    }

    #[tokio::test]
    async fn test_atomic_op_handler() {
        let cp = SimControlPlane::new(SimStorage::new());
        cp.set_atomic_outcome(AtomicOpOutcome::Failure);
        let out = cp.atomic_op(&["a".into()], "x", &BTreeMap::new(), true).await.unwrap();
        assert_eq!(out, AtomicOpOutcome::Failure);

        cp.set_atomic_handler(Arc::new(
            |_: Vec<String>, _: String, _: BTreeMap<String, String>| -> AtomicOpFuture {
                Box::pin(async { Ok(AtomicOpOutcome::Success) })
            },
        ));
        let out = cp.atomic_op(&["a".into()], "x", &BTreeMap::new(), true).await.unwrap();
        assert_eq!(out, AtomicOpOutcome::Success);

        cp.mark_missing("a");
        assert!(cp.atomic_op(&["a".into()], "x", &BTreeMap::new(), true).await.is_err());
        assert_eq!(cp.atomic_ops().len(), 2);
    }

    #[tokio::test]
    async fn test_task_polling() {
        let cp = SimControlPlane::new(SimStorage::new());
        cp.set_pending_polls(1);
        let task = cp.start_sr_update("sr").await.unwrap();
        assert_eq!(cp.task_status(&task).await.unwrap(), TaskStatus::Pending);
        assert_eq!(cp.task_status(&task).await.unwrap(), TaskStatus::Success);
        assert_eq!(cp.sr_updates(), 1);
    }
}
