//! Control-plane capability.
//!
//! The control plane owns VDI records and their configuration, knows
//! which hosts have a VDI attached, and can run operations that need the
//! VDIs paused. Errors for objects it no longer knows are reported as
//! [`GcError::NoObject`] so callers can treat them as benign races.
//!
//! [`GcError::NoObject`]: vhdgc_proto::GcError::NoObject

use std::collections::BTreeMap;

use async_trait::async_trait;
use vhdgc_proto::{ConfigNamespace, GcResult, VdiConfig};

/// A host that has a VDI of this SR attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    /// Opaque reference used for plugin calls.
    pub host_ref: String,
    pub hostname: String,
}

/// Result of a pause-guarded atomic operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOpOutcome {
    Success,
    /// The action ran and reported failure.
    Failure,
    /// The action could not be run or crashed.
    Exception,
}

/// Status of an asynchronous control-plane task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Success,
    Failure(String),
    Cancelled,
}

/// Trait implemented by every control-plane binding.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Human-readable name of this binding (e.g. "local", "sim").
    fn name(&self) -> &str;

    /// SR other-config map.
    async fn sr_other_config(&self, sr_uuid: &str) -> GcResult<BTreeMap<String, String>>;

    /// Whether the SR is plugged on the host running the GC.
    async fn is_plugged_here(&self, sr_uuid: &str) -> GcResult<bool>;

    /// Both config namespaces of a VDI.
    async fn vdi_config(&self, vdi_uuid: &str) -> GcResult<VdiConfig>;

    async fn set_vdi_config(
        &self,
        vdi_uuid: &str,
        ns: ConfigNamespace,
        key: &str,
        value: &str,
    ) -> GcResult<()>;

    async fn remove_vdi_config(&self, vdi_uuid: &str, ns: ConfigNamespace, key: &str)
        -> GcResult<()>;

    /// Drop the VDI record. Forgetting an unknown VDI succeeds.
    async fn forget_vdi(&self, vdi_uuid: &str) -> GcResult<()>;

    /// Hosts other than this one where any of `vdi_uuids` is attached.
    async fn attached_hosts(&self, sr_uuid: &str, vdi_uuids: &[String])
        -> GcResult<Vec<HostRecord>>;

    /// Take a crash-consistent single snapshot of a VDI. Returns the
    /// snapshot uuid.
    async fn single_snapshot(&self, vdi_uuid: &str) -> GcResult<String>;

    /// Call a plugin action on a host. Returns the plugin's free-form output.
    async fn call_plugin(
        &self,
        host: &HostRecord,
        plugin: &str,
        action: &str,
        args: &BTreeMap<String, String>,
    ) -> GcResult<String>;

    /// Pause `vdi_uuids`, run `action`, unpause.
    async fn atomic_op(
        &self,
        vdi_uuids: &[String],
        action: &str,
        args: &BTreeMap<String, String>,
        must_exist: bool,
    ) -> GcResult<AtomicOpOutcome>;

    /// Start an asynchronous SR metadata refresh. Returns a task handle.
    async fn start_sr_update(&self, sr_uuid: &str) -> GcResult<String>;

    async fn task_status(&self, task: &str) -> GcResult<TaskStatus>;

    async fn cancel_task(&self, task: &str) -> GcResult<()>;
}
