//! # vhdgc-core
//!
//! Capabilities the garbage collector consumes, and their implementations.
//!
//! Each external concern is a trait so the engine can run against real
//! storage or against the in-memory [`sim`] used by tests:
//! - [`control::ControlPlane`]: VDI records, plugin calls, atomic operations.
//! - [`vhd::VhdBackend`]: VHD metadata, resize, coalesce, block bitmaps.
//! - [`lvm::LvBackend`]: logical volumes of an LVHD SR.
//! - [`journal::Journal`], [`lock::LockManager`], [`ipc::AbortSignal`],
//!   [`refcount::RefCounter`]: crash-durable local state.

pub mod cmd;
pub mod control;
pub mod ipc;
pub mod journal;
pub mod local;
pub mod lock;
pub mod lvm;
pub mod refcount;
pub mod sim;
pub mod space;
pub mod vhd;

pub use control::{AtomicOpOutcome, ControlPlane, HostRecord, TaskStatus};
pub use ipc::AbortSignal;
pub use journal::Journal;
pub use lock::LockManager;
pub use lvm::{LvBackend, LvVdiInfo, VgStats};
pub use refcount::{RefCount, RefCounter};
pub use vhd::{VhdBackend, VhdInfo};
