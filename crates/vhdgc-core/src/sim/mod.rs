//! In-memory simulation of storage and control plane.
//!
//! Designed for development and testing. No file or volume is touched:
//! VHD files, logical volumes and VDI records are kept in process memory
//! and every capability trait is implemented over that state. Clones of
//! a [`SimStorage`] or [`SimControlPlane`] share state, so a test can keep
//! a handle for setup and inspection while the engine owns another.
//!
//! Physical VHD sizes follow the same arithmetic the engine uses for
//! space accounting: empty-VHD overhead plus allocated blocks plus their
//! sector bitmaps.

mod control;
mod storage;

pub use control::{AtomicOpFuture, AtomicOpHandler, PluginCall, SimControlPlane};
pub use storage::{SimLv, SimStorage, SimVhd};
