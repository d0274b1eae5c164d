//! # vhdgc
//!
//! Garbage collection and coalescing of VHD chains in a storage
//! repository (SR).
//!
//! Deleting a snapshot leaves its hidden VHD behind. The engine removes
//! hidden VHDs nothing depends on, folds hidden single-child links into
//! their parents to shorten chains, and on LVHD SRs merges a running
//! VM's leaf into its parent. Every multi-step mutation is journaled so
//! an interrupted run can be rolled back or finished by the next one.

pub mod abortable;
pub mod coalesce;
pub mod config;
pub mod driver;
pub mod engine;
pub mod fist;
pub mod garbage;
pub mod leaf;
pub mod sr;
pub mod tree;
pub mod vdi;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::GcConfig;
pub use engine::{Engine, Services, Storage};
pub use sr::Sr;
