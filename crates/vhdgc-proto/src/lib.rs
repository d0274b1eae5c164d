//! # vhdgc-proto
//!
//! Shared vocabulary for the VHD garbage collector: the error type,
//! persisted constants (journal entry types, config keys, lock names),
//! tunable defaults, and the small enums describing VDI configuration.
//!
//! Everything in here is part of the on-disk or on-record schema that
//! other tools read, so values must not change between releases.

pub mod constants;
pub mod defaults;
pub mod error;
pub mod journal;
pub mod vdi;

// Re-export commonly used types at the crate root
pub use error::{GcError, GcResult};
pub use journal::JournalKind;
pub use vdi::{ConfigNamespace, LeafCoalescePolicy, VdiConfig, VdiType};
