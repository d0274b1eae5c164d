//! Storage drivers: the few operations that differ between file and
//! LVHD repositories.
//!
//! Tree algorithms, candidate selection and journaling live in the SR
//! and are backend-agnostic. They reach the storage only through
//! [`StorageBackend`], or through [`LvhdDriver`] for volume bookkeeping
//! that has no file counterpart (activation, inflate/deflate, renames).

pub mod file;
pub mod lvhd;

use std::sync::Arc;

use async_trait::async_trait;
use vhdgc_core::VhdBackend;
use vhdgc_proto::GcResult;

pub use file::FileDriver;
pub use lvhd::LvhdDriver;

use crate::vdi::Vdi;

/// Operations every SR type provides.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &str;

    /// One batch read of every VDI in the SR, tree links unset.
    async fn scan_once(&self) -> GcResult<Vec<Vdi>>;

    /// Bytes available for growing VHDs.
    async fn free_space(&self) -> GcResult<u64>;

    /// Physical size of the VDI's VHD.
    async fn size_vhd(&self, vdi: &Vdi) -> GcResult<u64>;

    async fn set_hidden(&self, vdi: &mut Vdi, hidden: bool) -> GcResult<()>;

    /// Point the VHD of `child` at `parent`.
    async fn set_parent(&self, child: &Vdi, parent: &Vdi) -> GcResult<()>;

    /// Journaled virtual-size growth beyond the in-place limit.
    async fn set_size_virt(&self, vdi: &mut Vdi, size: u64) -> GcResult<()>;

    /// Remove the VDI's storage.
    async fn delete(&self, vdi: &Vdi) -> GcResult<()>;

    /// Release everything this run holds on the storage.
    async fn cleanup(&self) -> GcResult<()>;

    fn vhd(&self) -> &Arc<dyn VhdBackend>;
}

/// The driver of one SR.
pub enum SrDriver {
    File(FileDriver),
    Lvhd(LvhdDriver),
}

impl SrDriver {
    pub fn backend(&self) -> &dyn StorageBackend {
        match self {
            SrDriver::File(d) => d,
            SrDriver::Lvhd(d) => d,
        }
    }

    pub fn lvhd(&self) -> Option<&LvhdDriver> {
        match self {
            SrDriver::Lvhd(d) => Some(d),
            SrDriver::File(_) => None,
        }
    }

    pub fn is_lvhd(&self) -> bool {
        matches!(self, SrDriver::Lvhd(_))
    }
}
