//! File SR: one `<uuid>.vhd` file per VDI in the SR directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};
use vhdgc_core::VhdBackend;
use vhdgc_proto::constants::LV_PREFIX_JOURNAL;
use vhdgc_proto::GcResult;

use super::StorageBackend;
use crate::vdi::{Backing, Vdi};

const VHD_PATTERN: &str = "*.vhd";

pub struct FileDriver {
    path: PathBuf,
    vhd: Arc<dyn VhdBackend>,
}

impl FileDriver {
    pub fn new(path: impl Into<PathBuf>, vhd: Arc<dyn VhdBackend>) -> Self {
        Self {
            path: path.into(),
            vhd,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StorageBackend for FileDriver {
    fn name(&self) -> &str {
        "file"
    }

    async fn scan_once(&self) -> GcResult<Vec<Vdi>> {
        let infos = self.vhd.scan(&self.path, VHD_PATTERN).await?;
        Ok(infos
            .into_iter()
            .map(|info| {
                if info.error {
                    error!("scan: error reading {}", info.path.display());
                }
                Vdi {
                    uuid: info.uuid,
                    parent_uuid: info.parent_uuid,
                    parent: None,
                    children: Vec::new(),
                    size_virt: info.size_virt,
                    size_vhd: (!info.error).then_some(info.size_phys),
                    hidden: info.hidden,
                    scan_error: info.error,
                    path: info.path,
                    backing: Backing::File,
                }
            })
            .collect())
    }

    async fn free_space(&self) -> GcResult<u64> {
        self.vhd.free_space(&self.path).await
    }

    async fn size_vhd(&self, vdi: &Vdi) -> GcResult<u64> {
        self.vhd.size_phys(&vdi.path).await
    }

    async fn set_hidden(&self, vdi: &mut Vdi, hidden: bool) -> GcResult<()> {
        self.vhd.set_hidden(&vdi.path, hidden).await?;
        vdi.hidden = hidden;
        Ok(())
    }

    async fn set_parent(&self, child: &Vdi, parent: &Vdi) -> GcResult<()> {
        self.vhd.set_parent(&child.path, &parent.path, false).await
    }

    async fn set_size_virt(&self, vdi: &mut Vdi, size: u64) -> GcResult<()> {
        let journal = self.path.join(format!("{}{}", LV_PREFIX_JOURNAL, vdi.uuid));
        self.vhd.set_size_virt(&vdi.path, size, &journal).await?;
        vdi.size_virt = size;
        Ok(())
    }

    async fn delete(&self, vdi: &Vdi) -> GcResult<()> {
        debug!("file: deleting {}", vdi.path.display());
        self.vhd.destroy(&vdi.path).await
    }

    async fn cleanup(&self) -> GcResult<()> {
        Ok(())
    }

    fn vhd(&self) -> &Arc<dyn VhdBackend> {
        &self.vhd
    }
}
