//! [`LvBackend`] over the LVM2 command-line tools.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, warn};
use vhdgc_proto::constants::LV_PREFIX_RAW;
use vhdgc_proto::{GcError, GcResult, VdiType};

use super::vhdutil::parse_scan_line;
use super::{parse_u64, run};
use crate::lvm::{parse_lv_name, LvBackend, LvVdiInfo, VgStats};
use crate::vhd::VhdInfo;

const HIDDEN_TAG: &str = "hidden";

/// Drives `lvs`, `vgs`, `lvcreate`, `lvremove`, `lvrename`, `lvresize`
/// and `lvchange`. VHD metadata inside volumes is read with `vhd-util`.
pub struct LvmTools {
    vhd_util: String,
}

impl Default for LvmTools {
    fn default() -> Self {
        Self::new("vhd-util")
    }
}

/// One row of `lvs` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LvRow {
    pub name: String,
    pub size: u64,
    pub active: bool,
    pub readonly: bool,
    pub hidden: bool,
}

/// Parse `lvs --noheadings --units b --nosuffix --separator , -o
/// lv_name,lv_size,lv_attr,lv_tags`.
pub(crate) fn parse_lvs_line(line: &str) -> Option<LvRow> {
    let mut fields = line.trim().split(',');
    let name = fields.next()?.trim().to_string();
    let size = fields.next()?.trim().parse().ok()?;
    let attr = fields.next()?.trim().as_bytes().to_vec();
    let tags = fields.collect::<Vec<_>>().join(",");
    Some(LvRow {
        name,
        size,
        readonly: attr.get(1) == Some(&b'r'),
        active: attr.get(4) == Some(&b'a'),
        hidden: tags.split(',').any(|t| t.trim() == HIDDEN_TAG),
    })
}

impl LvmTools {
    pub fn new(vhd_util: impl Into<String>) -> Self {
        Self {
            vhd_util: vhd_util.into(),
        }
    }

    fn lv_ref(vg: &str, lv: &str) -> String {
        format!("{}/{}", vg, lv)
    }

    async fn lvs(&self, vg: &str) -> GcResult<Vec<LvRow>> {
        let out = run(
            "lvs",
            [
                "--noheadings",
                "--units",
                "b",
                "--nosuffix",
                "--separator",
                ",",
                "-o",
                "lv_name,lv_size,lv_attr,lv_tags",
                vg,
            ],
        )
        .await
        .map_err(|e| GcError::ScanFailed(e.to_string()))?;
        Ok(out.lines().filter_map(parse_lvs_line).collect())
    }

    /// VHD headers of every `VHD-*` volume in the group.
    async fn scan_vhd_headers(&self, vg: &str) -> GcResult<HashMap<String, VhdInfo>> {
        let out = run(&self.vhd_util, ["scan", "-f", "-m", "VHD-*", "-l", vg])
            .await
            .map_err(|e| GcError::ScanFailed(e.to_string()))?;
        Ok(out
            .lines()
            .filter_map(parse_scan_line)
            .map(|info| (info.uuid.clone(), info))
            .collect())
    }

    async fn resize(&self, vg: &str, lv: &str, size: u64) -> GcResult<()> {
        let size = format!("{}b", size);
        run("lvresize", ["-f", "-L", size.as_str(), Self::lv_ref(vg, lv).as_str()])
            .await
            .map(drop)
    }

    /// Move the VHD footer to the end of a `size`-byte volume.
    async fn set_vhd_footer(&self, vg: &str, lv: &str, size: u64) -> GcResult<()> {
        let path = self.lv_path(vg, lv);
        let size = size.to_string();
        let path = path.to_string_lossy().into_owned();
        run(&self.vhd_util, ["modify", "-n", path.as_str(), "-s", size.as_str()])
            .await
            .map(drop)
    }
}

#[async_trait]
impl LvBackend for LvmTools {
    fn name(&self) -> &str {
        "lvm"
    }

    async fn refresh(&self, vg: &str) -> GcResult<()> {
        run("vgscan", ["--cache", vg]).await.map(drop)
    }

    async fn scan_vdis(&self, vg: &str) -> GcResult<Vec<LvVdiInfo>> {
        let rows = self.lvs(vg).await?;
        let headers = self.scan_vhd_headers(vg).await?;
        let mut vdis = Vec::with_capacity(rows.len());
        for row in rows {
            let Some((uuid, vdi_type)) = parse_lv_name(&row.name) else {
                continue;
            };
            let mut info = LvVdiInfo {
                uuid,
                lv_name: row.name.clone(),
                vdi_type,
                size_lv: row.size,
                size_virt: row.size,
                hidden: row.hidden,
                active: row.active,
                readonly: row.readonly,
                parent_uuid: String::new(),
                scan_error: false,
            };
            if vdi_type == VdiType::Vhd {
                match headers.get(&info.uuid) {
                    Some(hdr) => {
                        info.size_virt = hdr.size_virt;
                        info.hidden = hdr.hidden;
                        info.parent_uuid = hdr.parent_uuid.clone();
                        info.scan_error = hdr.error;
                    }
                    None => {
                        warn!("lvm: no VHD header for {}/{}", vg, row.name);
                        info.scan_error = true;
                    }
                }
            }
            vdis.push(info);
        }
        Ok(vdis)
    }

    async fn exists(&self, vg: &str, lv: &str) -> GcResult<bool> {
        Ok(self.lvs(vg).await?.iter().any(|r| r.name == lv))
    }

    async fn create(&self, vg: &str, lv: &str, size: u64) -> GcResult<()> {
        let size = format!("{}b", size);
        run("lvcreate", ["-n", lv, "-L", size.as_str(), vg]).await.map(drop)
    }

    async fn remove(&self, vg: &str, lv: &str) -> GcResult<()> {
        run("lvremove", ["-f", Self::lv_ref(vg, lv).as_str()]).await.map(drop)
    }

    async fn rename(&self, vg: &str, old: &str, new: &str) -> GcResult<()> {
        debug!("lvm: rename {}/{} -> {}", vg, old, new);
        run("lvrename", [vg, old, new]).await.map(drop)
    }

    async fn size(&self, vg: &str, lv: &str) -> GcResult<u64> {
        let out = run(
            "lvs",
            [
                "--noheadings",
                "--units",
                "b",
                "--nosuffix",
                "-o",
                "lv_size",
                Self::lv_ref(vg, lv).as_str(),
            ],
        )
        .await?;
        parse_u64(&out, "LV size")
    }

    async fn inflate(&self, vg: &str, lv: &str, size: u64) -> GcResult<()> {
        if self.size(vg, lv).await? >= size {
            return Ok(());
        }
        self.resize(vg, lv, size).await?;
        if lv.starts_with(LV_PREFIX_RAW) {
            return Ok(());
        }
        self.set_vhd_footer(vg, lv, size).await
    }

    async fn deflate(&self, vg: &str, lv: &str, size: u64) -> GcResult<()> {
        if self.size(vg, lv).await? <= size {
            return Ok(());
        }
        self.set_vhd_footer(vg, lv, size).await?;
        self.resize(vg, lv, size).await
    }

    async fn activate(&self, vg: &str, lv: &str) -> GcResult<()> {
        run("lvchange", ["-ay", Self::lv_ref(vg, lv).as_str()]).await.map(drop)
    }

    async fn deactivate(&self, vg: &str, lv: &str) -> GcResult<()> {
        run("lvchange", ["-an", Self::lv_ref(vg, lv).as_str()]).await.map(drop)
    }

    async fn set_hidden(&self, vg: &str, lv: &str, hidden: bool) -> GcResult<()> {
        let op = if hidden { "--addtag" } else { "--deltag" };
        run("lvchange", [op, HIDDEN_TAG, Self::lv_ref(vg, lv).as_str()])
            .await
            .map(drop)
    }

    async fn set_readonly(&self, vg: &str, lv: &str, readonly: bool) -> GcResult<()> {
        let perm = if readonly { "r" } else { "rw" };
        run("lvchange", ["-p", perm, Self::lv_ref(vg, lv).as_str()])
            .await
            .map(drop)
    }

    async fn vg_stats(&self, vg: &str) -> GcResult<VgStats> {
        let out = run(
            "vgs",
            ["--noheadings", "--units", "b", "--nosuffix", "--separator", ",", "-o", "vg_size,vg_free", vg],
        )
        .await?;
        let (size, free) = out
            .trim()
            .split_once(',')
            .ok_or_else(|| GcError::ScanFailed(format!("bad vgs output {:?}", out.trim())))?;
        let physical_size = parse_u64(size, "VG size")?;
        let free = parse_u64(free, "VG free")?;
        Ok(VgStats {
            physical_size,
            physical_utilisation: physical_size.saturating_sub(free),
        })
    }
}
