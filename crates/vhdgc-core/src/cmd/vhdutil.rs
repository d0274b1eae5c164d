//! [`VhdBackend`] over the `vhd-util` tool.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::warn;
use vhdgc_proto::{GcError, GcResult};

use super::{parse_u64, run, run_raw};
use crate::vhd::{uuid_from_path, VhdBackend, VhdInfo};

const MIB: u64 = 1024 * 1024;

/// Drives `vhd-util`.
pub struct VhdUtil {
    bin: String,
}

impl Default for VhdUtil {
    fn default() -> Self {
        Self::new("vhd-util")
    }
}

impl VhdUtil {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    /// `vhd-util <subcommand> -n <path> <options...>`
    fn argv(args: &[&str], path: &Path) -> Vec<OsString> {
        let mut argv: Vec<OsString> = Vec::with_capacity(args.len() + 2);
        argv.push(args[0].into());
        argv.push("-n".into());
        argv.push(path.as_os_str().to_os_string());
        argv.extend(args[1..].iter().map(|a| OsString::from(*a)));
        argv
    }

    async fn exec(&self, args: &[&str], path: &Path) -> GcResult<String> {
        run(&self.bin, Self::argv(args, path)).await
    }
}

/// Parse one line of `vhd-util scan -f -m` output:
/// `vhd=<path> capacity=<bytes> size=<bytes> hidden=<0|1> parent=<path|none>`.
/// Entries that failed to open carry `scan-error=<errno>`.
pub(crate) fn parse_scan_line(line: &str) -> Option<VhdInfo> {
    let mut path = None;
    let mut info = VhdInfo {
        uuid: String::new(),
        path: PathBuf::new(),
        parent_uuid: String::new(),
        size_virt: 0,
        size_phys: 0,
        hidden: false,
        error: false,
    };
    for field in line.split_whitespace() {
        let Some((key, value)) = field.split_once('=') else {
            continue;
        };
        match key {
            "vhd" => path = Some(PathBuf::from(value)),
            "capacity" => info.size_virt = value.parse().unwrap_or(0),
            "size" => info.size_phys = value.parse().unwrap_or(0),
            "hidden" => info.hidden = value == "1",
            "parent" if value != "none" => {
                info.parent_uuid = uuid_from_path(Path::new(value)).unwrap_or_default();
            }
            "scan-error" => info.error = true,
            _ => {}
        }
    }
    let path = path?;
    info.uuid = uuid_from_path(&path)?;
    info.path = path;
    Some(info)
}

#[async_trait]
impl VhdBackend for VhdUtil {
    fn name(&self) -> &str {
        "vhd-util"
    }

    async fn scan(&self, dir: &Path, pattern: &str) -> GcResult<Vec<VhdInfo>> {
        let glob = dir.join(pattern);
        let argv = [OsStr::new("scan"), OsStr::new("-f"), OsStr::new("-m"), glob.as_os_str()];
        let out = run(&self.bin, argv)
            .await
            .map_err(|e| GcError::ScanFailed(e.to_string()))?;

        let mut infos = Vec::new();
        for line in out.lines().filter(|l| !l.trim().is_empty()) {
            match parse_scan_line(line) {
                Some(info) => infos.push(info),
                None => warn!("vhd-util: unparsable scan line {:?}", line),
            }
        }
        Ok(infos)
    }

    async fn info(&self, path: &Path) -> GcResult<VhdInfo> {
        let parent = self.parent(path).await?;
        Ok(VhdInfo {
            uuid: uuid_from_path(path).unwrap_or_default(),
            path: path.to_path_buf(),
            parent_uuid: parent.unwrap_or_default(),
            size_virt: self.size_virt(path).await?,
            size_phys: self.size_phys(path).await?,
            hidden: self.exec(&["query", "-f", "hidden"], path).await?.contains('1'),
            error: false,
        })
    }

    async fn parent(&self, path: &Path) -> GcResult<Option<String>> {
        let out = self.exec(&["query", "-p"], path).await?;
        let out = out.trim();
        if out.contains("has no parent") || out.is_empty() {
            return Ok(None);
        }
        Ok(uuid_from_path(Path::new(out)))
    }

    async fn set_parent(&self, path: &Path, parent: &Path, parent_raw: bool) -> GcResult<()> {
        let parent = parent.to_string_lossy().into_owned();
        let mut args = vec!["modify", "-p", parent.as_str()];
        if parent_raw {
            args.push("-m");
        }
        self.exec(&args, path).await.map(drop)
    }

    async fn set_hidden(&self, path: &Path, hidden: bool) -> GcResult<()> {
        let value = if hidden { "1" } else { "0" };
        self.exec(&["set", "-f", "hidden", "-v", value], path)
            .await
            .map(drop)
    }

    async fn size_virt(&self, path: &Path) -> GcResult<u64> {
        let out = self.exec(&["query", "-v"], path).await?;
        Ok(parse_u64(&out, "virtual size")? * MIB)
    }

    async fn size_phys(&self, path: &Path) -> GcResult<u64> {
        let out = self.exec(&["query", "-s"], path).await?;
        parse_u64(&out, "physical size")
    }

    async fn max_resize_size(&self, path: &Path) -> GcResult<u64> {
        let out = self.exec(&["query", "-S"], path).await?;
        Ok(parse_u64(&out, "max resize size")? * MIB)
    }

    async fn set_size_virt_fast(&self, path: &Path, size: u64) -> GcResult<()> {
        let size_mb = (size / MIB).to_string();
        self.exec(&["resize", "-s", size_mb.as_str(), "-f"], path)
            .await
            .map(drop)
    }

    async fn set_size_virt(&self, path: &Path, size: u64, journal: &Path) -> GcResult<()> {
        let size_mb = (size / MIB).to_string();
        let journal = journal.to_string_lossy().into_owned();
        self.exec(&["resize", "-s", size_mb.as_str(), "-j", journal.as_str()], path)
            .await
            .map(drop)
    }

    async fn coalesce(&self, path: &Path) -> GcResult<()> {
        self.exec(&["coalesce"], path).await.map(drop)
    }

    async fn block_bitmap(&self, path: &Path) -> GcResult<Vec<u8>> {
        run_raw(&self.bin, Self::argv(&["read", "-B"], path)).await
    }

    async fn check(&self, path: &Path) -> GcResult<()> {
        self.exec(&["check"], path).await.map(drop)
    }

    async fn repair(&self, path: &Path) -> GcResult<()> {
        self.exec(&["repair"], path).await.map(drop)
    }

    async fn destroy(&self, path: &Path) -> GcResult<()> {
        tokio::fs::remove_file(path).await?;
        Ok(())
    }
}
