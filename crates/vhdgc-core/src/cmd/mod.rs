//! Production backends that drive the storage command-line tools.

mod lvm;
mod vhdutil;

pub use lvm::LvmTools;
pub use vhdutil::VhdUtil;

use std::ffi::OsStr;

use tokio::process::Command;
use tracing::{debug, warn};
use vhdgc_proto::{GcError, GcResult};

/// Run `program args...` and return its stdout as text.
pub(crate) async fn run<I, S>(program: &str, args: I) -> GcResult<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let stdout = run_raw(program, args).await?;
    Ok(String::from_utf8_lossy(&stdout).into_owned())
}

/// Run `program args...` and return its raw stdout.
///
/// The child is killed if the future is dropped, so an aborted
/// operation does not leave a tool running behind the engine's back.
pub(crate) async fn run_raw<I, S>(program: &str, args: I) -> GcResult<Vec<u8>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
    debug!("cmd: {} {:?}", program, args);
    let output = Command::new(program)
        .args(&args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| GcError::failed(format!("failed to run {}: {}", program, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!("cmd: {} {:?} failed ({}): {}", program, args, output.status, stderr.trim());
        return Err(GcError::failed(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            stderr.trim()
        )));
    }
    Ok(output.stdout)
}

/// Parse a decimal number printed by a tool.
pub(crate) fn parse_u64(text: &str, what: &str) -> GcResult<u64> {
    text.trim()
        .parse()
        .map_err(|_| GcError::ScanFailed(format!("bad {} value {:?}", what, text.trim())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let out = run("echo", ["hello"]).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_reports_failure() {
        let err = run("false", Vec::<String>::new()).await.unwrap_err();
        assert!(matches!(err, GcError::Transient(_)));
    }

    #[test]
    fn test_parse_u64() {
        assert_eq!(parse_u64(" 42\n", "size").unwrap(), 42);
        assert!(matches!(parse_u64("x", "size"), Err(GcError::ScanFailed(_))));
    }
}
