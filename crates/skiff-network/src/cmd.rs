//! Thin wrappers around the `ip` tool.

use tokio::process::Command;

use crate::netns::NetnsRef;

/// Run `ip <args>` on the host. Errors carry the tool's stderr.
pub(crate) async fn ip(args: &[&str]) -> Result<(), String> {
    run(Command::new("ip").args(args)).await
}

/// Run `ip <args>` inside `netns`.
pub(crate) async fn ip_in(netns: &NetnsRef, args: &[&str]) -> Result<(), String> {
    run(Command::new("nsenter")
        .arg(netns.nsenter_arg())
        .arg("--")
        .arg("ip")
        .args(args))
    .await
}

async fn run(cmd: &mut Command) -> Result<(), String> {
    tracing::trace!(command = ?cmd.as_std(), "Running");
    let output = cmd
        .output()
        .await
        .map_err(|e| format!("failed to spawn {:?}: {e}", cmd.as_std().get_program()))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(if stderr.is_empty() {
            format!("exited with {}", output.status)
        } else {
            stderr
        })
    }
}

/// Whether an `ip` error means the device is already gone.
pub(crate) fn is_missing_device(stderr: &str) -> bool {
    stderr.contains("Cannot find device") || stderr.contains("does not exist")
}

/// Whether an `ip` error means the object already exists.
pub(crate) fn is_already_exists(stderr: &str) -> bool {
    stderr.contains("File exists")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(is_missing_device("Cannot find device \"skh-c1\""));
        assert!(is_already_exists("RTNETLINK answers: File exists"));
        assert!(!is_missing_device("RTNETLINK answers: Operation not permitted"));
    }
}
