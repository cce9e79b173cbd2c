//! `adb reverse` port forwarding for the USB transport.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio::time::{Duration, timeout};

use crate::error::TransportError;

/// Command the user can run by hand when forwarding fails.
pub fn manual_command(port: u16) -> String {
    format!("adb reverse tcp:{} tcp:{}", port, port)
}

/// Executables to try, most specific install location last.
pub fn adb_candidates() -> Vec<PathBuf> {
    candidates_from(
        std::env::var_os("ANDROID_SDK_ROOT").map(PathBuf::from),
        std::env::var_os("ANDROID_HOME").map(PathBuf::from),
        std::env::var_os("HOME").map(PathBuf::from),
    )
}

fn candidates_from(
    sdk_root: Option<PathBuf>,
    android_home: Option<PathBuf>,
    home: Option<PathBuf>,
) -> Vec<PathBuf> {
    let mut out = vec![PathBuf::from("adb")];
    for root in [sdk_root, android_home].into_iter().flatten() {
        let path = root.join("platform-tools").join("adb");
        if !out.contains(&path) {
            out.push(path);
        }
    }
    if let Some(home) = home {
        out.push(home.join("Android").join("Sdk").join("platform-tools").join("adb"));
    }
    out
}

async fn run_reverse(executable: &Path, port: u16, limit: Duration) -> Result<(), String> {
    let spec = format!("tcp:{}", port);
    let child = Command::new(executable)
        .args(["reverse", &spec, &spec])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("Failed to spawn {}: {}", executable.display(), e))?;

    let output = timeout(limit, child.wait_with_output())
        .await
        .map_err(|_| format!("{} timed out after {}ms", executable.display(), limit.as_millis()))?
        .map_err(|e| format!("Failed to wait for {}: {}", executable.display(), e))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(format!(
            "{} exited with {}: {}",
            executable.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

/// Forward `port` on the phone to the same port on this machine.
///
/// Each candidate gets `limit` to finish; the first success wins.
pub async fn reverse_port(port: u16, limit: Duration) -> Result<(), TransportError> {
    reverse_with(&adb_candidates(), port, limit).await
}

pub(crate) async fn reverse_with(
    candidates: &[PathBuf],
    port: u16,
    limit: Duration,
) -> Result<(), TransportError> {
    let mut failures = Vec::new();
    for exe in candidates {
        match run_reverse(exe, port, limit).await {
            Ok(()) => {
                log::info!("adb reverse set up for port {} via {}", port, exe.display());
                return Ok(());
            }
            Err(e) => {
                log::debug!("adb candidate failed: {}", e);
                failures.push(e);
            }
        }
    }
    log::warn!("All adb candidates failed for port {}", port);
    Err(TransportError::PortForward(format!(
        "{}. Run manually: {}",
        failures.last().map(String::as_str).unwrap_or("adb not found"),
        manual_command(port)
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_are_ordered_and_deduplicated() {
        let sdk = PathBuf::from("/opt/sdk");
        let list = candidates_from(Some(sdk.clone()), Some(sdk), Some(PathBuf::from("/home/u")));
        assert_eq!(
            list,
            vec![
                PathBuf::from("adb"),
                PathBuf::from("/opt/sdk/platform-tools/adb"),
                PathBuf::from("/home/u/Android/Sdk/platform-tools/adb"),
            ]
        );
    }

    #[test]
    fn path_lookup_comes_first_without_env() {
        assert_eq!(candidates_from(None, None, None), vec![PathBuf::from("adb")]);
    }

    #[tokio::test]
    async fn missing_adb_reports_manual_command() {
        let err = reverse_with(
            &[PathBuf::from("/nonexistent/micyou/adb")],
            6000,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("adb reverse tcp:6000 tcp:6000"), "{}", msg);
    }
}
