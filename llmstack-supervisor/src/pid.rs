//! Records of the PIDs this tool launched.
//!
//! Name matching finds foreign instances too; the PID record tells us which
//! of the matches we started ourselves.

use std::path::{Path, PathBuf};

use llmstack_probes::ProcessInspector;
use tokio::fs;
use tracing::warn;

use crate::config::ServiceKind;
use crate::error::{Result, SupervisorError};

/// Result of validating a PID file
#[derive(Debug, PartialEq, Eq)]
pub enum PidStatus {
    /// Process is running with the given PID
    Running(u32),
    /// PID file doesn't exist
    NotFound,
    /// PID file was stale and has been removed
    StaleRemoved,
}

pub fn pid_file(state_dir: &Path, service: ServiceKind) -> PathBuf {
    state_dir.join(format!("{service}.pid"))
}

/// Read the recorded PID without touching the file. Unreadable or
/// malformed records read as `None`.
pub async fn read_pid(pid_file: &Path) -> Option<u32> {
    let content = fs::read_to_string(pid_file).await.ok()?;
    content.trim().parse().ok()
}

/// Check the recorded PID against the process table, removing stale files.
pub async fn check_pid_file(pid_file: &Path, inspector: &dyn ProcessInspector) -> Result<PidStatus> {
    if !fs::try_exists(pid_file).await.unwrap_or(false) {
        return Ok(PidStatus::NotFound);
    }

    let Some(pid) = read_pid(pid_file).await else {
        warn!("Invalid PID file {}, removing", pid_file.display());
        remove_pid(pid_file).await?;
        return Ok(PidStatus::StaleRemoved);
    };

    if inspector.get(pid).await?.is_some() {
        Ok(PidStatus::Running(pid))
    } else {
        warn!("Stale PID {} in {}, removing", pid, pid_file.display());
        remove_pid(pid_file).await?;
        Ok(PidStatus::StaleRemoved)
    }
}

/// Write PID to a file
pub async fn write_pid(pid_file: &Path, pid: u32) -> Result<()> {
    fs::write(pid_file, pid.to_string())
        .await
        .map_err(|e| SupervisorError::io(pid_file, e))
}

/// Remove a PID file. A missing file is not an error.
pub async fn remove_pid(pid_file: &Path) -> Result<()> {
    match fs::remove_file(pid_file).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SupervisorError::io(pid_file, e)),
    }
}
