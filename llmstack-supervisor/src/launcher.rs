use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use process_wrap::tokio::{CommandWrap, ProcessSession};
use tokio::process::Command;
use tracing::debug;

use crate::config::ServiceKind;

/// Everything needed to launch one service process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub service: ServiceKind,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub log_dir: PathBuf,
}

impl LaunchSpec {
    pub fn stdout_log(&self) -> PathBuf {
        self.log_dir.join(format!("{}.stdout.log", self.service))
    }

    pub fn stderr_log(&self) -> PathBuf {
        self.log_dir.join(format!("{}.stderr.log", self.service))
    }
}

/// Starts a process that outlives the caller and returns its PID.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> std::io::Result<u32>;
}

/// Launch in a fresh session with output appended to per-service log files.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedLauncher;

fn open_log(path: &Path) -> std::io::Result<std::fs::File> {
    OpenOptions::new().create(true).append(true).open(path)
}

#[async_trait]
impl Launcher for DetachedLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> std::io::Result<u32> {
        let stdout = open_log(&spec.stdout_log())?;
        let stderr = open_log(&spec.stderr_log())?;

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        let mut command_wrap = CommandWrap::from(command);
        command_wrap.wrap(ProcessSession);
        let child = command_wrap.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| std::io::Error::other("spawned process has no PID"))?;

        debug!(
            "Launched {} as PID {} (logs in {})",
            spec.program.display(),
            pid,
            spec.log_dir.display()
        );
        // Dropping the handle neither waits for nor kills the child.
        drop(child);
        Ok(pid)
    }
}
