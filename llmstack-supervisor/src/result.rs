use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use llmstack_probes::{PortOwner, PortState, ProcessRecord};
use serde::Serialize;

use crate::config::ServiceKind;
use crate::state::ServiceState;

/// Why a start did not produce a running service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StartFailure {
    ExecutableNotFound { searched: Vec<String> },
    DirectoryCreationFailed { path: PathBuf, message: String },
    /// The port is bound by a process this service does not own.
    PortInUse { holder: Option<PortOwner> },
    LaunchFailed { message: String },
    ExitedImmediately,
    /// An unhealthy instance could not be cleared away before relaunching.
    ExistingProcessSurvived { pids: Vec<u32> },
}

impl fmt::Display for StartFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartFailure::ExecutableNotFound { .. } => f.write_str("executable not found"),
            StartFailure::DirectoryCreationFailed { path, message } => {
                write!(f, "directory creation failed: {}: {}", path.display(), message)
            }
            StartFailure::PortInUse { holder: Some(holder) } => {
                write!(f, "port already in use by {holder}")
            }
            StartFailure::PortInUse { holder: None } => {
                f.write_str("port already in use by an unknown process")
            }
            StartFailure::LaunchFailed { message } => write!(f, "launch failed: {message}"),
            StartFailure::ExitedImmediately => f.write_str("process exited immediately"),
            StartFailure::ExistingProcessSurvived { pids } => write!(
                f,
                "existing unhealthy process survived force-kill (PIDs {})",
                join_pids(pids)
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopFailure {
    SurvivedForceKill { pids: Vec<u32> },
}

impl fmt::Display for StopFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopFailure::SurvivedForceKill { pids } => write!(
                f,
                "process survived force-kill (PIDs {})",
                join_pids(pids)
            ),
        }
    }
}

fn join_pids(pids: &[u32]) -> String {
    pids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Outcome of a lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum SupervisorResult {
    AlreadyHealthy,
    Started,
    StartFailed(StartFailure),
    AlreadyStopped,
    StoppedGracefully,
    StoppedForcibly,
    StopFailed(StopFailure),
    /// Launched but never became healthy; the process is left running.
    Timeout,
}

impl SupervisorResult {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            SupervisorResult::AlreadyHealthy
                | SupervisorResult::Started
                | SupervisorResult::AlreadyStopped
                | SupervisorResult::StoppedGracefully
                | SupervisorResult::StoppedForcibly
        )
    }

    /// Whether a dependent service may be started after this result.
    pub fn permits_dependents(&self) -> bool {
        matches!(
            self,
            SupervisorResult::AlreadyHealthy | SupervisorResult::Started
        )
    }
}

impl fmt::Display for SupervisorResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorResult::AlreadyHealthy => f.write_str("already running and healthy"),
            SupervisorResult::Started => f.write_str("started"),
            SupervisorResult::StartFailed(reason) => write!(f, "start failed: {reason}"),
            SupervisorResult::AlreadyStopped => f.write_str("already stopped"),
            SupervisorResult::StoppedGracefully => f.write_str("stopped gracefully"),
            SupervisorResult::StoppedForcibly => f.write_str("stopped forcibly"),
            SupervisorResult::StopFailed(reason) => write!(f, "stop failed: {reason}"),
            SupervisorResult::Timeout => {
                f.write_str("timed out waiting for the service to become healthy")
            }
        }
    }
}

/// Result of a single `start` or `stop` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleReport {
    pub service: ServiceKind,
    pub result: SupervisorResult,
    /// PID of the process now serving, when one is known.
    pub pid: Option<u32>,
    /// The service port is still bound by something other than this service.
    /// Set even when the holder cannot be identified.
    pub port_held: bool,
    /// Unrelated processes found listening on the service port.
    pub port_holders: Vec<PortOwner>,
}

impl LifecycleReport {
    pub fn new(service: ServiceKind, result: SupervisorResult) -> Self {
        Self {
            service,
            result,
            pid: None,
            port_held: false,
            port_holders: Vec::new(),
        }
    }

    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = pid;
        self
    }

    pub fn is_success(&self) -> bool {
        self.result.is_success() && !self.port_held
    }
}

/// A matched process plus whether this tool launched it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservedProcess {
    #[serde(flatten)]
    pub record: ProcessRecord,
    pub owned: bool,
}

/// Runtime observation of one service. Built fresh on every inspection.
///
/// `running`, `port.listening` and `healthy` are independent signals: a
/// process can be alive before its port is bound, and the port can be bound
/// before the liveness endpoint answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceHandle {
    pub service: ServiceKind,
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub memory_bytes: Option<u64>,
    #[serde(skip)]
    pub started_at: Option<SystemTime>,
    pub running: bool,
    pub port_active: bool,
    pub healthy: bool,
    pub url: String,
    pub port: PortState,
    pub processes: Vec<ObservedProcess>,
    /// Installed model count reported by the inference server.
    pub models: Option<usize>,
}

impl ServiceHandle {
    pub fn is_fully_healthy(&self) -> bool {
        self.running && self.port_active && self.healthy
    }

    pub fn uptime(&self) -> Option<Duration> {
        self.started_at
            .and_then(|started| SystemTime::now().duration_since(started).ok())
    }

    /// Listeners on the service port that are not this service's processes.
    pub fn port_squatters(&self) -> Vec<PortOwner> {
        let pids: Vec<u32> = self.processes.iter().map(|p| p.record.pid).collect();
        self.port.foreign_owners(&pids).cloned().collect()
    }
}
