//! Structured lifecycle events.
//!
//! Supervisors report what they do through an injected
//! [`SupervisorObserver`]. The CLI installs [`TracingObserver`]; tests use
//! [`RecordingObserver`] and assert on the recorded events.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use llmstack_probes::PortOwner;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ServiceKind;
use crate::result::SupervisorResult;
use crate::state::ServiceState;

const TARGET: &str = "llmstack::supervisor";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SupervisorEvent {
    StateChanged {
        service: ServiceKind,
        from: ServiceState,
        to: ServiceState,
    },
    /// A name match found more than one process.
    MultipleCandidates {
        service: ServiceKind,
        pids: Vec<u32>,
        owned: Option<u32>,
    },
    RestartingUnhealthy {
        service: ServiceKind,
        pids: Vec<u32>,
    },
    ExecutableResolved {
        service: ServiceKind,
        path: PathBuf,
    },
    Launched {
        service: ServiceKind,
        pid: u32,
    },
    WaitingForReady {
        service: ServiceKind,
        url: String,
        timeout: Duration,
    },
    Ready {
        service: ServiceKind,
        elapsed: Duration,
    },
    GracefulStopRequested {
        service: ServiceKind,
        pids: Vec<u32>,
    },
    StopProgress {
        service: ServiceKind,
        elapsed: Duration,
        remaining: Vec<u32>,
    },
    ForceKilling {
        service: ServiceKind,
        pids: Vec<u32>,
    },
    CompanionKilled {
        service: ServiceKind,
        pid: u32,
        name: String,
    },
    PortHeldByOther {
        service: ServiceKind,
        port: u16,
        owner: PortOwner,
    },
    DependencyNotHealthy {
        service: ServiceKind,
        dependency: ServiceKind,
    },
    Finished {
        service: ServiceKind,
        result: SupervisorResult,
    },
}

pub trait SupervisorObserver: Send + Sync {
    fn on_event(&self, event: &SupervisorEvent);
}

/// Forwards events to `tracing` under the `llmstack::supervisor` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl SupervisorObserver for TracingObserver {
    fn on_event(&self, event: &SupervisorEvent) {
        match event {
            SupervisorEvent::StateChanged { service, from, to } => {
                debug!(target: TARGET, %service, %from, %to, "State changed");
            }
            SupervisorEvent::MultipleCandidates {
                service,
                pids,
                owned,
            } => {
                warn!(
                    target: TARGET,
                    %service,
                    ?pids,
                    ?owned,
                    "{} matching processes found for {}",
                    pids.len(),
                    service
                );
            }
            SupervisorEvent::RestartingUnhealthy { service, pids } => {
                warn!(target: TARGET, %service, ?pids, "{} is running but unhealthy, restarting", service);
            }
            SupervisorEvent::ExecutableResolved { service, path } => {
                debug!(target: TARGET, %service, path = %path.display(), "Executable resolved");
            }
            SupervisorEvent::Launched { service, pid } => {
                info!(target: TARGET, %service, pid, "Launched {} (PID {})", service, pid);
            }
            SupervisorEvent::WaitingForReady {
                service,
                url,
                timeout,
            } => {
                info!(
                    target: TARGET,
                    %service,
                    %url,
                    timeout_secs = timeout.as_secs(),
                    "Waiting for {} to become ready",
                    service
                );
            }
            SupervisorEvent::Ready { service, elapsed } => {
                info!(
                    target: TARGET,
                    %service,
                    elapsed_secs = elapsed.as_secs_f64(),
                    "{} is ready after {:.1}s",
                    service,
                    elapsed.as_secs_f64()
                );
            }
            SupervisorEvent::GracefulStopRequested { service, pids } => {
                info!(target: TARGET, %service, ?pids, "Asking {} to shut down", service);
            }
            SupervisorEvent::StopProgress {
                service,
                elapsed,
                remaining,
            } => {
                info!(
                    target: TARGET,
                    %service,
                    ?remaining,
                    "Still waiting for {} to exit ({}s elapsed)",
                    service,
                    elapsed.as_secs()
                );
            }
            SupervisorEvent::ForceKilling { service, pids } => {
                warn!(target: TARGET, %service, ?pids, "Force-killing {}", service);
            }
            SupervisorEvent::CompanionKilled { service, pid, name } => {
                warn!(
                    target: TARGET,
                    %service,
                    pid,
                    %name,
                    "Killed companion process '{}' (PID {}); disable its startup entry to stop it relaunching {}",
                    name,
                    pid,
                    service
                );
            }
            SupervisorEvent::PortHeldByOther {
                service,
                port,
                owner,
            } => {
                warn!(
                    target: TARGET,
                    %service,
                    port,
                    owner_pid = owner.pid,
                    "Port {} is held by unrelated process {}",
                    port,
                    owner
                );
            }
            SupervisorEvent::DependencyNotHealthy {
                service,
                dependency,
            } => {
                warn!(
                    target: TARGET,
                    %service,
                    %dependency,
                    "{} is not healthy; {} may fail to start",
                    dependency,
                    service
                );
            }
            SupervisorEvent::Finished { service, result } => {
                if result.is_success() {
                    info!(target: TARGET, %service, %result, "{}: {}", service, result);
                } else {
                    warn!(target: TARGET, %service, %result, "{}: {}", service, result);
                }
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<SupervisorEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SupervisorEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl SupervisorObserver for RecordingObserver {
    fn on_event(&self, event: &SupervisorEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
