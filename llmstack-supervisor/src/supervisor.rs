//! Per-service lifecycle supervision.
//!
//! [`ServiceSupervisor`] composes the process inspector, port prober, health
//! checker and launcher into idempotent `start`, `stop` and `status`
//! operations. Every wait is cancellable through a [`CancellationToken`],
//! and concurrent `start`/`stop` calls on one service are rejected with
//! [`SupervisorError::Busy`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use llmstack_probes::{
    HealthChecker, HttpHealthChecker, NetstatPortProber, PortProber, ProbeError, ProcessInspector,
    ProcessMatcher, ProcfsInspector, Termination, check_with_retries, wait_until_ready,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{ServiceDescriptor, ServiceKind, StackConfig};
use crate::discovery::{resolve_executable, searched_locations};
use crate::environment::ensure_dir;
use crate::error::{Result, SupervisorError};
use crate::launcher::{DetachedLauncher, LaunchSpec, Launcher};
use crate::lock::ServiceLock;
use crate::observer::{SupervisorEvent, SupervisorObserver};
use crate::pid;
use crate::result::{
    LifecycleReport, ObservedProcess, ServiceHandle, StartFailure, StopFailure, SupervisorResult,
};
use crate::state::{Event, ServiceState};

/// The OS-facing collaborators of a supervisor.
#[derive(Clone)]
pub struct Probes {
    pub processes: Arc<dyn ProcessInspector>,
    pub ports: Arc<dyn PortProber>,
    pub health: Arc<dyn HealthChecker>,
    pub launcher: Arc<dyn Launcher>,
}

impl Probes {
    /// Probes backed by procfs, the socket table, HTTP and detached launches.
    pub fn system(health_timeout: Duration) -> Result<Self> {
        Ok(Self {
            processes: Arc::new(ProcfsInspector::default()),
            ports: Arc::new(NetstatPortProber::default()),
            health: Arc::new(HttpHealthChecker::new(health_timeout)?),
            launcher: Arc::new(DetachedLauncher),
        })
    }
}

pub struct ServiceSupervisor {
    config: Arc<StackConfig>,
    kind: ServiceKind,
    matcher: ProcessMatcher,
    companions: ProcessMatcher,
    probes: Probes,
    observer: Arc<dyn SupervisorObserver>,
    gate: tokio::sync::Mutex<()>,
    state: std::sync::Mutex<ServiceState>,
}

fn pids_of(processes: &[ObservedProcess]) -> Vec<u32> {
    processes.iter().map(|p| p.record.pid).collect()
}

/// The process we launched if it is among the matches, else the first match.
fn primary(processes: &[ObservedProcess]) -> Option<&ObservedProcess> {
    processes
        .iter()
        .find(|p| p.owned)
        .or_else(|| processes.first())
}

impl ServiceSupervisor {
    pub fn new(
        config: Arc<StackConfig>,
        kind: ServiceKind,
        probes: Probes,
        observer: Arc<dyn SupervisorObserver>,
    ) -> Result<Self> {
        let descriptor = config.service(kind);
        let matcher = descriptor.matcher()?;
        let companions = descriptor.companion_matcher()?;
        Ok(Self {
            config,
            kind,
            matcher,
            companions,
            probes,
            observer,
            gate: tokio::sync::Mutex::new(()),
            state: std::sync::Mutex::new(ServiceState::Unknown),
        })
    }

    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        self.config.service(self.kind)
    }

    /// Last state this supervisor moved the service into.
    pub fn state(&self) -> ServiceState {
        self.state.lock().map(|s| *s).unwrap_or_default()
    }

    fn pid_file(&self) -> PathBuf {
        pid::pid_file(&self.config.state_dir, self.kind)
    }

    fn emit(&self, event: SupervisorEvent) {
        self.observer.on_event(&event);
    }

    fn transition(&self, event: Event) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let from = *state;
        let to = from.on_event(event);
        *state = to;
        drop(state);
        if from != to {
            self.emit(SupervisorEvent::StateChanged {
                service: self.kind,
                from,
                to,
            });
        }
    }

    async fn pause(&self, duration: Duration, cancel: &CancellationToken) -> Result<()> {
        if duration.is_zero() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SupervisorError::Cancelled { service: self.kind }),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Name-match the process table and flag the process we launched.
    async fn inspect(&self) -> Result<Vec<ObservedProcess>> {
        let recorded = pid::read_pid(&self.pid_file()).await;
        let observed: Vec<ObservedProcess> = self
            .probes
            .processes
            .find(&self.matcher)
            .await?
            .into_iter()
            .map(|record| ObservedProcess {
                owned: Some(record.pid) == recorded,
                record,
            })
            .collect();

        if observed.len() > 1 {
            let pids = pids_of(&observed);
            self.emit(SupervisorEvent::MultipleCandidates {
                service: self.kind,
                owned: recorded.filter(|pid| pids.contains(pid)),
                pids,
            });
        }
        Ok(observed)
    }

    /// PIDs from `pids` that are still alive.
    async fn alive(&self, pids: &[u32]) -> Result<Vec<u32>> {
        let mut alive = Vec::new();
        for pid in pids {
            if self.probes.processes.get(*pid).await?.is_some() {
                alive.push(*pid);
            }
        }
        Ok(alive)
    }

    async fn send(&self, pid: u32, termination: Termination) {
        if let Err(e) = self.probes.processes.signal(pid, termination).await {
            warn!("{}: {}", self.kind, e);
        }
    }

    /// Observe process, port and health signals. Does not modify anything.
    pub async fn status(&self) -> Result<ServiceHandle> {
        let descriptor = self.descriptor();
        let url = descriptor.liveness_url();
        let processes = self.inspect().await?;
        let port = self.probes.ports.probe(descriptor.port).await?;
        let healthy = self.probes.health.check(&url).await;

        let models = if healthy && self.kind == ServiceKind::Ollama {
            self.probes
                .health
                .fetch_json(&url)
                .await
                .and_then(|body| body.get("models")?.as_array().map(Vec::len))
        } else {
            None
        };

        let running = !processes.is_empty();
        let main = primary(&processes);
        Ok(ServiceHandle {
            service: self.kind,
            state: ServiceState::Unknown.on_event(Event::Observed { running, healthy }),
            pid: main.map(|p| p.record.pid),
            memory_bytes: main.map(|p| p.record.memory_bytes),
            started_at: main.and_then(|p| p.record.started_at),
            running,
            port_active: port.is_active(),
            healthy,
            url: descriptor.access_url(),
            port,
            processes,
            models,
        })
    }

    /// Bring the service up unless it is already healthy.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<LifecycleReport> {
        let _gate = self
            .gate
            .try_lock()
            .map_err(|_| SupervisorError::Busy { service: self.kind })?;
        ensure_dir(&self.config.state_dir).await?;
        let mut lock = ServiceLock::open(&self.config.state_dir, self.kind)?;
        let _held = lock.try_acquire()?;

        let report = self.start_locked(cancel).await?;
        self.emit(SupervisorEvent::Finished {
            service: self.kind,
            result: report.result.clone(),
        });
        Ok(report)
    }

    async fn start_locked(&self, cancel: &CancellationToken) -> Result<LifecycleReport> {
        let descriptor = self.descriptor();
        let timings = self.config.timings;
        let url = descriptor.liveness_url();
        let failed = |failure: StartFailure| {
            LifecycleReport::new(self.kind, SupervisorResult::StartFailed(failure))
        };

        pid::check_pid_file(&self.pid_file(), self.probes.processes.as_ref()).await?;

        let existing = self.inspect().await?;
        if existing.is_empty() {
            self.transition(Event::Observed {
                running: false,
                healthy: false,
            });
        } else {
            let healthy =
                check_with_retries(self.probes.health.as_ref(), &url, timings.quick_probe_retries)
                    .await;
            self.transition(Event::Observed {
                running: true,
                healthy,
            });
            if healthy {
                let pid = primary(&existing).map(|p| p.record.pid);
                return Ok(
                    LifecycleReport::new(self.kind, SupervisorResult::AlreadyHealthy).with_pid(pid),
                );
            }

            let pids = pids_of(&existing);
            self.emit(SupervisorEvent::RestartingUnhealthy {
                service: self.kind,
                pids: pids.clone(),
            });
            if let SupervisorResult::StopFailed(StopFailure::SurvivedForceKill { pids }) =
                self.terminate(&pids, false, cancel).await?
            {
                return Ok(failed(StartFailure::ExistingProcessSurvived { pids }));
            }
            pid::remove_pid(&self.pid_file()).await?;
        }

        let port = self.probes.ports.probe(descriptor.port).await?;
        if port.is_active() {
            for owner in &port.owners {
                self.emit(SupervisorEvent::PortHeldByOther {
                    service: self.kind,
                    port: descriptor.port,
                    owner: owner.clone(),
                });
            }
            let mut report = failed(StartFailure::PortInUse {
                holder: port.owners.first().cloned(),
            });
            report.port_held = true;
            report.port_holders = port.owners;
            return Ok(report);
        }

        let Some(executable) =
            resolve_executable(&descriptor.discovery, self.config.search_path.as_deref())
        else {
            return Ok(failed(StartFailure::ExecutableNotFound {
                searched: searched_locations(&descriptor.discovery),
            }));
        };
        self.emit(SupervisorEvent::ExecutableResolved {
            service: self.kind,
            path: executable.path.clone(),
        });

        for dir in descriptor.required_dirs.iter().chain([&self.config.log_dir]) {
            match ensure_dir(dir).await {
                Ok(()) => {}
                Err(SupervisorError::Directory { path, source }) => {
                    return Ok(failed(StartFailure::DirectoryCreationFailed {
                        path,
                        message: source.to_string(),
                    }));
                }
                Err(e) => return Err(e),
            }
        }

        let spec = LaunchSpec {
            service: self.kind,
            program: executable.path,
            args: descriptor.args.clone(),
            env: descriptor.env.clone(),
            log_dir: self.config.log_dir.clone(),
        };
        self.transition(Event::LaunchIssued);
        let pid = match self.probes.launcher.launch(&spec).await {
            Ok(pid) => pid,
            Err(e) => {
                self.transition(Event::LaunchFailed);
                return Ok(failed(StartFailure::LaunchFailed {
                    message: e.to_string(),
                }));
            }
        };
        pid::write_pid(&self.pid_file(), pid).await?;
        self.emit(SupervisorEvent::Launched {
            service: self.kind,
            pid,
        });

        self.pause(timings.launch_settle, cancel).await?;
        let survived = self.probes.processes.get(pid).await?.is_some()
            || !self.probes.processes.find(&self.matcher).await?.is_empty();
        if !survived {
            self.transition(Event::LaunchFailed);
            pid::remove_pid(&self.pid_file()).await?;
            return Ok(failed(StartFailure::ExitedImmediately).with_pid(Some(pid)));
        }

        self.emit(SupervisorEvent::WaitingForReady {
            service: self.kind,
            url: url.clone(),
            timeout: descriptor.startup_timeout,
        });
        let readiness = wait_until_ready(
            self.probes.health.clone(),
            &url,
            self.kind.as_str(),
            descriptor.startup_timeout,
            timings.poll_interval,
            cancel,
        )
        .await
        .map_err(|e| match e {
            ProbeError::Cancelled => SupervisorError::Cancelled { service: self.kind },
            other => other.into(),
        })?;

        if readiness.ready {
            self.transition(Event::BecameReady);
            self.emit(SupervisorEvent::Ready {
                service: self.kind,
                elapsed: readiness.elapsed,
            });
            Ok(LifecycleReport::new(self.kind, SupervisorResult::Started).with_pid(Some(pid)))
        } else {
            self.transition(Event::ReadyTimedOut);
            Ok(LifecycleReport::new(self.kind, SupervisorResult::Timeout).with_pid(Some(pid)))
        }
    }

    /// Stop every matching process. `force` skips the graceful phase.
    pub async fn stop(&self, force: bool, cancel: &CancellationToken) -> Result<LifecycleReport> {
        let _gate = self
            .gate
            .try_lock()
            .map_err(|_| SupervisorError::Busy { service: self.kind })?;
        ensure_dir(&self.config.state_dir).await?;
        let mut lock = ServiceLock::open(&self.config.state_dir, self.kind)?;
        let _held = lock.try_acquire()?;

        let report = self.stop_locked(force, cancel).await?;
        self.emit(SupervisorEvent::Finished {
            service: self.kind,
            result: report.result.clone(),
        });
        Ok(report)
    }

    async fn stop_locked(&self, force: bool, cancel: &CancellationToken) -> Result<LifecycleReport> {
        let descriptor = self.descriptor();
        let existing = self.inspect().await?;

        let result = if existing.is_empty() {
            self.transition(Event::Observed {
                running: false,
                healthy: false,
            });
            SupervisorResult::AlreadyStopped
        } else {
            self.terminate(&pids_of(&existing), force, cancel).await?
        };

        let survivors = match &result {
            SupervisorResult::StopFailed(StopFailure::SurvivedForceKill { pids }) => pids.clone(),
            _ => {
                pid::remove_pid(&self.pid_file()).await?;
                Vec::new()
            }
        };

        let port = self.probes.ports.probe(descriptor.port).await?;
        let mut report = LifecycleReport::new(self.kind, result);
        report.port_holders = port.foreign_owners(&survivors).cloned().collect();
        report.port_held =
            port.is_active() && (!report.port_holders.is_empty() || port.owners.is_empty());
        for owner in &report.port_holders {
            self.emit(SupervisorEvent::PortHeldByOther {
                service: self.kind,
                port: descriptor.port,
                owner: owner.clone(),
            });
        }
        Ok(report)
    }

    /// Graceful request, bounded wait, then the forced sequence.
    async fn terminate(
        &self,
        pids: &[u32],
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<SupervisorResult> {
        let descriptor = self.descriptor();
        let timings = self.config.timings;
        self.transition(Event::StopRequested);

        if !force {
            for pid in pids {
                self.send(*pid, Termination::Graceful).await;
            }
            self.emit(SupervisorEvent::GracefulStopRequested {
                service: self.kind,
                pids: pids.to_vec(),
            });

            let started = Instant::now();
            let mut last_progress = started;
            loop {
                let remaining = self.alive(pids).await?;
                if remaining.is_empty() {
                    // A companion may have relaunched the service under a new PID.
                    self.pause(timings.kill_settle, cancel).await?;
                    let replacements = self.probes.processes.find(&self.matcher).await?;
                    if replacements.is_empty() {
                        self.transition(Event::StopCompleted);
                        return Ok(SupervisorResult::StoppedGracefully);
                    }
                    warn!(
                        service = %self.kind,
                        pids = ?replacements.iter().map(|r| r.pid).collect::<Vec<_>>(),
                        "{} reappeared after graceful stop, escalating",
                        self.kind
                    );
                    break;
                }
                let elapsed = started.elapsed();
                if elapsed >= descriptor.shutdown_timeout {
                    break;
                }
                if last_progress.elapsed() >= timings.progress_interval {
                    self.emit(SupervisorEvent::StopProgress {
                        service: self.kind,
                        elapsed,
                        remaining,
                    });
                    last_progress = Instant::now();
                }
                let wait = timings
                    .poll_interval
                    .min(descriptor.shutdown_timeout - elapsed);
                self.pause(wait, cancel).await?;
            }
        }

        self.force_kill(pids, cancel).await
    }

    /// Companions first, then the service itself.
    async fn force_kill(&self, pids: &[u32], cancel: &CancellationToken) -> Result<SupervisorResult> {
        let timings = self.config.timings;

        if !self.companions.is_empty() {
            let companions = self.probes.processes.find(&self.companions).await?;
            for companion in &companions {
                self.send(companion.pid, Termination::Forced).await;
                self.emit(SupervisorEvent::CompanionKilled {
                    service: self.kind,
                    pid: companion.pid,
                    name: companion.name.clone(),
                });
            }
            if !companions.is_empty() {
                self.pause(timings.companion_settle, cancel).await?;
            }
        }

        // Include anything that appeared under the same name in the meantime.
        let mut targets = self.alive(pids).await?;
        for record in self.probes.processes.find(&self.matcher).await? {
            if !targets.contains(&record.pid) {
                targets.push(record.pid);
            }
        }
        if !targets.is_empty() {
            self.emit(SupervisorEvent::ForceKilling {
                service: self.kind,
                pids: targets.clone(),
            });
            for pid in &targets {
                self.send(*pid, Termination::Forced).await;
            }
        }

        self.pause(timings.kill_settle, cancel).await?;
        let survivors: Vec<u32> = self
            .probes
            .processes
            .find(&self.matcher)
            .await?
            .iter()
            .map(|r| r.pid)
            .collect();
        if survivors.is_empty() {
            self.transition(Event::StopCompleted);
            Ok(SupervisorResult::StoppedForcibly)
        } else {
            self.transition(Event::StopFailed);
            Ok(SupervisorResult::StopFailed(
                StopFailure::SurvivedForceKill { pids: survivors },
            ))
        }
    }
}
