//! Stack-level sequencing across the two services.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ServiceKind, StackConfig};
use crate::error::Result;
use crate::observer::{SupervisorEvent, SupervisorObserver};
use crate::result::{LifecycleReport, ServiceHandle};
use crate::supervisor::{Probes, ServiceSupervisor};

/// Answer to an operator prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Approved,
    Declined,
    /// No operator can be asked (not a terminal, prompt failed).
    Unavailable,
}

pub trait Confirmer: Send + Sync {
    fn confirm(&self, prompt: &str) -> Confirmation;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StartAllOptions {
    /// Do not ask before touching services that are already running.
    pub force: bool,
    /// Skip the aggregated status check after both starts.
    pub skip_health_check: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Overall {
    AllHealthy,
    PartiallyHealthy,
    AllDown,
}

impl Overall {
    fn classify(healthy: usize, total: usize) -> Self {
        match healthy {
            0 => Overall::AllDown,
            n if n == total => Overall::AllHealthy,
            _ => Overall::PartiallyHealthy,
        }
    }
}

impl fmt::Display for Overall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Overall::AllHealthy => "all services healthy",
            Overall::PartiallyHealthy => "partially healthy",
            Overall::AllDown => "all services down",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackStatus {
    pub ollama: ServiceHandle,
    pub webui: ServiceHandle,
    pub overall: Overall,
}

impl StackStatus {
    pub fn new(ollama: ServiceHandle, webui: ServiceHandle) -> Self {
        let healthy = [&ollama, &webui]
            .iter()
            .filter(|h| h.is_fully_healthy())
            .count();
        Self {
            overall: Overall::classify(healthy, 2),
            ollama,
            webui,
        }
    }

    pub fn services(&self) -> [&ServiceHandle; 2] {
        [&self.ollama, &self.webui]
    }

    pub fn is_success(&self) -> bool {
        self.overall == Overall::AllHealthy
    }
}

/// What happened to one service during a stack operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ServiceOutcome {
    Completed(LifecycleReport),
    /// Not attempted because a prerequisite failed.
    Skipped { service: ServiceKind, reason: String },
    /// The operation aborted with an error before producing a result.
    Errored { service: ServiceKind, message: String },
}

impl ServiceOutcome {
    pub fn service(&self) -> ServiceKind {
        match self {
            ServiceOutcome::Completed(report) => report.service,
            ServiceOutcome::Skipped { service, .. } | ServiceOutcome::Errored { service, .. } => {
                *service
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ServiceOutcome::Completed(report) if report.is_success())
    }

    pub fn report(&self) -> Option<&LifecycleReport> {
        match self {
            ServiceOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct StackReport {
    pub outcomes: Vec<ServiceOutcome>,
    /// Aggregated status taken after the operation, when requested.
    pub status: Option<StackStatus>,
    /// Set when the operation did not run at all.
    pub aborted: Option<String>,
}

impl StackReport {
    pub fn outcome(&self, service: ServiceKind) -> Option<&ServiceOutcome> {
        self.outcomes.iter().find(|o| o.service() == service)
    }

    pub fn is_success(&self) -> bool {
        self.aborted.is_none()
            && self.outcomes.iter().all(ServiceOutcome::is_success)
            && self.status.as_ref().is_none_or(StackStatus::is_success)
    }
}

pub struct StackOrchestrator {
    ollama: ServiceSupervisor,
    webui: ServiceSupervisor,
    confirmer: Arc<dyn Confirmer>,
    observer: Arc<dyn SupervisorObserver>,
}

impl StackOrchestrator {
    pub fn new(
        config: Arc<StackConfig>,
        probes: Probes,
        confirmer: Arc<dyn Confirmer>,
        observer: Arc<dyn SupervisorObserver>,
    ) -> Result<Self> {
        Ok(Self {
            ollama: ServiceSupervisor::new(
                config.clone(),
                ServiceKind::Ollama,
                probes.clone(),
                observer.clone(),
            )?,
            webui: ServiceSupervisor::new(config, ServiceKind::Webui, probes, observer.clone())?,
            confirmer,
            observer,
        })
    }

    pub fn supervisor(&self, kind: ServiceKind) -> &ServiceSupervisor {
        match kind {
            ServiceKind::Ollama => &self.ollama,
            ServiceKind::Webui => &self.webui,
        }
    }

    pub async fn status(&self) -> Result<StackStatus> {
        let ollama = self.ollama.status().await?;
        let webui = self.webui.status().await?;
        Ok(StackStatus::new(ollama, webui))
    }

    /// Inference server first; the UI only once it is up.
    pub async fn start_all(
        &self,
        options: StartAllOptions,
        cancel: &CancellationToken,
    ) -> Result<StackReport> {
        if !options.force {
            let current = self.status().await?;
            let running: Vec<&str> = current
                .services()
                .iter()
                .filter(|h| h.running)
                .map(|h| h.service.display_name())
                .collect();
            if !running.is_empty() {
                let prompt = format!(
                    "{} already running. Continue and restart anything unhealthy?",
                    running.join(" and ")
                );
                match self.confirmer.confirm(&prompt) {
                    Confirmation::Approved => {}
                    Confirmation::Declined => {
                        return Ok(StackReport {
                            aborted: Some("declined by operator".to_string()),
                            ..StackReport::default()
                        });
                    }
                    Confirmation::Unavailable => {
                        return Ok(StackReport {
                            aborted: Some(
                                "services are already running and no terminal is available to confirm; pass --force"
                                    .to_string(),
                            ),
                            ..StackReport::default()
                        });
                    }
                }
            }
        }

        let mut report = StackReport::default();
        let ollama = settle(ServiceKind::Ollama, self.ollama.start(cancel).await)?;
        let ollama_up = ollama
            .report()
            .is_some_and(|r| r.result.permits_dependents());
        report.outcomes.push(ollama);

        if ollama_up {
            report.outcomes.push(settle(
                ServiceKind::Webui,
                self.webui.start(cancel).await,
            )?);
        } else {
            info!(
                "Not starting {} because {} did not come up",
                ServiceKind::Webui.display_name(),
                ServiceKind::Ollama.display_name()
            );
            report.outcomes.push(ServiceOutcome::Skipped {
                service: ServiceKind::Webui,
                reason: format!("{} is not running", ServiceKind::Ollama.display_name()),
            });
        }

        if !options.skip_health_check {
            report.status = Some(self.status().await?);
        }
        Ok(report)
    }

    /// UI first, then the inference server. A failure on one side does not
    /// prevent the other from being stopped.
    pub async fn stop_all(&self, force: bool, cancel: &CancellationToken) -> Result<StackReport> {
        let mut report = StackReport::default();
        for kind in ServiceKind::STOP_ORDER {
            let result = self.supervisor(kind).stop(force, cancel).await;
            report.outcomes.push(settle(kind, result)?);
        }
        Ok(report)
    }

    pub async fn start_service(
        &self,
        kind: ServiceKind,
        cancel: &CancellationToken,
    ) -> Result<StackReport> {
        if kind == ServiceKind::Webui && !self.ollama.status().await?.is_fully_healthy() {
            self.observer.on_event(&SupervisorEvent::DependencyNotHealthy {
                service: ServiceKind::Webui,
                dependency: ServiceKind::Ollama,
            });
        }
        let outcome = settle(kind, self.supervisor(kind).start(cancel).await)?;
        Ok(StackReport {
            outcomes: vec![outcome],
            ..StackReport::default()
        })
    }

    pub async fn stop_service(
        &self,
        kind: ServiceKind,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<StackReport> {
        let outcome = settle(kind, self.supervisor(kind).stop(force, cancel).await)?;
        Ok(StackReport {
            outcomes: vec![outcome],
            ..StackReport::default()
        })
    }
}

/// Interruption aborts the whole operation; other errors stay per service.
fn settle(service: ServiceKind, result: Result<LifecycleReport>) -> Result<ServiceOutcome> {
    match result {
        Ok(report) => Ok(ServiceOutcome::Completed(report)),
        Err(e) if e.is_cancelled() => Err(e),
        Err(e) => {
            warn!("{}: {}", service, e);
            Ok(ServiceOutcome::Errored {
                service,
                message: e.to_string(),
            })
        }
    }
}
