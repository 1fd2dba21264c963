//! Lifecycle supervision for a local Ollama + Open WebUI stack.
//!
//! Each service gets a [`ServiceSupervisor`] that owns its start, stop and
//! status logic. [`StackOrchestrator`] sequences the two in dependency order.
//! Nothing in this crate prints; progress is reported through a
//! [`SupervisorObserver`].

pub mod config;
pub mod discovery;
pub mod environment;
pub mod error;
pub mod launcher;
pub mod lock;
pub mod observer;
pub mod orchestrator;
pub mod pid;
pub mod result;
pub mod state;
pub mod supervisor;

pub use config::{
    CONFIG_FILE_NAME, Discovery, FileConfig, ServiceDescriptor, ServiceKind, ServiceOverrides,
    StackConfig, Timings,
};
pub use discovery::{ExecutableSource, ResolvedExecutable, resolve_executable};
pub use environment::EnvironmentProvider;
pub use error::{Result, SupervisorError};
pub use launcher::{DetachedLauncher, LaunchSpec, Launcher};
pub use observer::{RecordingObserver, SupervisorEvent, SupervisorObserver, TracingObserver};
pub use orchestrator::{
    Confirmation, Confirmer, Overall, ServiceOutcome, StackOrchestrator, StackReport, StackStatus,
    StartAllOptions,
};
pub use result::{
    LifecycleReport, ObservedProcess, ServiceHandle, StartFailure, StopFailure, SupervisorResult,
};
pub use state::{Event, ServiceState};
pub use supervisor::{Probes, ServiceSupervisor};
