//! Leaf probes used by the llmstack supervisor.
//!
//! Three independent signals are exposed and never merged into one:
//! - [`ProcessInspector`]: is a matching process in the OS process table?
//! - [`PortProber`]: is something bound to the service port?
//! - [`HealthChecker`]: does the liveness endpoint answer with a 2xx?

pub mod error;
pub mod http_probe;
pub mod port;
pub mod process;

pub use error::{ProbeError, ProbeResult};
pub use http_probe::{
    HealthChecker, HttpHealthChecker, Readiness, ReadinessProbe, check_with_retries,
    wait_until_ready,
};
pub use port::{NetstatPortProber, PortOwner, PortProber, PortState};
pub use process::{ProcessInspector, ProcessMatcher, ProcessRecord, ProcfsInspector, Termination};
