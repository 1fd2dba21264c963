use std::path::PathBuf;

use llmstack_probes::ProbeError;
use miette::Diagnostic;
use thiserror::Error;

use crate::config::ServiceKind;

/// Errors that abort a lifecycle operation.
///
/// Expected lifecycle outcomes (missing executable, readiness timeout, a
/// process surviving SIGKILL) are not errors; they are reported through
/// [`crate::SupervisorResult`].
#[derive(Error, Diagnostic, Debug)]
pub enum SupervisorError {
    #[error("{service} is busy: another start or stop is already in progress")]
    #[diagnostic(
        code(llmstack::busy),
        help("wait for the other operation to finish and try again")
    )]
    Busy { service: ServiceKind },

    #[error("Operation on {service} was interrupted")]
    #[diagnostic(code(llmstack::cancelled))]
    Cancelled { service: ServiceKind },

    #[error("Invalid configuration: {0}")]
    #[diagnostic(code(llmstack::config))]
    Config(String),

    #[error("Failed to read configuration file {path}")]
    #[diagnostic(code(llmstack::config::parse))]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Failed to create directory {path}")]
    #[diagnostic(
        code(llmstack::config::directory),
        help("check the permissions of the data root")
    )]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not determine a data directory: {0}")]
    #[diagnostic(help("pass --data-root or set LLMSTACK_DATA_ROOT"))]
    DataRoot(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Probe(#[from] ProbeError),
}

impl SupervisorError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
