use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum ProbeError {
    #[error("Failed to read the process table: {0}")]
    #[diagnostic(code(llmstack::probe::process_table))]
    ProcessTable(#[source] std::io::Error),

    #[error("Failed to read the socket table: {0}")]
    #[diagnostic(code(llmstack::probe::socket_table))]
    SocketTable(String),

    #[error("Failed to send {signal} to PID {pid}: {source}")]
    #[diagnostic(
        code(llmstack::probe::signal),
        help("the process may belong to another user")
    )]
    Signal {
        pid: u32,
        signal: &'static str,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("Invalid process pattern '{pattern}': {source}")]
    #[diagnostic(code(llmstack::probe::pattern))]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Wait was cancelled")]
    Cancelled,
}

pub type ProbeResult<T> = std::result::Result<T, ProbeError>;
