use std::path::PathBuf;

use clap::{Parser, Subcommand, crate_version};
use llmstack_supervisor::ServiceKind;

use crate::log::{Level, LogFormat};

#[derive(Parser, Debug)]
#[command(
    name = "llmstack",
    color = clap::ColorChoice::Auto,
    version,
    about = format!("llmstack {}: manage a local Ollama + Open WebUI stack", crate_version!())
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub global_options: GlobalOptions,
}

#[derive(clap::Args, Clone, Debug, Default)]
#[command(next_help_heading = "Global options")]
pub struct GlobalOptions {
    #[arg(
        long,
        global = true,
        env = "LLMSTACK_CONFIG",
        help = "Configuration file (default: <data root>/llmstack.yaml)."
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "LLMSTACK_DATA_ROOT",
        help = "Directory holding models, UI state, logs and PID records."
    )]
    pub data_root: Option<PathBuf>,

    #[arg(
        short = 'v',
        long = "debug",
        global = true,
        help = "Enable additional debug logs."
    )]
    pub debug: bool,

    #[arg(
        short,
        long,
        global = true,
        conflicts_with = "debug",
        help = "Silence all logs"
    )]
    pub quiet: bool,

    #[arg(
        long,
        global = true,
        env = "LLMSTACK_LOG_FORMAT",
        help = "Configure the output format of logs.",
        default_value_t,
        value_enum
    )]
    pub log_format: LogFormat,
}

impl GlobalOptions {
    pub fn log_level(&self) -> Level {
        if self.debug {
            Level::Debug
        } else if self.quiet {
            Level::Silent
        } else {
            Level::default()
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceArg {
    /// The Ollama inference server.
    Ollama,
    /// The Open WebUI front-end.
    #[value(alias = "open-webui")]
    Webui,
}

impl From<ServiceArg> for ServiceKind {
    fn from(service: ServiceArg) -> Self {
        match service {
            ServiceArg::Ollama => ServiceKind::Ollama,
            ServiceArg::Webui => ServiceKind::Webui,
        }
    }
}

#[derive(Subcommand, Clone, Debug, PartialEq, Eq)]
pub enum Commands {
    #[command(about = "Start Ollama, then Open WebUI once Ollama is healthy.")]
    StartAll {
        #[arg(
            long,
            help = "Do not ask for confirmation when services are already running."
        )]
        force: bool,

        #[arg(long, help = "Skip the final health check of the whole stack.")]
        skip_health_check: bool,
    },

    #[command(about = "Stop Open WebUI, then Ollama.")]
    StopAll {
        #[arg(long, help = "Skip the graceful shutdown and kill immediately.")]
        force: bool,
    },

    #[command(about = "Show process, port and health status of both services.")]
    Status {
        #[arg(long, help = "Show every matching process and port owner.")]
        verbose: bool,

        #[arg(long, help = "Print the status as JSON.")]
        json: bool,
    },

    #[command(about = "Start a single service.")]
    Start {
        #[arg(value_enum)]
        service: ServiceArg,
    },

    #[command(about = "Stop a single service.")]
    Stop {
        #[arg(value_enum)]
        service: ServiceArg,

        #[arg(long, help = "Skip the graceful shutdown and kill immediately.")]
        force: bool,
    },

    #[command(about = "Print the resolved configuration as YAML.")]
    Config,

    #[command(hide = true)]
    StartOllama,

    #[command(hide = true)]
    StartWebui,

    #[command(hide = true)]
    StopOllama {
        #[arg(long)]
        force: bool,
    },

    #[command(hide = true)]
    StopWebui {
        #[arg(long)]
        force: bool,
    },
}

impl Commands {
    /// Fold the per-service shorthands into `start`/`stop`.
    pub fn normalize(self) -> Self {
        match self {
            Commands::StartOllama => Commands::Start {
                service: ServiceArg::Ollama,
            },
            Commands::StartWebui => Commands::Start {
                service: ServiceArg::Webui,
            },
            Commands::StopOllama { force } => Commands::Stop {
                service: ServiceArg::Ollama,
                force,
            },
            Commands::StopWebui { force } => Commands::Stop {
                service: ServiceArg::Webui,
                force,
            },
            other => other,
        }
    }
}
