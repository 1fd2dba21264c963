mod cli;
mod confirm;
mod log;
mod report;
mod shutdown;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use llmstack_supervisor::{
    EnvironmentProvider, Probes, StackOrchestrator, StartAllOptions, TracingObserver,
};
use miette::{IntoDiagnostic, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cli::{Cli, Commands};
use crate::confirm::DialoguerConfirmer;
use crate::shutdown::Shutdown;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    log::init_tracing(
        cli.global_options.log_level(),
        cli.global_options.log_format,
    );

    let shutdown = Shutdown::new();
    shutdown.install_signals().into_diagnostic()?;

    match run(cli, shutdown.cancellation_token()).await {
        Ok(true) => Ok(ExitCode::SUCCESS),
        Ok(false) => Ok(ExitCode::FAILURE),
        Err(e) if shutdown.is_cancelled() => {
            warn!("{}", e);
            warn!("Interrupted; processes that were already launched keep running");
            shutdown.exit_process();
        }
        Err(e) => Err(e),
    }
}

/// Returns whether the command fully succeeded.
async fn run(cli: Cli, cancel: CancellationToken) -> Result<bool> {
    let global = cli.global_options;
    let config = EnvironmentProvider::new(global.data_root, global.config)
        .load()
        .await?;
    debug!("Data root: {}", config.data_root.display());

    let command = cli.command.normalize();
    if command == Commands::Config {
        print!("{}", serde_yaml::to_string(&config).into_diagnostic()?);
        return Ok(true);
    }

    EnvironmentProvider::ensure_directories(&config).await?;
    let config = Arc::new(config);
    let orchestrator = StackOrchestrator::new(
        config.clone(),
        Probes::system(config.timings.health_timeout)?,
        Arc::new(DialoguerConfirmer),
        Arc::new(TracingObserver),
    )?;

    match command {
        Commands::StartAll {
            force,
            skip_health_check,
        } => {
            let options = StartAllOptions {
                force,
                skip_health_check,
            };
            let outcome = orchestrator.start_all(options, &cancel).await?;
            report::print_report(&outcome);
            if outcome.aborted.is_none() {
                report::print_access_urls(&config);
            }
            Ok(outcome.is_success())
        }
        Commands::StopAll { force } => {
            let outcome = orchestrator.stop_all(force, &cancel).await?;
            report::print_report(&outcome);
            Ok(outcome.is_success())
        }
        Commands::Status { verbose, json } => {
            let status = orchestrator.status().await?;
            if json {
                report::print_status_json(&status)?;
            } else {
                report::print_status(&status, verbose)?;
                report::print_access_urls(&config);
            }
            Ok(status.is_success())
        }
        Commands::Start { service } => {
            let outcome = orchestrator.start_service(service.into(), &cancel).await?;
            report::print_report(&outcome);
            Ok(outcome.is_success())
        }
        Commands::Stop { service, force } => {
            let outcome = orchestrator
                .stop_service(service.into(), force, &cancel)
                .await?;
            report::print_report(&outcome);
            Ok(outcome.is_success())
        }
        // Shorthands are folded by `normalize` and `config` returned above.
        other => Err(miette::miette!("{:?} cannot be run directly", other)),
    }
}
