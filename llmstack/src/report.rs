//! Terminal rendering of lifecycle results and stack status.

use std::time::Duration;

use cli_table::{Table, WithTitle, print_stdout};
use console::style;
use llmstack_supervisor::{
    LifecycleReport, ServiceHandle, ServiceKind, ServiceOutcome, StackConfig, StackReport,
    StackStatus, StartFailure, SupervisorResult,
};
use miette::{IntoDiagnostic, Result};

#[derive(Table)]
struct ServiceRow {
    #[table(title = "Service")]
    service: String,
    #[table(title = "State")]
    state: String,
    #[table(title = "Process")]
    running: String,
    #[table(title = "Port")]
    port: String,
    #[table(title = "Health")]
    healthy: String,
    #[table(title = "PID")]
    pid: String,
    #[table(title = "Memory")]
    memory: String,
    #[table(title = "Uptime")]
    uptime: String,
}

#[derive(Table)]
struct ProcessRow {
    #[table(title = "Service")]
    service: String,
    #[table(title = "PID")]
    pid: u32,
    #[table(title = "Launched here")]
    owned: String,
    #[table(title = "Memory")]
    memory: String,
    #[table(title = "Uptime")]
    uptime: String,
    #[table(title = "Command")]
    command: String,
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Whole seconds only.
pub fn format_uptime(uptime: Duration) -> String {
    humantime::format_duration(Duration::from_secs(uptime.as_secs())).to_string()
}

fn flag(value: bool, yes: &str, no: &str) -> String {
    if value {
        style(yes).green().to_string()
    } else {
        style(no).red().to_string()
    }
}

fn or_dash(value: Option<String>) -> String {
    value.unwrap_or_else(|| "-".to_string())
}

fn service_row(handle: &ServiceHandle) -> ServiceRow {
    ServiceRow {
        service: handle.service.display_name().to_string(),
        state: handle.state.to_string(),
        running: flag(handle.running, "running", "not running"),
        port: flag(
            handle.port_active,
            &format!("{} listening", handle.port.port),
            &format!("{} free", handle.port.port),
        ),
        healthy: flag(handle.healthy, "healthy", "unhealthy"),
        pid: or_dash(handle.pid.map(|p| p.to_string())),
        memory: or_dash(handle.memory_bytes.map(format_bytes)),
        uptime: or_dash(handle.uptime().map(format_uptime)),
    }
}

pub fn print_status(status: &StackStatus, verbose: bool) -> Result<()> {
    let rows: Vec<ServiceRow> = status.services().into_iter().map(service_row).collect();
    print_stdout(rows.with_title()).into_diagnostic()?;

    if verbose {
        let processes: Vec<ProcessRow> = status
            .services()
            .into_iter()
            .flat_map(|handle| {
                handle.processes.iter().map(|process| ProcessRow {
                    service: handle.service.to_string(),
                    pid: process.record.pid,
                    owned: if process.owned { "yes" } else { "no" }.to_string(),
                    memory: format_bytes(process.record.memory_bytes),
                    uptime: or_dash(process.record.uptime().map(format_uptime)),
                    command: process.record.cmdline.clone(),
                })
            })
            .collect();
        if !processes.is_empty() {
            println!();
            print_stdout(processes.with_title()).into_diagnostic()?;
        }

        for handle in status.services() {
            for owner in &handle.port.owners {
                println!(
                    "{}: port {} held by {}",
                    handle.service.display_name(),
                    handle.port.port,
                    owner
                );
            }
            if let Some(models) = handle.models {
                println!("{}: {} models installed", handle.service.display_name(), models);
            }
        }
    }

    for handle in status.services() {
        for squatter in handle.port_squatters() {
            println!(
                "{} port {} is held by an unrelated process: {}",
                style("!").yellow().bold(),
                handle.port.port,
                squatter
            );
        }
    }

    println!();
    let overall = status.overall.to_string();
    if status.is_success() {
        println!("{}", style(overall).green().bold());
    } else {
        println!("{}", style(overall).red().bold());
    }
    Ok(())
}

pub fn print_status_json(status: &StackStatus) -> Result<()> {
    let json = serde_json::to_string_pretty(status).into_diagnostic()?;
    println!("{json}");
    Ok(())
}

/// One line per service, e.g. `✓ ollama: started (PID 4242)`.
pub fn outcome_line(outcome: &ServiceOutcome) -> String {
    match outcome {
        ServiceOutcome::Completed(report) => report_line(report),
        ServiceOutcome::Skipped { service, reason } => format!(
            "{} {}: skipped ({})",
            style("-").yellow(),
            service.display_name(),
            reason
        ),
        ServiceOutcome::Errored { service, message } => format!(
            "{} {}: {}",
            style("✗").red(),
            service.display_name(),
            message
        ),
    }
}

fn report_line(report: &LifecycleReport) -> String {
    let marker = if report.is_success() {
        style("✓").green()
    } else {
        style("✗").red()
    };
    let mut line = format!(
        "{} {}: {}",
        marker,
        report.service.display_name(),
        report.result
    );
    if let Some(pid) = report.pid {
        line.push_str(&format!(" (PID {pid})"));
    }
    if let SupervisorResult::StartFailed(StartFailure::ExecutableNotFound { searched }) =
        &report.result
    {
        line.push_str(&format!("\n    searched: {}", searched.join(", ")));
    }
    if report.port_held {
        match report.port_holders.as_slice() {
            [] => line.push_str("\n    port is still bound by an unidentified process"),
            holders => {
                for holder in holders {
                    line.push_str(&format!("\n    port still held by {holder}"));
                }
            }
        }
    }
    line
}

pub fn print_report(report: &StackReport) {
    if let Some(reason) = &report.aborted {
        println!("{} aborted: {}", style("✗").red(), reason);
        return;
    }
    for outcome in &report.outcomes {
        println!("{}", outcome_line(outcome));
    }
    if let Some(status) = &report.status {
        let overall = status.overall.to_string();
        if status.is_success() {
            println!("{}", style(overall).green().bold());
        } else {
            println!("{}", style(overall).red().bold());
        }
    }
}

pub fn print_access_urls(config: &StackConfig) {
    println!();
    println!(
        "  {:<12} {}",
        ServiceKind::Webui.display_name(),
        style(config.webui.access_url()).cyan()
    );
    println!(
        "  {:<12} {}",
        "Ollama API",
        style(config.ollama.access_url()).cyan()
    );
}
