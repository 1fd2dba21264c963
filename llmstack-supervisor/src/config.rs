//! Configuration types.
//!
//! A YAML file deserializes into [`FileConfig`], where every field is
//! optional. [`StackConfig::resolve`] turns it into the immutable
//! [`StackConfig`] handed to the supervisors; nothing reads process-wide
//! environment variables after that point.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use llmstack_probes::ProcessMatcher;
use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, serde_as};

use crate::error::{Result, SupervisorError};

pub const CONFIG_FILE_NAME: &str = "llmstack.yaml";

const OLLAMA_PORT: u16 = 11434;
const WEBUI_PORT: u16 = 8080;

/// The two managed services, in start order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// The LLM inference server.
    Ollama,
    /// The web chat front-end.
    Webui,
}

impl ServiceKind {
    pub const START_ORDER: [ServiceKind; 2] = [ServiceKind::Ollama, ServiceKind::Webui];
    pub const STOP_ORDER: [ServiceKind; 2] = [ServiceKind::Webui, ServiceKind::Ollama];

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceKind::Ollama => "ollama",
            ServiceKind::Webui => "webui",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            ServiceKind::Ollama => "Ollama",
            ServiceKind::Webui => "Open WebUI",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered executable search: explicit override, then `PATH`, then
/// well-known install locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Discovery {
    pub override_path: Option<PathBuf>,
    /// Binary name looked up on `PATH`.
    pub program: String,
    pub well_known: Vec<PathBuf>,
}

/// Static definition of a managed service.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceDescriptor {
    pub kind: ServiceKind,
    pub process_names: Vec<String>,
    pub cmdline_patterns: Vec<String>,
    /// Processes that relaunch the service behind our back.
    pub companion_patterns: Vec<String>,
    pub discovery: Discovery,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub host: String,
    pub port: u16,
    pub liveness_path: String,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub startup_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub shutdown_timeout: Duration,
    /// Directories that must exist before launch.
    pub required_dirs: Vec<PathBuf>,
}

impl ServiceDescriptor {
    /// Host used to reach the service from this machine.
    fn connect_host(&self) -> &str {
        match self.host.as_str() {
            "0.0.0.0" | "::" | "[::]" | "" => "127.0.0.1",
            host => host,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", host_port(self.connect_host(), self.port))
    }

    pub fn liveness_url(&self) -> String {
        format!("{}{}", self.base_url(), self.liveness_path)
    }

    /// URL shown to the operator.
    pub fn access_url(&self) -> String {
        match self.connect_host() {
            "127.0.0.1" => format!("http://localhost:{}", self.port),
            host => format!("http://{}", host_port(host, self.port)),
        }
    }

    /// Matcher for the service's own processes, companions excluded.
    pub fn matcher(&self) -> Result<ProcessMatcher> {
        Ok(ProcessMatcher::new(&self.process_names, &self.cmdline_patterns)?
            .excluding(&self.companion_patterns)?)
    }

    pub fn companion_matcher(&self) -> Result<ProcessMatcher> {
        Ok(ProcessMatcher::new(&self.companion_patterns, &[])?)
    }
}

/// Delays and intervals shared by both services.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Timings {
    /// Per-request timeout of a health check.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub health_timeout: Duration,
    /// Cadence of readiness and graceful-shutdown polling.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub poll_interval: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub progress_interval: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub launch_settle: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub kill_settle: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub companion_settle: Duration,
    /// Extra attempts of the quick probe run against an already-running service.
    pub quick_probe_retries: u32,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            health_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
            progress_interval: Duration::from_secs(10),
            launch_settle: Duration::from_secs(3),
            kill_settle: Duration::from_secs(2),
            companion_settle: Duration::from_secs(1),
            quick_probe_retries: 2,
        }
    }
}

/// Resolved, immutable configuration for one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackConfig {
    pub data_root: PathBuf,
    pub log_dir: PathBuf,
    /// PID records and lock files.
    pub state_dir: PathBuf,
    pub timings: Timings,
    pub ollama: ServiceDescriptor,
    pub webui: ServiceDescriptor,
    /// `PATH` captured when the configuration was resolved.
    #[serde(skip)]
    pub search_path: Option<OsString>,
}

/// Per-service overrides as written in the configuration file.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceOverrides {
    pub executable: Option<PathBuf>,
    pub search_paths: Option<Vec<PathBuf>>,
    pub host: Option<String>,
    pub port: Option<u16>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub startup_timeout: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub shutdown_timeout: Option<Duration>,
    pub process_names: Option<Vec<String>>,
    pub cmdline_patterns: Option<Vec<String>>,
    pub companions: Option<Vec<String>>,
    /// Appended to the default launch arguments.
    pub extra_args: Vec<String>,
    /// Merged over the default environment bindings.
    pub env: BTreeMap<String, String>,
    /// Model store (ollama) or state directory (webui).
    pub data_dir: Option<PathBuf>,
}

/// The configuration file. Everything is optional.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub data_root: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub health_timeout: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub poll_interval: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub progress_interval: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub launch_settle: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub kill_settle: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub companion_settle: Option<Duration>,
    pub quick_probe_retries: Option<u32>,
    pub ollama: ServiceOverrides,
    pub webui: ServiceOverrides,
}

impl FileConfig {
    pub fn from_yaml(path: &Path, contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).map_err(|source| SupervisorError::ConfigFile {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl StackConfig {
    /// Resolve file overrides against the built-in defaults.
    ///
    /// `home` expands the per-user install locations; `search_path` is the
    /// `PATH` to use for executable discovery.
    pub fn resolve(
        data_root: PathBuf,
        file: FileConfig,
        home: Option<&Path>,
        search_path: Option<OsString>,
    ) -> Result<Self> {
        let defaults = Timings::default();
        let timings = Timings {
            health_timeout: file.health_timeout.unwrap_or(defaults.health_timeout),
            poll_interval: file.poll_interval.unwrap_or(defaults.poll_interval),
            progress_interval: file.progress_interval.unwrap_or(defaults.progress_interval),
            launch_settle: file.launch_settle.unwrap_or(defaults.launch_settle),
            kill_settle: file.kill_settle.unwrap_or(defaults.kill_settle),
            companion_settle: file.companion_settle.unwrap_or(defaults.companion_settle),
            quick_probe_retries: file
                .quick_probe_retries
                .unwrap_or(defaults.quick_probe_retries),
        };

        let ollama = ollama_descriptor(&data_root, file.ollama, home);
        let webui = webui_descriptor(&data_root, file.webui, home, &ollama);

        let config = Self {
            log_dir: file.log_dir.unwrap_or_else(|| data_root.join("logs")),
            state_dir: file.state_dir.unwrap_or_else(|| data_root.join("state")),
            data_root,
            timings,
            ollama,
            webui,
            search_path,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn service(&self, kind: ServiceKind) -> &ServiceDescriptor {
        match kind {
            ServiceKind::Ollama => &self.ollama,
            ServiceKind::Webui => &self.webui,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.timings.poll_interval.is_zero() {
            return Err(SupervisorError::Config(
                "poll_interval must be greater than zero".to_string(),
            ));
        }
        for kind in ServiceKind::START_ORDER {
            let service = self.service(kind);
            if service.port == 0 {
                return Err(SupervisorError::Config(format!("{kind}: port must not be 0")));
            }
            if service.startup_timeout.is_zero() {
                return Err(SupervisorError::Config(format!(
                    "{kind}: startup_timeout must be greater than zero"
                )));
            }
            if service.process_names.is_empty() && service.cmdline_patterns.is_empty() {
                return Err(SupervisorError::Config(format!(
                    "{kind}: at least one process name or command line pattern is required"
                )));
            }
            if !service.liveness_path.starts_with('/') {
                return Err(SupervisorError::Config(format!(
                    "{kind}: liveness path '{}' must start with '/'",
                    service.liveness_path
                )));
            }
            service.matcher()?;
            service.companion_matcher()?;
        }
        if self.ollama.port == self.webui.port {
            return Err(SupervisorError::Config(format!(
                "ollama and webui cannot share port {}",
                self.ollama.port
            )));
        }
        Ok(())
    }
}

/// `host:port`, with IPv6 literals bracketed.
fn host_port(host: &str, port: u16) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn home_path(home: Option<&Path>, rest: &str) -> Option<PathBuf> {
    home.map(|h| h.join(rest))
}

fn ollama_descriptor(
    data_root: &Path,
    overrides: ServiceOverrides,
    home: Option<&Path>,
) -> ServiceDescriptor {
    let host = overrides.host.unwrap_or_else(|| "127.0.0.1".to_string());
    let port = overrides.port.unwrap_or(OLLAMA_PORT);
    let models_dir = overrides
        .data_dir
        .unwrap_or_else(|| data_root.join("models"));

    let well_known = overrides.search_paths.unwrap_or_else(|| {
        [
            Some(PathBuf::from("/usr/local/bin/ollama")),
            Some(PathBuf::from("/usr/bin/ollama")),
            home_path(home, ".local/bin/ollama"),
            Some(PathBuf::from("/opt/ollama/bin/ollama")),
        ]
        .into_iter()
        .flatten()
        .collect()
    });

    let mut env = BTreeMap::from([
        ("OLLAMA_HOST".to_string(), host_port(&host, port)),
        (
            "OLLAMA_MODELS".to_string(),
            models_dir.to_string_lossy().into_owned(),
        ),
    ]);
    env.extend(overrides.env);

    let mut args = vec!["serve".to_string()];
    args.extend(overrides.extra_args);

    ServiceDescriptor {
        kind: ServiceKind::Ollama,
        process_names: overrides
            .process_names
            .unwrap_or_else(|| vec!["ollama".to_string()]),
        cmdline_patterns: overrides.cmdline_patterns.unwrap_or_default(),
        companion_patterns: overrides
            .companions
            .unwrap_or_else(|| vec!["ollama app".to_string()]),
        discovery: Discovery {
            override_path: overrides.executable,
            program: "ollama".to_string(),
            well_known,
        },
        args,
        env,
        host,
        port,
        liveness_path: "/api/tags".to_string(),
        startup_timeout: overrides.startup_timeout.unwrap_or(Duration::from_secs(60)),
        shutdown_timeout: overrides.shutdown_timeout.unwrap_or(Duration::from_secs(30)),
        required_dirs: vec![models_dir],
    }
}

fn webui_descriptor(
    data_root: &Path,
    overrides: ServiceOverrides,
    home: Option<&Path>,
    ollama: &ServiceDescriptor,
) -> ServiceDescriptor {
    let host = overrides.host.unwrap_or_else(|| "127.0.0.1".to_string());
    let port = overrides.port.unwrap_or(WEBUI_PORT);
    let data_dir = overrides.data_dir.unwrap_or_else(|| data_root.join("webui"));

    let well_known = overrides.search_paths.unwrap_or_else(|| {
        [
            Some(data_root.join("venv/bin/open-webui")),
            home_path(home, ".local/bin/open-webui"),
        ]
        .into_iter()
        .flatten()
        .collect()
    });

    let mut env = BTreeMap::from([
        ("OLLAMA_BASE_URL".to_string(), ollama.base_url()),
        (
            "DATA_DIR".to_string(),
            data_dir.to_string_lossy().into_owned(),
        ),
    ]);
    env.extend(overrides.env);

    let mut args = vec![
        "serve".to_string(),
        "--host".to_string(),
        host.clone(),
        "--port".to_string(),
        port.to_string(),
    ];
    args.extend(overrides.extra_args);

    ServiceDescriptor {
        kind: ServiceKind::Webui,
        process_names: overrides
            .process_names
            .unwrap_or_else(|| vec!["open-webui".to_string()]),
        cmdline_patterns: overrides.cmdline_patterns.unwrap_or_else(|| {
            vec![
                "*open-webui serve*".to_string(),
                "*open_webui.main:app*".to_string(),
            ]
        }),
        companion_patterns: overrides.companions.unwrap_or_default(),
        discovery: Discovery {
            override_path: overrides.executable,
            program: "open-webui".to_string(),
            well_known,
        },
        args,
        env,
        host,
        port,
        liveness_path: "/api/version".to_string(),
        startup_timeout: overrides
            .startup_timeout
            .unwrap_or(Duration::from_secs(120)),
        shutdown_timeout: overrides.shutdown_timeout.unwrap_or(Duration::from_secs(30)),
        required_dirs: vec![data_dir],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn resolve(file: FileConfig) -> Result<StackConfig> {
        StackConfig::resolve(
            PathBuf::from("/srv/llm"),
            file,
            Some(Path::new("/home/op")),
            None,
        )
    }

    #[test]
    fn test_defaults() {
        let config = resolve(FileConfig::default()).unwrap();

        assert_eq!(config.log_dir, PathBuf::from("/srv/llm/logs"));
        assert_eq!(config.ollama.liveness_url(), "http://127.0.0.1:11434/api/tags");
        assert_eq!(config.webui.liveness_url(), "http://127.0.0.1:8080/api/version");
        assert_eq!(config.ollama.env["OLLAMA_MODELS"], "/srv/llm/models");
        assert_eq!(config.ollama.env["OLLAMA_HOST"], "127.0.0.1:11434");
        assert_eq!(config.webui.env["OLLAMA_BASE_URL"], "http://127.0.0.1:11434");
        assert_eq!(
            config.webui.args,
            vec!["serve", "--host", "127.0.0.1", "--port", "8080"]
        );
        assert_eq!(config.ollama.startup_timeout, Duration::from_secs(60));
        assert!(
            config
                .ollama
                .discovery
                .well_known
                .contains(&PathBuf::from("/home/op/.local/bin/ollama"))
        );
    }

    #[test]
    fn test_yaml_overrides() {
        let yaml = r#"
poll_interval: 1
ollama:
  host: 0.0.0.0
  port: 11500
  startup_timeout: 90
  env:
    OLLAMA_KEEP_ALIVE: 10m
webui:
  port: 3000
  executable: /opt/webui/bin/open-webui
"#;
        let file = FileConfig::from_yaml(Path::new("llmstack.yaml"), yaml).unwrap();
        let config = resolve(file).unwrap();

        assert_eq!(config.timings.poll_interval, Duration::from_secs(1));
        assert_eq!(config.ollama.startup_timeout, Duration::from_secs(90));
        assert_eq!(config.ollama.env["OLLAMA_KEEP_ALIVE"], "10m");
        assert_eq!(config.ollama.env["OLLAMA_HOST"], "0.0.0.0:11500");
        // A wildcard bind is reached through loopback.
        assert_eq!(config.webui.env["OLLAMA_BASE_URL"], "http://127.0.0.1:11500");
        assert_eq!(config.ollama.access_url(), "http://localhost:11500");
        assert_eq!(config.webui.port, 3000);
        assert_eq!(
            config.webui.discovery.override_path,
            Some(PathBuf::from("/opt/webui/bin/open-webui"))
        );
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let err = FileConfig::from_yaml(Path::new("llmstack.yaml"), "olama:\n  port: 1\n")
            .unwrap_err();
        assert!(matches!(err, SupervisorError::ConfigFile { .. }));
    }

    #[test]
    fn test_shared_port_is_rejected() {
        let file = FileConfig {
            webui: ServiceOverrides {
                port: Some(OLLAMA_PORT),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(resolve(file), Err(SupervisorError::Config(_))));
    }

    #[test]
    fn test_zero_startup_timeout_is_rejected() {
        let file = FileConfig {
            ollama: ServiceOverrides {
                startup_timeout: Some(Duration::ZERO),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(resolve(file), Err(SupervisorError::Config(_))));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let file = FileConfig {
            webui: ServiceOverrides {
                cmdline_patterns: Some(vec!["[".to_string()]),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(resolve(file), Err(SupervisorError::Probe(_))));
    }

    #[test]
    fn test_companions_are_excluded_from_main_matcher() {
        let config = resolve(FileConfig::default()).unwrap();
        let app = llmstack_probes::ProcessRecord {
            pid: 7,
            name: "ollama app".to_string(),
            cmdline: String::new(),
            memory_bytes: 0,
            started_at: None,
        };
        assert!(!config.ollama.matcher().unwrap().matches(&app));
        assert!(config.ollama.companion_matcher().unwrap().matches(&app));
    }

    #[test]
    fn test_ipv6_hosts_are_bracketed() {
        let loopback = ServiceOverrides {
            host: Some("::1".to_string()),
            ..Default::default()
        };
        let file = FileConfig {
            ollama: loopback.clone(),
            webui: loopback,
            ..Default::default()
        };
        let config = resolve(file).unwrap();

        assert_eq!(config.ollama.env["OLLAMA_HOST"], "[::1]:11434");
        assert_eq!(config.ollama.base_url(), "http://[::1]:11434");
        assert_eq!(config.webui.env["OLLAMA_BASE_URL"], "http://[::1]:11434");
        assert_eq!(config.webui.access_url(), "http://[::1]:8080");
        assert_eq!(host_port("localhost", 80), "localhost:80");
    }
}
