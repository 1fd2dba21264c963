//! Shared test utilities for llmstack-supervisor integration tests.

// Each test file compiles separately, so not all helpers are used in each binary
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use llmstack_probes::{
    HealthChecker, PortOwner, PortProber, PortState, ProbeResult, ProcessInspector,
    ProcessMatcher, ProcessRecord, Termination,
};
use llmstack_supervisor::{
    Confirmation, Confirmer, FileConfig, LaunchSpec, Launcher, Probes, RecordingObserver,
    ServiceKind, ServiceOverrides, ServiceSupervisor, StackConfig, StackOrchestrator, Timings,
};
use tempfile::TempDir;

// ============================================================================
// Fake OS
// ============================================================================

/// What a launched fake process does.
#[derive(Debug, Clone)]
pub enum LaunchPlan {
    /// `launch` itself fails.
    Fail(String),
    /// The launch succeeds but the process is gone right away.
    ExitImmediately,
    /// Keeps running; answers health checks after `ready_after` (never if `None`).
    Run {
        ready_after: Option<Duration>,
        ignores_term: bool,
    },
}

impl LaunchPlan {
    pub fn healthy() -> Self {
        LaunchPlan::Run {
            ready_after: Some(Duration::ZERO),
            ignores_term: false,
        }
    }

    pub fn never_healthy() -> Self {
        LaunchPlan::Run {
            ready_after: None,
            ignores_term: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FakeProcess {
    pub record: ProcessRecord,
    /// Port the process listens on.
    pub port: Option<u16>,
    /// Liveness URL the process answers once `ready_at` has passed.
    pub health_url: Option<String>,
    pub ready_at: Option<Instant>,
    pub ignores_term: bool,
    pub ignores_kill: bool,
    /// Comes back under a fresh pid after exiting on SIGTERM, as if a
    /// companion relaunched it.
    pub respawns_on_term: bool,
}

impl FakeProcess {
    pub fn new(pid: u32, name: &str, cmdline: &str) -> Self {
        Self {
            record: ProcessRecord {
                pid,
                name: name.to_string(),
                cmdline: cmdline.to_string(),
                memory_bytes: 64 * 1024 * 1024,
                started_at: Some(SystemTime::now()),
            },
            port: None,
            health_url: None,
            ready_at: None,
            ignores_term: false,
            ignores_kill: false,
            respawns_on_term: false,
        }
    }

    fn is_healthy(&self) -> bool {
        self.ready_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub processes: BTreeMap<u32, FakeProcess>,
    /// Unrelated listeners, by port.
    pub squatters: BTreeMap<u16, PortOwner>,
    pub plans: HashMap<ServiceKind, LaunchPlan>,
    pub launches: Vec<LaunchSpec>,
    pub signals: Vec<(u32, Termination)>,
    /// Service each port and liveness URL belongs to, filled by `TestContext`.
    pub endpoints: HashMap<ServiceKind, (u16, String)>,
    next_pid: u32,
}

/// Process table, socket table, HTTP endpoints and launcher in one.
#[derive(Debug, Clone, Default)]
pub struct FakeSystem {
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeSystem {
    pub fn new() -> Self {
        let system = Self::default();
        system.state.lock().unwrap().next_pid = 1000;
        system
    }

    pub fn probes(&self) -> Probes {
        Probes {
            processes: Arc::new(self.clone()),
            ports: Arc::new(self.clone()),
            health: Arc::new(self.clone()),
            launcher: Arc::new(self.clone()),
        }
    }

    pub fn set_plan(&self, service: ServiceKind, plan: LaunchPlan) {
        self.state.lock().unwrap().plans.insert(service, plan);
    }

    /// Insert a process that looks like `service` and return its pid.
    pub fn spawn_existing(&self, service: ServiceKind, healthy: bool) -> u32 {
        let mut state = self.state.lock().unwrap();
        let pid = state.next_pid;
        state.next_pid += 1;
        let (port, url) = state.endpoints[&service].clone();
        let name = program_name(service);
        let mut process = FakeProcess::new(pid, name, &format!("{name} serve"));
        process.port = Some(port);
        process.health_url = Some(url);
        process.ready_at = healthy.then(Instant::now);
        state.processes.insert(pid, process);
        pid
    }

    /// Insert an arbitrary process and return its pid.
    pub fn insert(&self, build: impl FnOnce(u32) -> FakeProcess) -> u32 {
        let mut state = self.state.lock().unwrap();
        let pid = state.next_pid;
        state.next_pid += 1;
        state.processes.insert(pid, build(pid));
        pid
    }

    pub fn update(&self, pid: u32, change: impl FnOnce(&mut FakeProcess)) {
        if let Some(process) = self.state.lock().unwrap().processes.get_mut(&pid) {
            change(process);
        }
    }

    pub fn add_squatter(&self, port: u16, pid: u32, name: &str) {
        self.state.lock().unwrap().squatters.insert(
            port,
            PortOwner {
                pid,
                name: Some(name.to_string()),
            },
        );
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.state.lock().unwrap().processes.contains_key(&pid)
    }

    pub fn launches(&self) -> Vec<ServiceKind> {
        self.state
            .lock()
            .unwrap()
            .launches
            .iter()
            .map(|spec| spec.service)
            .collect()
    }

    pub fn signals(&self) -> Vec<(u32, Termination)> {
        self.state.lock().unwrap().signals.clone()
    }

    fn port_state(&self, port: u16) -> PortState {
        let state = self.state.lock().unwrap();
        let mut owners: Vec<PortOwner> = state
            .processes
            .values()
            .filter(|p| p.port == Some(port))
            .map(|p| PortOwner {
                pid: p.record.pid,
                name: Some(p.record.name.clone()),
            })
            .collect();
        owners.extend(state.squatters.get(&port).cloned());
        PortState {
            port,
            listening: !owners.is_empty(),
            established: false,
            owners,
        }
    }
}

pub fn program_name(service: ServiceKind) -> &'static str {
    match service {
        ServiceKind::Ollama => "ollama",
        ServiceKind::Webui => "open-webui",
    }
}

#[async_trait]
impl ProcessInspector for FakeSystem {
    async fn find(&self, matcher: &ProcessMatcher) -> ProbeResult<Vec<ProcessRecord>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .processes
            .values()
            .filter(|p| matcher.matches(&p.record))
            .map(|p| p.record.clone())
            .collect())
    }

    async fn get(&self, pid: u32) -> ProbeResult<Option<ProcessRecord>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .processes
            .get(&pid)
            .map(|p| p.record.clone()))
    }

    async fn signal(&self, pid: u32, termination: Termination) -> ProbeResult<bool> {
        let mut state = self.state.lock().unwrap();
        state.signals.push((pid, termination));
        let Some(process) = state.processes.get(&pid) else {
            return Ok(false);
        };
        let dies = match termination {
            Termination::Graceful => !process.ignores_term,
            Termination::Forced => !process.ignores_kill,
        };
        if dies
            && let Some(mut process) = state.processes.remove(&pid)
            && termination == Termination::Graceful
            && process.respawns_on_term
        {
            let respawned = state.next_pid;
            state.next_pid += 1;
            process.record.pid = respawned;
            process.respawns_on_term = false;
            state.processes.insert(respawned, process);
        }
        Ok(true)
    }
}

#[async_trait]
impl PortProber for FakeSystem {
    async fn probe(&self, port: u16) -> ProbeResult<PortState> {
        Ok(self.port_state(port))
    }
}

#[async_trait]
impl HealthChecker for FakeSystem {
    async fn check(&self, url: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .processes
            .values()
            .any(|p| p.health_url.as_deref() == Some(url) && p.is_healthy())
    }

    async fn fetch_json(&self, url: &str) -> Option<serde_json::Value> {
        if self.check(url).await {
            Some(serde_json::json!({"models": [{"name": "llama3:8b"}, {"name": "mistral:7b"}]}))
        } else {
            None
        }
    }
}

#[async_trait]
impl Launcher for FakeSystem {
    async fn launch(&self, spec: &LaunchSpec) -> std::io::Result<u32> {
        let mut state = self.state.lock().unwrap();
        state.launches.push(spec.clone());
        let plan = state
            .plans
            .get(&spec.service)
            .cloned()
            .unwrap_or_else(LaunchPlan::healthy);
        let pid = state.next_pid;
        state.next_pid += 1;

        match plan {
            LaunchPlan::Fail(message) => Err(std::io::Error::other(message)),
            LaunchPlan::ExitImmediately => Ok(pid),
            LaunchPlan::Run {
                ready_after,
                ignores_term,
            } => {
                let (port, url) = state.endpoints[&spec.service].clone();
                let name = program_name(spec.service);
                let mut process = FakeProcess::new(
                    pid,
                    name,
                    &format!("{} {}", spec.program.display(), spec.args.join(" ")),
                );
                process.port = Some(port);
                process.health_url = Some(url);
                process.ready_at = ready_after.map(|delay| Instant::now() + delay);
                process.ignores_term = ignores_term;
                state.processes.insert(pid, process);
                Ok(pid)
            }
        }
    }
}

// ============================================================================
// Confirmation
// ============================================================================

/// Gives a fixed answer and counts how often it was asked.
pub struct FixedConfirmer {
    pub answer: Confirmation,
    pub asked: AtomicUsize,
}

impl FixedConfirmer {
    pub fn new(answer: Confirmation) -> Arc<Self> {
        Arc::new(Self {
            answer,
            asked: AtomicUsize::new(0),
        })
    }

    pub fn times_asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

impl Confirmer for FixedConfirmer {
    fn confirm(&self, _prompt: &str) -> Confirmation {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.answer
    }
}

// ============================================================================
// Test Context
// ============================================================================

/// Test context that manages temp directories, fake executables and config
pub struct TestContext {
    pub temp_dir: TempDir,
    pub bin_dir: PathBuf,
    pub config: StackConfig,
    pub system: FakeSystem,
    pub observer: Arc<RecordingObserver>,
}

/// Short timings so lifecycle paths finish in well under a second.
pub fn fast_timings() -> Timings {
    Timings {
        health_timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(20),
        progress_interval: Duration::from_millis(50),
        launch_settle: Duration::from_millis(20),
        kill_settle: Duration::from_millis(20),
        companion_settle: Duration::from_millis(10),
        quick_probe_retries: 0,
    }
}

impl TestContext {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let bin_dir = temp_dir.path().join("bin");
        std::fs::create_dir_all(&bin_dir).expect("Failed to create bin dir");
        for service in ServiceKind::START_ORDER {
            create_executable(&bin_dir.join(program_name(service)));
        }

        let no_well_known = ServiceOverrides {
            search_paths: Some(vec![]),
            ..Default::default()
        };
        let file = FileConfig {
            ollama: no_well_known.clone(),
            webui: no_well_known,
            ..Default::default()
        };
        let mut config = StackConfig::resolve(
            temp_dir.path().join("data"),
            file,
            None,
            Some(bin_dir.clone().into_os_string()),
        )
        .expect("Failed to resolve config");
        config.timings = fast_timings();
        for service in [&mut config.ollama, &mut config.webui] {
            service.startup_timeout = Duration::from_millis(500);
            service.shutdown_timeout = Duration::from_millis(100);
        }

        let system = FakeSystem::new();
        {
            let mut state = system.state.lock().unwrap();
            for service in ServiceKind::START_ORDER {
                let descriptor = config.service(service);
                state
                    .endpoints
                    .insert(service, (descriptor.port, descriptor.liveness_url()));
            }
        }

        Self {
            temp_dir,
            bin_dir,
            config,
            system,
            observer: Arc::new(RecordingObserver::new()),
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn remove_executable(&self, service: ServiceKind) {
        std::fs::remove_file(self.bin_dir.join(program_name(service)))
            .expect("Failed to remove executable");
    }

    pub fn pid_file(&self, service: ServiceKind) -> PathBuf {
        self.config.state_dir.join(format!("{service}.pid"))
    }

    pub fn supervisor(&self, service: ServiceKind) -> ServiceSupervisor {
        ServiceSupervisor::new(
            Arc::new(self.config.clone()),
            service,
            self.system.probes(),
            self.observer.clone(),
        )
        .expect("Failed to create supervisor")
    }

    pub fn orchestrator(&self, confirmer: Arc<dyn Confirmer>) -> StackOrchestrator {
        StackOrchestrator::new(
            Arc::new(self.config.clone()),
            self.system.probes(),
            confirmer,
            self.observer.clone(),
        )
        .expect("Failed to create orchestrator")
    }
}

/// Create an empty executable file.
pub fn create_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, "#!/bin/sh\n").expect("Failed to write executable");
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .expect("Failed to set permissions");
}

// ============================================================================
// Wait Helpers
// ============================================================================

/// Wait for a condition with exponential backoff
pub async fn wait_for_condition<F, Fut>(mut check: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    let mut delay = Duration::from_millis(10);
    let max_delay = Duration::from_millis(500);

    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(max_delay);
    }
    false
}

// ============================================================================
// Test Timeouts
// ============================================================================

/// Upper bound for a single test
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);
