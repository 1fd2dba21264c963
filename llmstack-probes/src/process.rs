//! Process table inspection and signalling.
//!
//! Matching is deliberately loose: a service may run under several process
//! names depending on how it was installed (a compiled launcher, a Python
//! entry point, an interpreter with a module argument). A [`ProcessMatcher`]
//! holds patterns for the short process name and for the full command line,
//! and a process matches when any pattern hits. Zombies count as gone.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use globset::{Glob, GlobMatcher};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Serialize, Serializer};
use tokio::fs;
use tracing::{debug, trace};

use crate::error::{ProbeError, ProbeResult};

/// How a process should be asked to go away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// SIGTERM: let the process run its normal exit path.
    Graceful,
    /// SIGKILL.
    Forced,
}

impl Termination {
    fn signal(self) -> Signal {
        match self {
            Termination::Graceful => Signal::SIGTERM,
            Termination::Forced => Signal::SIGKILL,
        }
    }
}

/// One entry in the OS process table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessRecord {
    pub pid: u32,
    /// Short process name as reported by the kernel.
    pub name: String,
    pub cmdline: String,
    /// Resident set size in bytes.
    pub memory_bytes: u64,
    #[serde(serialize_with = "serialize_rfc3339")]
    pub started_at: Option<SystemTime>,
}

impl ProcessRecord {
    pub fn uptime(&self) -> Option<Duration> {
        self.started_at
            .and_then(|started| SystemTime::now().duration_since(started).ok())
    }
}

fn serialize_rfc3339<S: Serializer>(time: &Option<SystemTime>, serializer: S) -> Result<S::Ok, S::Error> {
    match time {
        Some(time) => serializer.serialize_str(&humantime::format_rfc3339_seconds(*time).to_string()),
        None => serializer.serialize_none(),
    }
}

#[derive(Debug, Clone)]
enum Pattern {
    Substring(String),
    Glob(GlobMatcher),
}

impl Pattern {
    fn parse(raw: &str) -> ProbeResult<Self> {
        if raw.contains(['*', '?', '[']) {
            let glob = Glob::new(raw).map_err(|source| ProbeError::InvalidPattern {
                pattern: raw.to_string(),
                source,
            })?;
            Ok(Pattern::Glob(glob.compile_matcher()))
        } else {
            Ok(Pattern::Substring(raw.to_lowercase()))
        }
    }

    fn is_match(&self, haystack: &str) -> bool {
        match self {
            Pattern::Substring(needle) => haystack.to_lowercase().contains(needle),
            Pattern::Glob(glob) => glob.is_match(haystack),
        }
    }
}

/// Name and command-line patterns identifying a service's processes.
///
/// Patterns containing `*`, `?` or `[` are globs; anything else is a
/// case-insensitive substring. `exclude` patterns win over positive matches,
/// which keeps a companion such as `ollama app` out of the main match set.
#[derive(Debug, Clone, Default)]
pub struct ProcessMatcher {
    names: Vec<Pattern>,
    cmdlines: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl ProcessMatcher {
    pub fn new(names: &[String], cmdlines: &[String]) -> ProbeResult<Self> {
        Ok(Self {
            names: names.iter().map(|p| Pattern::parse(p)).collect::<Result<_, _>>()?,
            cmdlines: cmdlines
                .iter()
                .map(|p| Pattern::parse(p))
                .collect::<Result<_, _>>()?,
            exclude: Vec::new(),
        })
    }

    /// Exclude processes whose name or command line matches any of `patterns`.
    pub fn excluding(mut self, patterns: &[String]) -> ProbeResult<Self> {
        for pattern in patterns {
            self.exclude.push(Pattern::parse(pattern)?);
        }
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.cmdlines.is_empty()
    }

    pub fn matches(&self, record: &ProcessRecord) -> bool {
        let hit = self.names.iter().any(|p| p.is_match(&record.name))
            || self.cmdlines.iter().any(|p| p.is_match(&record.cmdline));
        if !hit {
            return false;
        }
        !self
            .exclude
            .iter()
            .any(|p| p.is_match(&record.name) || p.is_match(&record.cmdline))
    }
}

/// Query and signal the OS process table.
#[async_trait]
pub trait ProcessInspector: Send + Sync {
    /// All live processes matching `matcher`, sorted by PID. The calling
    /// process is never included. An empty result is not an error.
    async fn find(&self, matcher: &ProcessMatcher) -> ProbeResult<Vec<ProcessRecord>>;

    /// Look up a single PID. `None` if it is gone or a zombie.
    async fn get(&self, pid: u32) -> ProbeResult<Option<ProcessRecord>>;

    /// Send a termination signal. Returns `false` if the process was already gone.
    async fn signal(&self, pid: u32, termination: Termination) -> ProbeResult<bool>;
}

/// [`ProcessInspector`] that reads `/proc` (or another procfs mount).
#[derive(Debug, Clone)]
pub struct ProcfsInspector {
    root: PathBuf,
}

impl Default for ProcfsInspector {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcfsInspector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn read_record(&self, pid: u32) -> Option<ProcessRecord> {
        let dir = self.root.join(pid.to_string());
        let stat = fs::read_to_string(dir.join("stat")).await.ok()?;
        let stat = parse_stat(&stat)?;
        if matches!(stat.state, 'Z' | 'X') {
            trace!("Skipping defunct PID {}", pid);
            return None;
        }

        let cmdline = fs::read(dir.join("cmdline"))
            .await
            .map(|raw| parse_cmdline(&raw))
            .unwrap_or_default();
        let memory_bytes = fs::read_to_string(dir.join("status"))
            .await
            .ok()
            .and_then(|status| parse_vm_rss(&status))
            .unwrap_or(0);
        let started_at = self.boot_time().await.and_then(|boot| {
            let ticks = clock_ticks_per_second()?;
            Some(boot + Duration::from_millis(stat.start_ticks.saturating_mul(1000) / ticks))
        });

        Some(ProcessRecord {
            pid,
            name: stat.comm,
            cmdline,
            memory_bytes,
            started_at,
        })
    }

    async fn boot_time(&self) -> Option<SystemTime> {
        let stat = fs::read_to_string(self.root.join("stat")).await.ok()?;
        let secs = stat
            .lines()
            .find_map(|line| line.strip_prefix("btime "))?
            .trim()
            .parse::<u64>()
            .ok()?;
        Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
    }

    async fn list_pids(&self) -> ProbeResult<Vec<u32>> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(ProbeError::ProcessTable)?;
        let mut pids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(ProbeError::ProcessTable)?
        {
            if let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
                pids.push(pid);
            }
        }
        pids.sort_unstable();
        Ok(pids)
    }
}

#[async_trait]
impl ProcessInspector for ProcfsInspector {
    async fn find(&self, matcher: &ProcessMatcher) -> ProbeResult<Vec<ProcessRecord>> {
        if matcher.is_empty() {
            return Ok(Vec::new());
        }
        let own_pid = std::process::id();
        let mut found = Vec::new();
        for pid in self.list_pids().await? {
            if pid == own_pid {
                continue;
            }
            // Processes may exit between listing and reading; that is not an error.
            if let Some(record) = self.read_record(pid).await
                && matcher.matches(&record)
            {
                found.push(record);
            }
        }
        debug!("Process match found {} candidate(s)", found.len());
        Ok(found)
    }

    async fn get(&self, pid: u32) -> ProbeResult<Option<ProcessRecord>> {
        Ok(self.read_record(pid).await)
    }

    async fn signal(&self, pid: u32, termination: Termination) -> ProbeResult<bool> {
        let signal = termination.signal();
        match signal::kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) => {
                debug!("Sent {} to PID {}", signal, pid);
                Ok(true)
            }
            Err(nix::errno::Errno::ESRCH) => Ok(false),
            Err(source) => Err(ProbeError::Signal {
                pid,
                signal: signal.as_str(),
                source,
            }),
        }
    }
}

struct StatLine {
    comm: String,
    state: char,
    start_ticks: u64,
}

/// Parse `/proc/<pid>/stat`. The command name sits in parentheses and may
/// itself contain spaces or parentheses, so split on the last `)`.
fn parse_stat(raw: &str) -> Option<StatLine> {
    let open = raw.find('(')?;
    let close = raw.rfind(')')?;
    let comm = raw.get(open + 1..close)?.to_string();
    let fields: Vec<&str> = raw.get(close + 1..)?.split_whitespace().collect();
    // Field 3 of the man page (state) is index 0 here; starttime is field 22.
    let state = fields.first()?.chars().next()?;
    let start_ticks = fields.get(19)?.parse().ok()?;
    Some(StatLine {
        comm,
        state,
        start_ticks,
    })
}

fn parse_cmdline(raw: &[u8]) -> String {
    raw.split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part))
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let kb = status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))?
        .split_whitespace()
        .next()?
        .parse::<u64>()
        .ok()?;
    Some(kb * 1024)
}

fn clock_ticks_per_second() -> Option<u64> {
    nix::unistd::sysconf(nix::unistd::SysconfVar::CLK_TCK)
        .ok()
        .flatten()
        .and_then(|ticks| u64::try_from(ticks).ok())
        .filter(|ticks| *ticks > 0)
}
