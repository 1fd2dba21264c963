use std::path::PathBuf;

use async_trait::async_trait;
use netstat2::{AddressFamilyFlags, ProtocolFlags, ProtocolSocketInfo, TcpState, get_sockets_info};
use serde::Serialize;
use tracing::trace;

use crate::error::{ProbeError, ProbeResult};

/// A process holding a listening socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortOwner {
    pub pid: u32,
    pub name: Option<String>,
}

impl std::fmt::Display for PortOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} (PID {})", name, self.pid),
            None => write!(f, "PID {}", self.pid),
        }
    }
}

/// Socket table view of a single TCP port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PortState {
    pub port: u16,
    pub listening: bool,
    /// Secondary signal: some client is connected to the port.
    pub established: bool,
    /// Owners of the listening sockets, when the OS tells us.
    pub owners: Vec<PortOwner>,
}

impl PortState {
    pub fn free(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn is_active(&self) -> bool {
        self.listening
    }

    /// Listening owners whose PID is not in `known`.
    pub fn foreign_owners<'a>(&'a self, known: &'a [u32]) -> impl Iterator<Item = &'a PortOwner> {
        self.owners.iter().filter(move |o| !known.contains(&o.pid))
    }
}

/// Query the OS socket table. One snapshot per call, never retried.
#[async_trait]
pub trait PortProber: Send + Sync {
    async fn probe(&self, port: u16) -> ProbeResult<PortState>;
}

/// [`PortProber`] backed by `netstat2`, resolving owner names through procfs.
#[derive(Debug, Clone)]
pub struct NetstatPortProber {
    proc_root: PathBuf,
}

impl Default for NetstatPortProber {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }
}

impl NetstatPortProber {
    fn snapshot(port: u16, proc_root: PathBuf) -> ProbeResult<PortState> {
        let af_flags = AddressFamilyFlags::IPV4 | AddressFamilyFlags::IPV6;
        let sockets = get_sockets_info(af_flags, ProtocolFlags::TCP)
            .map_err(|e| ProbeError::SocketTable(e.to_string()))?;

        let mut state = PortState::free(port);
        for socket in sockets {
            let ProtocolSocketInfo::Tcp(tcp) = &socket.protocol_socket_info else {
                continue;
            };
            if tcp.local_port != port {
                continue;
            }
            match tcp.state {
                TcpState::Listen => {
                    state.listening = true;
                    for pid in &socket.associated_pids {
                        if state.owners.iter().any(|o| o.pid == *pid) {
                            continue;
                        }
                        let name = std::fs::read_to_string(proc_root.join(format!("{pid}/comm")))
                            .ok()
                            .map(|n| n.trim().to_string());
                        state.owners.push(PortOwner { pid: *pid, name });
                    }
                }
                TcpState::Established => state.established = true,
                _ => {}
            }
        }
        trace!(
            "Port {} listening={} established={}",
            port, state.listening, state.established
        );
        Ok(state)
    }
}

#[async_trait]
impl PortProber for NetstatPortProber {
    async fn probe(&self, port: u16) -> ProbeResult<PortState> {
        let proc_root = self.proc_root.clone();
        tokio::task::spawn_blocking(move || Self::snapshot(port, proc_root))
            .await
            .map_err(|e| ProbeError::SocketTable(e.to_string()))?
    }
}
