//! Port Forwarding Module
//!
//! Local, remote and dynamic (SOCKS5) forwards layered on a session's
//! transport. Every forward runs in its own task and stops on whichever comes
//! first: [`ActiveForwarding::stop`] or the transport's disconnect broadcast.
//!
//! ```text
//! L [addr:]port host:port|/socket   local listener  ─▶ direct-tcpip / streamlocal
//! R [addr:]port host:port           tcpip-forward   ─▶ forwarded-tcpip ─▶ local connect
//! D [addr:]port                     SOCKS5 listener ─▶ direct-tcpip
//! ```

mod dynamic;
mod local;
mod manager;
pub mod remote;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use russh::client::Msg;
use russh::Channel;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, watch};

use crate::session::Session;
use crate::ssh::{HandleController, SshError};

pub use manager::ForwardingManager;

const DEFAULT_LOCAL_BIND: &str = "127.0.0.1";
const DEFAULT_REMOTE_BIND: &str = "localhost";

// ═══════════════════════════════════════════════════════════════════════════
// Specs
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindAddress {
    pub address: String,
    pub port: u16,
}

impl BindAddress {
    /// `[addr:]port`
    fn parse(raw: &str, default_address: &str) -> Result<Self, SshError> {
        let (address, port) = match raw.rsplit_once(':') {
            Some((address, port)) => (address.trim_matches(|c| c == '[' || c == ']'), port),
            None => (default_address, raw),
        };
        let port = port
            .parse()
            .map_err(|_| SshError::Configuration(format!("invalid port in '{}'", raw)))?;
        if address.is_empty() {
            return Err(SshError::Configuration(format!("empty address in '{}'", raw)));
        }
        Ok(Self {
            address: address.to_string(),
            port,
        })
    }
}

impl fmt::Display for BindAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Where forwarded connections end up
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ForwardTarget {
    Tcp { host: String, port: u16 },
    /// Unix socket path on the server
    Socket { path: String },
}

impl ForwardTarget {
    fn parse(raw: &str) -> Result<Self, SshError> {
        if raw.starts_with('/') {
            return Ok(ForwardTarget::Socket {
                path: raw.to_string(),
            });
        }
        let bind = BindAddress::parse(raw, "")
            .ok()
            .filter(|b| raw.contains(':') && !b.address.is_empty())
            .ok_or_else(|| {
                SshError::Configuration(format!("target '{}' is not host:port or a socket path", raw))
            })?;
        Ok(ForwardTarget::Tcp {
            host: bind.address,
            port: bind.port,
        })
    }
}

impl fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardTarget::Tcp { host, port } => write!(f, "{}:{}", host, port),
            ForwardTarget::Socket { path } => f.write_str(path),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ForwardingSpec {
    /// Listen locally, connect on the server
    Local { bind: BindAddress, target: ForwardTarget },
    /// Listen on the server, connect locally
    Remote { bind: BindAddress, target: ForwardTarget },
    /// Local SOCKS5 front-end
    Dynamic { bind: BindAddress },
}

impl ForwardingSpec {
    /// Compact syntax: `L [addr:]port host:port`, `R [addr:]port host:port`,
    /// `D [addr:]port`. Local targets may also be a socket path.
    pub fn parse(input: &str) -> Result<Self, SshError> {
        let words: Vec<&str> = input.split_whitespace().collect();
        let spec = match words.as_slice() {
            [kind, bind, target] if kind.eq_ignore_ascii_case("L") => ForwardingSpec::Local {
                bind: BindAddress::parse(bind, DEFAULT_LOCAL_BIND)?,
                target: ForwardTarget::parse(target)?,
            },
            [kind, bind, target] if kind.eq_ignore_ascii_case("R") => {
                let target = ForwardTarget::parse(target)?;
                if matches!(target, ForwardTarget::Socket { .. }) {
                    return Err(SshError::Configuration(
                        "remote forwards connect to host:port only".into(),
                    ));
                }
                ForwardingSpec::Remote {
                    bind: BindAddress::parse(bind, DEFAULT_REMOTE_BIND)?,
                    target,
                }
            }
            [kind, bind] if kind.eq_ignore_ascii_case("D") => ForwardingSpec::Dynamic {
                bind: BindAddress::parse(bind, DEFAULT_LOCAL_BIND)?,
            },
            _ => {
                return Err(SshError::Configuration(format!(
                    "unrecognised forwarding '{}'",
                    input
                )))
            }
        };
        Ok(spec)
    }

    pub fn bind(&self) -> &BindAddress {
        match self {
            ForwardingSpec::Local { bind, .. }
            | ForwardingSpec::Remote { bind, .. }
            | ForwardingSpec::Dynamic { bind } => bind,
        }
    }
}

impl fmt::Display for ForwardingSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardingSpec::Local { bind, target } => write!(f, "L {} {}", bind, target),
            ForwardingSpec::Remote { bind, target } => write!(f, "R {} {}", bind, target),
            ForwardingSpec::Dynamic { bind } => write!(f, "D {}", bind),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Stats
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardStats {
    pub connection_count: u64,
    pub active_connections: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Lock-free counters shared with connection tasks
#[derive(Debug, Default)]
pub(crate) struct ForwardCounters {
    connection_count: AtomicU64,
    active_connections: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl ForwardCounters {
    /// Count a new connection; it stays active until the guard drops
    pub(crate) fn open(self: &Arc<Self>) -> ConnectionGuard {
        self.connection_count.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            counters: self.clone(),
        }
    }

    fn record(&self, sent: u64, received: u64) {
        self.bytes_sent.fetch_add(sent, Ordering::Relaxed);
        self.bytes_received.fetch_add(received, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ForwardStats {
        ForwardStats {
            connection_count: self.connection_count.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct ConnectionGuard {
    counters: Arc<ForwardCounters>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Runtime
// ═══════════════════════════════════════════════════════════════════════════

/// Why a forward task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopCause {
    Requested,
    Disconnected,
}

/// What a forward task needs besides its own config
pub(crate) struct ForwardRuntime {
    pub controller: HandleController,
    stop: Arc<watch::Sender<bool>>,
    disconnect: broadcast::Receiver<()>,
    pub counters: Arc<ForwardCounters>,
}

impl ForwardRuntime {
    fn new(controller: HandleController) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            disconnect: controller.subscribe_disconnect(),
            controller,
            stop: Arc::new(stop),
            counters: Arc::default(),
        }
    }

    /// Resolves once the forward should shut down, and marks it stopped
    pub(crate) async fn stopped(&mut self) -> StopCause {
        let mut stop = self.stop.subscribe();
        let cause = tokio::select! {
            _ = stop.wait_for(|stopped| *stopped) => StopCause::Requested,
            _ = self.disconnect.recv() => StopCause::Disconnected,
        };
        self.stop.send_replace(true);
        cause
    }
}

/// Copy both ways between a local stream and an SSH channel until either side closes
pub(crate) async fn bridge<S>(
    mut stream: S,
    channel: Channel<Msg>,
    counters: &ForwardCounters,
) -> Result<(), SshError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut remote = channel.into_stream();
    let (sent, received) = tokio::io::copy_bidirectional(&mut stream, &mut remote).await?;
    counters.record(sent, received);
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// ActiveForwarding
// ═══════════════════════════════════════════════════════════════════════════

/// A running forward attached to a session.
///
/// Clones share the stop signal and counters. The session is referenced by
/// name and id only; the session's usage list holds the forwarding.
#[derive(Debug, Clone)]
pub struct ActiveForwarding {
    id: String,
    spec: ForwardingSpec,
    session_name: String,
    session_id: String,
    /// Address actually bound (port 0 resolved)
    bound: String,
    stop: Arc<watch::Sender<bool>>,
    counters: Arc<ForwardCounters>,
}

impl ActiveForwarding {
    /// Start `spec` on `session`'s transport
    pub(crate) async fn start(session: &Session, spec: ForwardingSpec) -> Result<Self, SshError> {
        let runtime = ForwardRuntime::new(session.controller().clone());
        let stop = runtime.stop.clone();
        let counters = runtime.counters.clone();

        let bound = match &spec {
            ForwardingSpec::Local { bind, target } => {
                local::start(bind, target.clone(), runtime).await?
            }
            ForwardingSpec::Remote { bind, target } => {
                remote::start(bind, target.clone(), runtime).await?
            }
            ForwardingSpec::Dynamic { bind } => dynamic::start(bind, runtime).await?,
        };

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            spec,
            session_name: session.name().to_string(),
            session_id: session.id().to_string(),
            bound,
            stop,
            counters,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn spec(&self) -> &ForwardingSpec {
        &self.spec
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn bound(&self) -> &str {
        &self.bound
    }

    pub fn stats(&self) -> ForwardStats {
        self.counters.snapshot()
    }

    /// Idempotent
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }
}
