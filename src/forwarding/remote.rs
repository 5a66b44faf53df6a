//! Remote Port Forwarding
//!
//! Asks the server to listen (`tcpip-forward`) and connects every incoming
//! `forwarded-tcpip` channel to a local host:port.
//!
//! ## Architecture
//!
//! The server announces forwarded connections to the transport's
//! [`ClientHandler`](crate::ssh::ClientHandler), not to whoever requested the
//! forward. Each transport therefore carries a [`RemoteForwardTable`] mapping
//! the bound (address, port) to its local target; the handler looks the
//! channel up there.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::{bridge, BindAddress, ForwardCounters, ForwardRuntime, ForwardTarget, StopCause};
use crate::ssh::SshError;

/// Local end of one remote forward
#[derive(Debug, Clone)]
pub struct RemoteForwardTarget {
    pub host: String,
    pub port: u16,
    pub(crate) counters: Arc<ForwardCounters>,
}

/// Per-transport map of bound remote address to local target
#[derive(Debug, Clone, Default)]
pub struct RemoteForwardTable {
    forwards: Arc<DashMap<(String, u32), RemoteForwardTarget>>,
}

impl RemoteForwardTable {
    pub fn insert(&self, address: &str, port: u32, target: RemoteForwardTarget) {
        self.forwards.insert((address.to_string(), port), target);
    }

    pub fn remove(&self, address: &str, port: u32) -> Option<RemoteForwardTarget> {
        self.forwards
            .remove(&(address.to_string(), port))
            .map(|(_, target)| target)
    }

    pub fn lookup(&self, address: &str, port: u32) -> Option<RemoteForwardTarget> {
        self.forwards
            .get(&(address.to_string(), port))
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.forwards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forwards.is_empty()
    }
}

/// Request the remote listener and register it. Returns the bound address.
pub(super) async fn start(
    bind: &BindAddress,
    target: ForwardTarget,
    mut runtime: ForwardRuntime,
) -> Result<String, SshError> {
    let ForwardTarget::Tcp { host, port } = target else {
        return Err(SshError::Configuration(
            "remote forwards connect to host:port only".into(),
        ));
    };

    let controller = runtime.controller.clone();
    let bound_port = controller
        .tcpip_forward(&bind.address, bind.port as u32)
        .await?;
    let address = bind.address.clone();
    let bound = format!("{}:{}", address, bound_port);
    info!("[Forward] Remote {} -> {}:{}", bound, host, port);

    let table = controller.remote_forwards().clone();
    table.insert(
        &address,
        bound_port,
        RemoteForwardTarget {
            host,
            port,
            counters: runtime.counters.clone(),
        },
    );

    let label = bound.clone();
    tokio::spawn(async move {
        let cause = runtime.stopped().await;
        table.remove(&address, bound_port);
        if cause == StopCause::Requested {
            if let Err(e) = controller.cancel_tcpip_forward(&address, bound_port).await {
                debug!("[Forward] Cancel of {} failed: {}", label, e);
            }
        }
        info!("[Forward] Remote {} stopped ({:?})", label, cause);
    });

    Ok(bound)
}

/// Connect a `forwarded-tcpip` channel to its local target
pub async fn handle_forwarded_connection(
    channel: russh::Channel<russh::client::Msg>,
    target: RemoteForwardTarget,
) -> Result<(), SshError> {
    let _guard = target.counters.open();
    let local = format!("{}:{}", target.host, target.port);
    let stream = TcpStream::connect(&local)
        .await
        .map_err(|e| SshError::ConnectionFailed(format!("Failed to connect to {}: {}", local, e)))?;
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }
    debug!("[Forward] Bridging forwarded connection to {}", local);
    bridge(stream, channel, &target.counters).await
}
