//! Transport Establisher
//!
//! Turns a validated [`TargetDescriptor`] into an authenticated transport:
//!
//! ```text
//! prompts (host, username)
//!     └─▶ stream: direct TCP | SOCKS4/5 | HTTP CONNECT | direct-tcpip via hop
//!           └─▶ SSH handshake (connect_stream)
//!                 └─▶ auth chain ─▶ handle owner task ─▶ HandleController
//! ```
//!
//! The registry only talks to the [`Connector`] trait, so tests can replace the
//! network with a counting mock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::Handle;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, info};

use super::auth::{authenticate, resolve_promptable, PromptKind, Prompter};
use super::client::ClientHandler;
use super::connection_registry::{ConnectionRegistry, HopLease};
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, ClosureSender, HandleController};
use super::proxy::{connect_direct, connect_via_proxy};
use crate::config::{ConnectionPlan, Promptable, RegistryConfig, Route, TargetDescriptor};
use crate::consumer::PendingUse;
use crate::forwarding::remote::RemoteForwardTable;

/// An authenticated transport, not negotiated yet
pub struct EstablishedTransport {
    pub controller: HandleController,
    /// `target` with host and username resolved
    pub actual: TargetDescriptor,
    /// Tunnel lease on the hop session, when routed through one
    pub hop: Option<HopLease>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// `plan` is the result of `target.validate()`; no I/O happened before.
    async fn establish(
        &self,
        target: &TargetDescriptor,
        plan: &ConnectionPlan,
        registry: &Arc<ConnectionRegistry>,
    ) -> Result<EstablishedTransport, SshError>;
}

#[derive(Debug, Clone, Default)]
pub struct ConnectorOptions {
    /// `None`: wait as long as the network does
    pub connect_timeout: Option<Duration>,
    pub keepalive_interval: Duration,
}

impl ConnectorOptions {
    pub fn from_config(config: &RegistryConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            keepalive_interval: config.keepalive_interval(),
        }
    }
}

/// The real establisher over russh
pub struct SshConnector {
    prompter: Arc<dyn Prompter>,
    options: ConnectorOptions,
}

impl SshConnector {
    pub fn new(prompter: Arc<dyn Prompter>, options: ConnectorOptions) -> Self {
        Self { prompter, options }
    }

    async fn handshake<S>(
        &self,
        stream: S,
        handler: ClientHandler,
    ) -> Result<Handle<ClientHandler>, SshError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let config = Arc::new(russh::client::Config {
            keepalive_interval: Some(self.options.keepalive_interval),
            keepalive_max: 3,
            ..Default::default()
        });
        let handshake = russh::client::connect_stream(config, stream, handler);
        match self.options.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, handshake)
                .await
                .map_err(|_| SshError::Timeout(format!("SSH handshake exceeded {:?}", limit)))?,
            None => handshake.await,
        }
    }

    /// Wraps the TCP connect in the connect timeout, if any
    async fn with_timeout<T>(
        &self,
        what: &str,
        fut: impl std::future::Future<Output = Result<T, SshError>>,
    ) -> Result<T, SshError> {
        match self.options.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| SshError::Timeout(format!("{} exceeded {:?}", what, limit)))?,
            None => fut.await,
        }
    }

    async fn resolve_username(&self, target: &TargetDescriptor) -> Result<String, SshError> {
        match &target.username {
            Some(field) => Ok(resolve_promptable(
                self.prompter.as_ref(),
                &target.name,
                field,
                PromptKind::Username,
                &format!("Username for {}", target.name),
            )
            .await?
            .to_string()),
            None => Ok(whoami::username()),
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn establish(
        &self,
        target: &TargetDescriptor,
        plan: &ConnectionPlan,
        registry: &Arc<ConnectionRegistry>,
    ) -> Result<EstablishedTransport, SshError> {
        let host_field = target.host.as_ref().ok_or_else(|| {
            SshError::Configuration(format!("target '{}' has no host", target.name))
        })?;
        let host = resolve_promptable(
            self.prompter.as_ref(),
            &target.name,
            host_field,
            PromptKind::Host,
            &format!("Host for {}", target.name),
        )
        .await?
        .to_string();
        let username = self.resolve_username(target).await?;

        let mut actual = target.clone();
        actual.host = Some(Promptable::Value(host.clone()));
        actual.username = Some(Promptable::Value(username.clone()));

        let (closure_tx, _) = watch::channel(None);
        let closure_tx: ClosureSender = Arc::new(closure_tx);
        let remote_forwards = RemoteForwardTable::default();
        let handler = ClientHandler::new(
            host.clone(),
            target.port,
            closure_tx.clone(),
            remote_forwards.clone(),
        );

        info!(
            "Establishing {}@{}:{} for '{}' ({:?})",
            username, host, target.port, target.name, plan.route
        );
        let (mut handle, hop) = match &plan.route {
            Route::Direct => {
                let stream = self
                    .with_timeout("TCP connect", connect_direct(&host, target.port))
                    .await?;
                (self.handshake(stream, handler).await?, None)
            }
            Route::Proxy(proxy) => {
                let stream = self
                    .with_timeout("proxy connect", connect_via_proxy(proxy, &host, target.port))
                    .await?;
                (self.handshake(stream, handler).await?, None)
            }
            Route::Hop(hop_name) => {
                let (channel, lease) =
                    open_hop_tunnel(registry, hop_name, &target.name, &host, target.port).await?;
                let handle = self.handshake(channel.into_stream(), handler).await?;
                (handle, Some(lease))
            }
        };
        debug!("SSH handshake with {} completed", target.name);

        authenticate(&mut handle, &actual, &username, &self.prompter).await?;
        info!("Authenticated to '{}' as {}", target.name, username);

        let controller =
            spawn_handle_owner_task(handle, target.name.clone(), closure_tx, remote_forwards);
        Ok(EstablishedTransport {
            controller,
            actual,
            hop,
        })
    }
}

/// Get (or create) the hop session and open a direct-tcpip channel through it.
///
/// The hop is held with a pending use while the channel opens so its reaper
/// cannot close it in between; afterwards the returned lease keeps it alive.
async fn open_hop_tunnel(
    registry: &Arc<ConnectionRegistry>,
    hop: &str,
    child: &str,
    host: &str,
    port: u16,
) -> Result<(russh::Channel<russh::client::Msg>, HopLease), SshError> {
    let unavailable = |e: SshError| SshError::HopUnavailable {
        hop: hop.to_string(),
        message: e.to_string(),
    };

    let hop_session = registry
        .get_or_create(hop, None)
        .await
        .map_err(unavailable)?;
    let pending = PendingUse::acquire(registry, &hop_session);

    info!("Tunnelling '{}' through '{}' to {}:{}", child, hop, host, port);
    let channel = hop_session
        .controller()
        .open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
        .await
        .map_err(unavailable)?;

    let lease = HopLease::acquire(registry, &hop_session, child);
    drop(pending);
    Ok((channel, lease))
}
