//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>`. Everything else talks to it
//! through a cloneable [`HandleController`] that sends commands over an mpsc
//! channel, so the handle is never shared behind a lock and never touched
//! concurrently.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, "prod".into(), closure, forwards);
//! let channel = controller.open_session_channel().await?;
//! let out = controller.exec("uname -s").await?;
//! ```

use std::sync::Arc;

use russh::client::{Handle, Msg};
use russh::{Channel, ChannelMsg};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;
use crate::forwarding::remote::RemoteForwardTable;

/// Keepalive outcome, split by failure cause
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    Ok,
    /// Slow network, may retry
    Timeout,
    /// The transport is gone
    IoError,
}

/// How a transport ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportClosure {
    /// We asked for it (Disconnect command or all controllers dropped)
    Requested,
    /// The server said goodbye
    Clean,
    /// The transport failed underneath us
    Error(String),
}

pub type ClosureSender = Arc<watch::Sender<Option<TransportClosure>>>;

/// Record the first closure reason only.
pub(crate) fn record_closure(tx: &ClosureSender, closure: TransportClosure) {
    tx.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(closure);
            true
        } else {
            false
        }
    });
}

/// Output of a one-shot remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: Option<u32>,
}

impl ExecOutput {
    pub fn stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            exit_status: Some(0),
            ..Default::default()
        }
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}{}", self.stdout, self.stderr)
        }
    }
}

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (PTY/shell/subsystem)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Open a direct-tcpip channel (local/dynamic forward, hop tunnel)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Open a channel to a unix socket on the server
    ChannelOpenDirectStreamlocal {
        socket_path: String,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Run a command to completion on a fresh session channel
    Exec {
        command: String,
        reply_tx: oneshot::Sender<Result<ExecOutput, SshError>>,
    },

    /// Request remote forward (tcpip-forward)
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
    },

    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },

    /// Keepalive probe
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },

    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task.
///
/// Cloning is cheap and every clone has full control over the transport, so it
/// must not leave the process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    /// Fires once when the owner task exits
    disconnect_tx: broadcast::Sender<()>,
    closure_rx: watch::Receiver<Option<TransportClosure>>,
    remote_forwards: RemoteForwardTable,
}

impl HandleController {
    /// Controller over a bare command channel. Used to stand in for a real
    /// transport; production code uses [`spawn_handle_owner_task`].
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        let (_closure_tx, closure_rx) = watch::channel(None);
        Self {
            cmd_tx,
            disconnect_tx,
            closure_rx,
            remote_forwards: RemoteForwardTable::default(),
        }
    }

    /// Like [`HandleController::new`] but with an externally driven closure signal.
    pub fn with_closure(
        cmd_tx: mpsc::Sender<HandleCommand>,
        closure_rx: watch::Receiver<Option<TransportClosure>>,
    ) -> Self {
        Self {
            closure_rx,
            ..Self::new(cmd_tx)
        }
    }

    /// Receives `()` when the transport is torn down. Use in `tokio::select!`.
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    /// Watch how the transport ended (`None` while it is alive)
    pub fn closure(&self) -> watch::Receiver<Option<TransportClosure>> {
        self.closure_rx.clone()
    }

    pub fn remote_forwards(&self) -> &RemoteForwardTable {
        &self.remote_forwards
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> HandleCommand,
    ) -> Result<T, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx.await.map_err(|_| SshError::Disconnected)
    }

    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        self.request(|reply_tx| HandleCommand::ChannelOpenSession { reply_tx })
            .await?
            .map_err(|e| SshError::Channel(e.to_string()))
    }

    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        self.request(|reply_tx| HandleCommand::ChannelOpenDirectTcpip {
            host: host.to_string(),
            port,
            originator_host: originator_host.to_string(),
            originator_port,
            reply_tx,
        })
        .await?
        .map_err(|e| SshError::Channel(e.to_string()))
    }

    pub async fn open_direct_streamlocal(&self, socket_path: &str) -> Result<Channel<Msg>, SshError> {
        self.request(|reply_tx| HandleCommand::ChannelOpenDirectStreamlocal {
            socket_path: socket_path.to_string(),
            reply_tx,
        })
        .await?
        .map_err(|e| SshError::Channel(e.to_string()))
    }

    /// Run `command` and collect its output
    pub async fn exec(&self, command: &str) -> Result<ExecOutput, SshError> {
        self.request(|reply_tx| HandleCommand::Exec {
            command: command.to_string(),
            reply_tx,
        })
        .await?
    }

    /// Returns the bound port (differs from `port` when 0 was requested)
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32, SshError> {
        self.request(|reply_tx| HandleCommand::TcpipForward {
            address: address.to_string(),
            port,
            reply_tx,
        })
        .await?
        .map_err(|e| SshError::ConnectionFailed(e.to_string()))
    }

    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), SshError> {
        self.request(|reply_tx| HandleCommand::CancelTcpipForward {
            address: address.to_string(),
            port,
            reply_tx,
        })
        .await?
        .map_err(|e| SshError::ConnectionFailed(e.to_string()))
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    pub async fn ping(&self) -> PingResult {
        self.request(|reply_tx| HandleCommand::Ping { reply_tx })
            .await
            .unwrap_or(PingResult::IoError)
    }

    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task.
///
/// Consumes the handle and returns a controller. `closure_tx` is shared with the
/// [`ClientHandler`] so both sides can record why the transport ended.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    session_name: String,
    closure_tx: ClosureSender,
    remote_forwards: RemoteForwardTable,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_clone = disconnect_tx.clone();
    let closure_rx = closure_tx.subscribe();

    tokio::spawn(async move {
        let mut handle = handle;

        info!("Handle owner task started for {}", session_name);

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HandleCommand::ChannelOpenSession { reply_tx } => {
                    let result = handle.channel_open_session().await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving channel_open_session result");
                    }
                }

                HandleCommand::ChannelOpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                } => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving direct_tcpip result");
                    }
                }

                HandleCommand::ChannelOpenDirectStreamlocal {
                    socket_path,
                    reply_tx,
                } => {
                    let result = handle.channel_open_direct_streamlocal(&socket_path).await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving direct_streamlocal result");
                    }
                }

                HandleCommand::Exec { command, reply_tx } => {
                    match handle.channel_open_session().await {
                        // Reading the output must not block the command loop
                        Ok(channel) => {
                            tokio::spawn(async move {
                                let _ = reply_tx.send(run_exec(channel, &command).await);
                            });
                        }
                        Err(e) => {
                            let _ = reply_tx.send(Err(SshError::Channel(e.to_string())));
                        }
                    }
                }

                HandleCommand::TcpipForward {
                    address,
                    port,
                    reply_tx,
                } => {
                    let result = handle.tcpip_forward(&address, port).await;
                    match &result {
                        Ok(bound_port) => {
                            let bound_port = *bound_port;
                            if reply_tx.send(result).is_err() {
                                // Nobody will ever cancel it otherwise
                                warn!(
                                    "Caller dropped after tcpip_forward succeeded. \
                                     Cancelling orphaned forward {}:{}",
                                    address, bound_port
                                );
                                let _ = handle.cancel_tcpip_forward(&address, bound_port).await;
                            }
                        }
                        Err(_) => {
                            let _ = reply_tx.send(result);
                        }
                    }
                }

                HandleCommand::CancelTcpipForward {
                    address,
                    port,
                    reply_tx,
                } => {
                    let result = handle.cancel_tcpip_forward(&address, port).await;
                    let _ = reply_tx.send(result);
                }

                HandleCommand::Ping { reply_tx } => {
                    debug!("Keepalive probe for {}", session_name);
                    let result = match tokio::time::timeout(
                        std::time::Duration::from_secs(5),
                        handle.send_keepalive(true),
                    )
                    .await
                    {
                        Ok(Ok(())) => PingResult::Ok,
                        Ok(Err(russh::Error::Disconnect)) | Ok(Err(russh::Error::IO(_))) => {
                            warn!("Keepalive failed for {}: transport gone", session_name);
                            PingResult::IoError
                        }
                        Ok(Err(e)) => {
                            warn!("Keepalive error for {} (soft): {:?}", session_name, e);
                            PingResult::Timeout
                        }
                        Err(_) => {
                            warn!("Keepalive timeout for {} (5s)", session_name);
                            PingResult::Timeout
                        }
                    };
                    let _ = reply_tx.send(result);
                }

                HandleCommand::Disconnect => {
                    info!("Disconnect requested for {}", session_name);
                    break;
                }
            }
        }

        record_closure(&closure_tx, TransportClosure::Requested);
        let _ = disconnect_tx_clone.send(());
        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for {}", session_name);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
        closure_rx,
        remote_forwards,
    }
}

async fn run_exec(mut channel: Channel<Msg>, command: &str) -> Result<ExecOutput, SshError> {
    channel
        .exec(true, command)
        .await
        .map_err(|e| SshError::Channel(e.to_string()))?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_status = None;

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                stderr.extend_from_slice(data)
            }
            ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
            ChannelMsg::Close => break,
            _ => {}
        }
    }

    Ok(ExecOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_status,
    })
}

/// Reply `Disconnected` to every command still queued
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx }
            | HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. }
            | HandleCommand::ChannelOpenDirectStreamlocal { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Exec { reply_tx, .. } => {
                let _ = reply_tx.send(Err(SshError::Disconnected));
            }
            HandleCommand::TcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::CancelTcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closed_command_channel_reports_disconnected() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let controller = HandleController::new(tx);
        assert!(!controller.is_connected());
        assert_eq!(controller.exec("true").await, Err(SshError::Disconnected));
        assert_eq!(controller.ping().await, PingResult::IoError);
    }

    #[tokio::test]
    async fn test_drain_replies_to_queued_commands() {
        let (tx, mut rx) = mpsc::channel(4);
        let controller = HandleController::new(tx);
        let pending = tokio::spawn({
            let c = controller.clone();
            async move { c.exec("ls").await }
        });
        // Wait until the command is queued, then drain
        while rx.is_empty() {
            tokio::task::yield_now().await;
        }
        drain_pending_commands(&mut rx);
        assert_eq!(pending.await.unwrap(), Err(SshError::Disconnected));
    }

    #[test]
    fn test_first_closure_wins() {
        let (tx, rx) = watch::channel(None);
        let tx = Arc::new(tx);
        record_closure(&tx, TransportClosure::Error("reset".into()));
        record_closure(&tx, TransportClosure::Requested);
        assert_eq!(*rx.borrow(), Some(TransportClosure::Error("reset".into())));
    }

    #[test]
    fn test_combined_output() {
        let out = ExecOutput {
            stdout: "a\n".into(),
            stderr: "b\n".into(),
            exit_status: Some(1),
        };
        assert_eq!(out.combined(), "a\nb\n");
    }
}
