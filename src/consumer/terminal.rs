//! Interactive terminal on a session
//!
//! A PTY channel runs the session's login shell (or a given command) inside
//! the session root with the session environment. One pump task owns the
//! channel; callers talk to it through [`TerminalInput`] and read output from
//! a broadcast channel.

use std::sync::{Arc, Weak};

use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use super::{command_line, PendingUse};
use crate::session::{Session, TerminalEntry, TerminalKind};
use crate::ssh::{ConnectionRegistry, SshError};

const TERM: &str = "xterm-256color";
const INPUT_CAPACITY: usize = 1024;
const OUTPUT_CAPACITY: usize = 1024;

#[derive(Debug)]
pub enum TerminalInput {
    Data(Vec<u8>),
    Resize(TerminalSize),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u32,
    pub rows: u32,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

pub struct RemoteTerminal {
    id: String,
    session: Arc<Session>,
    input: mpsc::Sender<TerminalInput>,
    output: broadcast::Sender<Vec<u8>>,
    exit: watch::Receiver<Option<u32>>,
}

impl RemoteTerminal {
    pub async fn open(
        registry: &Arc<ConnectionRegistry>,
        name: &str,
        command: Option<&str>,
        size: TerminalSize,
    ) -> Result<Self, SshError> {
        let session = registry.get_or_create(name, None).await?;
        Self::attach(registry, session, command, size).await
    }

    pub async fn attach(
        registry: &Arc<ConnectionRegistry>,
        session: Arc<Session>,
        command: Option<&str>,
        size: TerminalSize,
    ) -> Result<Self, SshError> {
        let pending = PendingUse::acquire(registry, &session);

        let line = command_line(&session, command);
        let channel = match start_pty(&session, &line, size).await {
            Ok(channel) => channel,
            Err(e) => {
                drop(pending);
                warn!("Terminal on '{}' failed: {}", session.name(), e);
                // No grace ticks here, see the consumer protocol notes
                registry.close_if_unused(&session).await;
                return Err(e);
            }
        };

        let entry = TerminalEntry::new(TerminalKind::Interactive, command.map(String::from));
        let id = entry.id.clone();
        pending.register(|usage| usage.terminals.push(entry));
        info!("Terminal {} started on '{}'", id, session.name());

        let (input_tx, input_rx) = mpsc::channel(INPUT_CAPACITY);
        let (output_tx, _) = broadcast::channel(OUTPUT_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(pump(
            channel,
            input_rx,
            output_tx.clone(),
            exit_tx,
            Teardown {
                registry: Arc::downgrade(registry),
                session: session.clone(),
                id: id.clone(),
            },
        ));

        Ok(Self {
            id,
            session,
            input: input_tx,
            output: output_tx,
            exit: exit_rx,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.output.subscribe()
    }

    pub async fn write(&self, data: impl Into<Vec<u8>>) -> Result<(), SshError> {
        self.send(TerminalInput::Data(data.into())).await
    }

    pub async fn resize(&self, size: TerminalSize) -> Result<(), SshError> {
        self.send(TerminalInput::Resize(size)).await
    }

    /// Exit status once the remote side has exited
    pub fn exit_status(&self) -> Option<u32> {
        *self.exit.borrow()
    }

    /// Wait until the channel has ended
    pub async fn wait(&mut self) -> Option<u32> {
        // Sender dropped means the pump finished
        let _ = self.exit.wait_for(Option::is_some).await;
        *self.exit.borrow()
    }

    pub async fn close(&self) {
        let _ = self.input.send(TerminalInput::Close).await;
    }

    async fn send(&self, input: TerminalInput) -> Result<(), SshError> {
        self.input
            .send(input)
            .await
            .map_err(|_| SshError::Channel(format!("terminal {} has ended", self.id)))
    }
}

impl Drop for RemoteTerminal {
    fn drop(&mut self) {
        let _ = self.input.try_send(TerminalInput::Close);
    }
}

async fn start_pty(
    session: &Session,
    line: &str,
    size: TerminalSize,
) -> Result<Channel<Msg>, SshError> {
    let channel = session.controller().open_session_channel().await?;
    channel
        .request_pty(false, TERM, size.cols, size.rows, 0, 0, &[])
        .await
        .map_err(|e| SshError::Channel(format!("PTY request failed: {}", e)))?;
    channel
        .exec(true, line)
        .await
        .map_err(|e| SshError::Channel(format!("exec failed: {}", e)))?;
    Ok(channel)
}

/// Unregisters the terminal when the pump ends
struct Teardown {
    registry: Weak<ConnectionRegistry>,
    session: Arc<Session>,
    id: String,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        let id = &self.id;
        match self.registry.upgrade() {
            Some(registry) => {
                registry.update(&self.session, |usage| usage.terminals.retain(|t| &t.id != id));
            }
            None => self.session.usage.lock().terminals.retain(|t| &t.id != id),
        }
        debug!("Terminal {} unregistered from '{}'", id, self.session.name());
    }
}

async fn pump(
    mut channel: Channel<Msg>,
    mut input: mpsc::Receiver<TerminalInput>,
    output: broadcast::Sender<Vec<u8>>,
    exit: watch::Sender<Option<u32>>,
    teardown: Teardown,
) {
    let id = teardown.id.clone();
    let mut status = None;

    loop {
        tokio::select! {
            Some(cmd) = input.recv() => match cmd {
                TerminalInput::Data(data) => {
                    if let Err(e) = channel.data(&data[..]).await {
                        error!("Terminal {} write failed: {}", id, e);
                        break;
                    }
                }
                TerminalInput::Resize(size) => {
                    if let Err(e) = channel.window_change(size.cols, size.rows, 0, 0).await {
                        warn!("Terminal {} resize failed: {}", id, e);
                    }
                }
                TerminalInput::Close => {
                    let _ = channel.eof().await;
                    let _ = channel.close().await;
                    break;
                }
            },

            Some(msg) = channel.wait() => match msg {
                ChannelMsg::Data { data } => {
                    let _ = output.send(data.to_vec());
                }
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    let _ = output.send(data.to_vec());
                }
                ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    debug!("Terminal {} killed by {:?}", id, signal_name);
                }
                ChannelMsg::Close => break,
                _ => {}
            },

            else => break,
        }
    }

    info!("Terminal {} ended (status {:?})", id, status);
    // Waiters see Some even when the remote never sent a status
    let _ = exit.send(Some(status.unwrap_or(u32::MAX)));
    drop(teardown);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RegistryConfig, StaticResolver, TargetDescriptor};
    use crate::ssh::testing::MockConnector;

    #[tokio::test]
    async fn test_failed_terminal_releases_and_reaps() {
        let registry = ConnectionRegistry::new(
            RegistryConfig::default(),
            Arc::new(StaticResolver::new(vec![TargetDescriptor::new("prod", "10.0.0.1")])),
            MockConnector::bash("/home/deploy"),
            None,
        );
        let mut removed = registry.events().removed.subscribe();

        let result = RemoteTerminal::open(&registry, "prod", None, TerminalSize::default()).await;
        assert!(matches!(result, Err(SshError::Disconnected)));

        let event = removed.recv().await.unwrap();
        assert!(event.session.usage().terminals.is_empty());
        assert_eq!(event.session.pending_user_count(), 0);
    }

    #[tokio::test]
    async fn test_teardown_unregisters() {
        let registry = ConnectionRegistry::new(
            RegistryConfig::default(),
            Arc::new(StaticResolver::new(vec![TargetDescriptor::new("prod", "10.0.0.1")])),
            MockConnector::bash("/home/deploy"),
            None,
        );
        let session = registry.get_or_create("prod", None).await.unwrap();
        let entry = TerminalEntry::new(TerminalKind::Interactive, None);
        let id = entry.id.clone();
        registry.update(&session, |u| u.terminals.push(entry));

        drop(Teardown {
            registry: Arc::downgrade(&registry),
            session: session.clone(),
            id,
        });
        assert!(session.usage().terminals.is_empty());
    }
}
