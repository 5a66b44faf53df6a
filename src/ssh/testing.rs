//! In-process stand-in for an SSH transport.
//!
//! A task answers [`HandleCommand`]s the way the handle owner would, with
//! `exec` output produced by a scripted responder. Channel opens are refused
//! (the caller sees `Disconnected`) because a real `russh::Channel` needs a
//! real connection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::connection_registry::ConnectionRegistry;
use super::connector::{Connector, EstablishedTransport};
use super::handle_owner::{
    record_closure, ClosureSender, ExecOutput, HandleCommand, HandleController, PingResult,
    TransportClosure,
};
use super::SshError;
use crate::config::{ConnectionPlan, TargetDescriptor};

pub enum Reply {
    Output(ExecOutput),
    Fail(SshError),
    /// Never answer, like a command that is still running
    Hang,
}

impl Reply {
    pub fn stdout(stdout: impl Into<String>) -> Self {
        Reply::Output(ExecOutput::stdout(stdout))
    }
}

type Responder = Arc<dyn Fn(&str) -> Reply + Send + Sync>;

#[derive(Clone)]
pub struct FakeTransport {
    controller: HandleController,
    commands: Arc<Mutex<Vec<String>>>,
    closure_tx: ClosureSender,
}

impl FakeTransport {
    pub fn spawn<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Reply + Send + Sync + 'static,
    {
        let responder: Responder = Arc::new(responder);
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
        let (closure_tx, closure_rx) = watch::channel(None);
        let closure_tx: ClosureSender = Arc::new(closure_tx);
        let commands = Arc::new(Mutex::new(Vec::new()));

        let task_closure = closure_tx.clone();
        let task_commands = commands.clone();
        tokio::spawn(async move {
            let mut running = Vec::new();
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    HandleCommand::Exec { command, reply_tx } => {
                        task_commands.lock().push(command.clone());
                        let reply = match responder(&command) {
                            Reply::Output(out) => Ok(out),
                            Reply::Fail(e) => Err(e),
                            Reply::Hang => {
                                running.push(reply_tx);
                                continue;
                            }
                        };
                        let _ = reply_tx.send(reply);
                    }
                    HandleCommand::TcpipForward { port, reply_tx, .. } => {
                        let _ = reply_tx.send(Ok(if port == 0 { 40000 } else { port }));
                    }
                    HandleCommand::CancelTcpipForward { reply_tx, .. } => {
                        let _ = reply_tx.send(Ok(()));
                    }
                    HandleCommand::Ping { reply_tx } => {
                        let _ = reply_tx.send(PingResult::Ok);
                    }
                    HandleCommand::Disconnect => break,
                    // Dropping the reply sender reports Disconnected
                    HandleCommand::ChannelOpenSession { .. }
                    | HandleCommand::ChannelOpenDirectTcpip { .. }
                    | HandleCommand::ChannelOpenDirectStreamlocal { .. } => {}
                }
            }
            record_closure(&task_closure, TransportClosure::Requested);
        });

        Self {
            controller: HandleController::with_closure(cmd_tx, closure_rx),
            commands,
            closure_tx,
        }
    }

    /// Answers every probe like a bash host with the given home directory
    pub fn bash(home: &'static str) -> Self {
        Self::spawn(move |command: &str| bash_reply(home, command))
    }

    pub fn controller(&self) -> HandleController {
        self.controller.clone()
    }

    /// Every `exec` command received so far
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    /// Simulate the transport ending underneath the session
    pub fn close(&self, closure: TransportClosure) {
        record_closure(&self.closure_tx, closure);
    }
}

/// How a bash host with `home` answers `command`
pub fn bash_reply(home: &str, command: &str) -> Reply {
    if command.contains(":::SHELL:") {
        Reply::stdout(":::SHELL:/bin/bash:SHELL:::\n")
    } else if command.contains(":::HOME:") {
        Reply::stdout(format!(":::HOME:{}:HOME:::\n", home))
    } else {
        Reply::stdout("")
    }
}

/// Counts establishments and hands out fakes
pub struct MockConnector {
    responder: Responder,
    calls: AtomicUsize,
    fail_next: Mutex<Option<SshError>>,
    transports: Mutex<Vec<FakeTransport>>,
}

impl MockConnector {
    pub fn bash(home: &'static str) -> Arc<Self> {
        Self::with_responder(move |command: &str| bash_reply(home, command))
    }

    /// Every transport answers `exec` through `responder`
    pub fn with_responder<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&str) -> Reply + Send + Sync + 'static,
    {
        Arc::new(Self {
            responder: Arc::new(responder),
            calls: AtomicUsize::new(0),
            fail_next: Mutex::new(None),
            transports: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The next establishment fails with `error`
    pub fn fail_next(&self, error: SshError) {
        *self.fail_next.lock() = Some(error);
    }

    /// The `index`-th transport handed out
    pub fn transport(&self, index: usize) -> FakeTransport {
        self.transports.lock()[index].clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn establish(
        &self,
        target: &TargetDescriptor,
        _plan: &ConnectionPlan,
        _registry: &Arc<ConnectionRegistry>,
    ) -> Result<EstablishedTransport, SshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Suspend once, like a real handshake
        tokio::task::yield_now().await;

        if let Some(error) = self.fail_next.lock().take() {
            return Err(error);
        }
        let responder = self.responder.clone();
        let fake = FakeTransport::spawn(move |command: &str| responder(command));
        let controller = fake.controller();
        self.transports.lock().push(fake);
        Ok(EstablishedTransport {
            controller,
            actual: target.clone(),
            hop: None,
        })
    }
}
