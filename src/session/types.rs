//! Session record
//!
//! A `Session` is one live authenticated transport plus what was negotiated on
//! it. The negotiated fields are immutable; the consumer bookkeeping in
//! [`SessionUsage`] is owned by the registry and only changes through
//! [`ConnectionRegistry::update`](crate::ssh::ConnectionRegistry::update).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::warn;

use super::remote_command::RemoteCommandChannel;
use super::shell::ShellInfo;
use crate::config::{EnvironmentVariable, Flags, TargetDescriptor};
use crate::forwarding::ActiveForwarding;
use crate::ssh::connection_registry::HopLease;
use crate::ssh::HandleController;

/// Lifecycle of a filesystem handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FilesystemState {
    Open,
    Closing,
    Closed,
}

/// A filesystem handle attached to a session.
///
/// Clones share the same state cell, so the adapter can mark itself closing
/// and the reaper sees it on the next tick.
#[derive(Debug, Clone)]
pub struct FilesystemEntry {
    pub id: String,
    pub root: String,
    state: Arc<Mutex<FilesystemState>>,
}

impl FilesystemEntry {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            root: root.into(),
            state: Arc::new(Mutex::new(FilesystemState::Open)),
        }
    }

    pub fn state(&self) -> FilesystemState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: FilesystemState) {
        *self.state.lock() = state;
    }

    pub fn is_open(&self) -> bool {
        self.state() == FilesystemState::Open
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TerminalKind {
    Interactive,
    /// One-shot command run to completion
    Task,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalEntry {
    pub id: String,
    pub kind: TerminalKind,
    pub command: Option<String>,
}

impl TerminalEntry {
    pub fn new(kind: TerminalKind, command: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            command,
        }
    }
}

/// Consumer bookkeeping for one session
#[derive(Debug, Clone, Default)]
pub struct SessionUsage {
    /// Acquisitions in flight that have not registered themselves yet
    pub pending_user_count: usize,
    pub terminals: Vec<TerminalEntry>,
    pub filesystems: Vec<FilesystemEntry>,
    pub forwardings: Vec<ActiveForwarding>,
    /// Names of sessions tunnelled through this one
    pub tunnels: Vec<String>,
}

impl SessionUsage {
    pub fn add_pending(&mut self) {
        self.pending_user_count += 1;
    }

    /// Saturating; an underflow is a bookkeeping bug and is logged
    pub fn release_pending(&mut self) {
        if self.pending_user_count == 0 {
            warn!("pending_user_count underflow");
            return;
        }
        self.pending_user_count -= 1;
    }

    /// Drop filesystem handles that are closing or closed. Returns how many went.
    pub fn prune_filesystems(&mut self) -> usize {
        let before = self.filesystems.len();
        self.filesystems.retain(FilesystemEntry::is_open);
        before - self.filesystems.len()
    }

    /// Anything that keeps the session from being reaped
    pub fn has_consumers(&self) -> bool {
        !self.filesystems.is_empty()
            || !self.terminals.is_empty()
            || self.forwardings.iter().any(|f| !f.is_stopped())
            || !self.tunnels.is_empty()
    }
}

/// Counts for UI projection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub host: Option<String>,
    pub root: String,
    pub shell: String,
    pub created_at: String,
    pub pending_user_count: usize,
    pub terminals: usize,
    pub filesystems: usize,
    pub forwardings: usize,
    pub tunnels: usize,
}

/// Everything needed to build a session
pub(crate) struct SessionParts {
    pub name: String,
    pub requested: TargetDescriptor,
    pub actual: TargetDescriptor,
    pub controller: HandleController,
    pub home: Option<String>,
    pub root: String,
    pub shell: ShellInfo,
    pub environment: Vec<EnvironmentVariable>,
    pub cache: HashMap<String, String>,
    pub remote_command: Option<RemoteCommandChannel>,
    pub hop: Option<HopLease>,
}

pub struct Session {
    id: String,
    name: String,
    requested: TargetDescriptor,
    actual: TargetDescriptor,
    flags: Flags,
    controller: HandleController,
    home: Option<String>,
    root: String,
    shell: ShellInfo,
    environment: Vec<EnvironmentVariable>,
    created_at: DateTime<Utc>,

    pub(crate) usage: Mutex<SessionUsage>,
    cache: Mutex<HashMap<String, String>>,

    /// Idle reaper task, exactly one per active session
    pub(crate) reaper: Mutex<Option<JoinHandle<()>>>,
    pub(crate) monitor: Mutex<Option<JoinHandle<()>>>,
    pub(crate) remote_command: Mutex<Option<RemoteCommandChannel>>,
    pub(crate) hop: Mutex<Option<HopLease>>,
}

impl Session {
    pub(crate) fn new(parts: SessionParts) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            flags: parts.actual.parsed_flags(),
            name: parts.name,
            requested: parts.requested,
            actual: parts.actual,
            controller: parts.controller,
            home: parts.home,
            root: parts.root,
            shell: parts.shell,
            environment: parts.environment,
            created_at: Utc::now(),
            usage: Mutex::new(SessionUsage::default()),
            cache: Mutex::new(parts.cache),
            reaper: Mutex::new(None),
            monitor: Mutex::new(None),
            remote_command: Mutex::new(parts.remote_command),
            hop: Mutex::new(parts.hop),
        }
    }

    /// Unique per session instance (a reconnect gets a new one)
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The descriptor as it was before prompts were answered
    pub fn requested(&self) -> &TargetDescriptor {
        &self.requested
    }

    /// The resolved descriptor this session was created from
    pub fn actual(&self) -> &TargetDescriptor {
        &self.actual
    }

    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    /// Transport handle for opening additional channels
    pub fn controller(&self) -> &HandleController {
        &self.controller
    }

    pub fn home(&self) -> Option<&str> {
        self.home.as_deref()
    }

    /// Root path with the home sentinel resolved
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn shell(&self) -> &ShellInfo {
        &self.shell
    }

    pub fn environment(&self) -> &[EnvironmentVariable] {
        &self.environment
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Snapshot of the consumer bookkeeping
    pub fn usage(&self) -> SessionUsage {
        self.usage.lock().clone()
    }

    pub fn pending_user_count(&self) -> usize {
        self.usage.lock().pending_user_count
    }

    pub fn cached(&self, key: &str) -> Option<String> {
        self.cache.lock().get(key).cloned()
    }

    pub fn cache_insert(&self, key: impl Into<String>, value: impl Into<String>) {
        self.cache.lock().insert(key.into(), value.into());
    }

    /// The tty of the remote-command channel, when one is open
    pub fn remote_command_tty(&self) -> Option<String> {
        self.remote_command.lock().as_ref().map(|c| c.tty().to_string())
    }

    /// Name of the session this one tunnels through
    pub fn hop_name(&self) -> Option<String> {
        self.hop.lock().as_ref().map(|lease| lease.hop_name().to_string())
    }

    pub fn summary(&self) -> SessionSummary {
        let usage = self.usage.lock();
        SessionSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            host: self
                .actual
                .host
                .as_ref()
                .and_then(|h| h.value())
                .map(String::from),
            root: self.root.clone(),
            shell: self.shell.binary.clone(),
            created_at: self.created_at.to_rfc3339(),
            pending_user_count: usage.pending_user_count,
            terminals: usage.terminals.len(),
            filesystems: usage.filesystems.len(),
            forwardings: usage.forwardings.len(),
            tunnels: usage.tunnels.len(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("root", &self.root)
            .field("shell", &self.shell)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prune_drops_closing_and_closed() {
        let mut usage = SessionUsage::default();
        let open = FilesystemEntry::new("/a");
        let closing = FilesystemEntry::new("/b");
        let closed = FilesystemEntry::new("/c");
        usage.filesystems = vec![open.clone(), closing.clone(), closed.clone()];

        // State is shared with the adapter's copy
        closing.set_state(FilesystemState::Closing);
        closed.set_state(FilesystemState::Closed);

        assert_eq!(usage.prune_filesystems(), 2);
        assert_eq!(usage.filesystems.len(), 1);
        assert_eq!(usage.filesystems[0].id, open.id);
        assert!(usage.has_consumers());
    }

    #[test]
    fn test_release_pending_saturates() {
        let mut usage = SessionUsage::default();
        usage.release_pending();
        assert_eq!(usage.pending_user_count, 0);
        usage.add_pending();
        usage.add_pending();
        usage.release_pending();
        assert_eq!(usage.pending_user_count, 1);
    }

    #[test]
    fn test_tunnels_keep_session_in_use() {
        let mut usage = SessionUsage::default();
        assert!(!usage.has_consumers());
        usage.tunnels.push("inner".into());
        assert!(usage.has_consumers());
    }
}
