//! Registry events
//!
//! One typed broadcast channel per kind of change. Payloads say *what*
//! changed; listeners that project the whole registry (tree views) should
//! still re-query [`ConnectionRegistry`](super::ConnectionRegistry) state
//! instead of diffing payloads.
//!
//! Events are sent after the state transition they describe has completed.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::TargetDescriptor;
use crate::session::{RemovalReason, Session};

/// Per-channel buffer. Slow listeners see `Lagged` and should re-query.
const EVENT_CAPACITY: usize = 64;

/// A single typed event channel
pub struct EventChannel<T: Clone> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> EventChannel<T> {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// No-op when nobody listens
    pub(crate) fn emit(&self, event: T) {
        let _ = self.tx.send(event);
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone> Default for EventChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct SessionRemoved {
    pub session: Arc<Session>,
    pub reason: RemovalReason,
}

/// A pending creation as shown to the UI ("connecting…")
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub name: String,
    /// The descriptor as requested, before resolution
    pub requested: Option<TargetDescriptor>,
}

/// The four registry channels
#[derive(Default)]
pub struct RegistryEvents {
    pub added: EventChannel<Arc<Session>>,
    pub removed: EventChannel<SessionRemoved>,
    pub updated: EventChannel<Arc<Session>>,
    /// Carries the full pending list after the change
    pub pending_changed: EventChannel<Vec<PendingEntry>>,
}
