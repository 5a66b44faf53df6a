//! Port Forwarding Manager
//!
//! Attaches forwards to sessions through the consumer protocol and keeps an
//! index by forwarding id. Forwards that stopped on their own (transport
//! closed, session torn down) are dropped from the index lazily.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use super::{ActiveForwarding, ForwardingSpec};
use crate::consumer::PendingUse;
use crate::session::Session;
use crate::ssh::{ConnectionRegistry, SshError};

struct Entry {
    session: Arc<Session>,
    forwarding: ActiveForwarding,
}

pub struct ForwardingManager {
    registry: Arc<ConnectionRegistry>,
    forwards: DashMap<String, Entry>,
}

impl ForwardingManager {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            forwards: DashMap::new(),
        }
    }

    /// Acquire the session named `name` and start `spec` on it
    pub async fn open(&self, name: &str, spec: ForwardingSpec) -> Result<ActiveForwarding, SshError> {
        let session = self.registry.get_or_create(name, None).await?;
        self.attach(session, spec).await
    }

    pub async fn attach(
        &self,
        session: Arc<Session>,
        spec: ForwardingSpec,
    ) -> Result<ActiveForwarding, SshError> {
        let pending = PendingUse::acquire(&self.registry, &session);

        let forwarding = match ActiveForwarding::start(&session, spec).await {
            Ok(forwarding) => forwarding,
            Err(e) => {
                drop(pending);
                warn!("[Forward] Forward on '{}' failed: {}", session.name(), e);
                // No grace ticks here, see the consumer protocol notes
                self.registry.close_if_unused(&session).await;
                return Err(e);
            }
        };

        let registered = forwarding.clone();
        pending.register(|usage| usage.forwardings.push(registered));
        info!(
            "[Forward] {} on '{}' bound to {}",
            forwarding.spec(),
            session.name(),
            forwarding.bound()
        );
        self.forwards.insert(
            forwarding.id().to_string(),
            Entry {
                session,
                forwarding: forwarding.clone(),
            },
        );
        Ok(forwarding)
    }

    /// Stop and unregister. Returns false for unknown ids.
    pub fn close(&self, id: &str) -> bool {
        let Some((_, entry)) = self.forwards.remove(id) else {
            return false;
        };
        entry.forwarding.stop();
        self.registry
            .update(&entry.session, |usage| usage.forwardings.retain(|f| f.id() != id));
        info!("[Forward] {} closed", entry.forwarding.spec());
        true
    }

    /// Running forwards
    pub fn list(&self) -> Vec<ActiveForwarding> {
        self.forwards.retain(|_, entry| !entry.forwarding.is_stopped());
        self.forwards
            .iter()
            .map(|entry| entry.forwarding.clone())
            .collect()
    }

    pub fn list_for(&self, session: &Session) -> Vec<ActiveForwarding> {
        self.list()
            .into_iter()
            .filter(|f| f.session_id() == session.id())
            .collect()
    }

    pub fn close_all(&self) {
        let ids: Vec<String> = self.forwards.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.close(&id);
        }
    }
}
