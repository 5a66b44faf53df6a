//! Connection Registry
//!
//! Owns every live and in-flight session. One logical name has at most one
//! establishment in flight; concurrent callers share its result.
//!
//! # State machine (per logical name)
//!
//! ```text
//! Absent ──get_or_create──▶ Pending ──ok──▶ Active ──close──▶ Closing ──▶ Absent
//!                              │                                 ▲
//!                              └──────────── err ────────────────┘ (nothing cached)
//! ```
//!
//! # Invariants
//! - All registry state sits behind one mutex that is never held across `.await`
//! - Every mutation of the active set or of a session's consumers goes through
//!   `get_or_create`, `update` or `close_connection`, each paired with its event
//! - Events are emitted after the transition completed
//! - Exactly one reaper task and one transport monitor per Active session,
//!   spawned on entry and aborted on exit
//! - `close_connection` is idempotent

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::auth::Prompter;
use super::connector::{Connector, ConnectorOptions, SshConnector};
use super::error::SshError;
use super::events::{PendingEntry, RegistryEvents, SessionRemoved};
use super::handle_owner::{PingResult, TransportClosure};
use super::reaper::{IdleReaper, Occupancy, ReaperState};
use crate::config::descriptor::name_key;
use crate::config::{ConfigResolver, ConnectionPlan, RegistryConfig, TargetDescriptor};
use crate::session::negotiator::{negotiate, NegotiationOptions};
use crate::session::remote_command::RemoteCommandHandler;
use crate::session::{
    ClosureAdvice, CreationFailure, RemovalReason, Session, SessionParts, SessionSummary,
    SessionUsage,
};

/// Consecutive keepalive timeouts before the transport counts as lost
const MAX_MISSED_KEEPALIVES: u32 = 3;
/// Longest hop chain followed when checking for cycles
const MAX_HOP_DEPTH: usize = 16;

type CreationResult = Result<Arc<Session>, SshError>;
type SharedCreation = Shared<BoxFuture<'static, CreationResult>>;

struct PendingCreation {
    name: String,
    requested: Option<TargetDescriptor>,
    result: SharedCreation,
}

#[derive(Default)]
struct RegistryState {
    active: Vec<Arc<Session>>,
    /// Keyed by case-insensitive name
    pending: HashMap<String, PendingCreation>,
}

impl RegistryState {
    /// Structural match when a descriptor is given, else the newest session
    /// with that name.
    fn find_active(&self, name: &str, descriptor: Option<&TargetDescriptor>) -> Option<Arc<Session>> {
        match descriptor {
            Some(wanted) => self
                .active
                .iter()
                .find(|s| s.requested().same_target(wanted) || s.actual().same_target(wanted))
                .cloned(),
            None => {
                let key = name_key(name);
                self.active
                    .iter()
                    .rev()
                    .find(|s| name_key(s.name()) == key)
                    .cloned()
            }
        }
    }

    fn pending_entries(&self) -> Vec<PendingEntry> {
        let mut entries: Vec<PendingEntry> = self
            .pending
            .values()
            .map(|p| PendingEntry {
                name: p.name.clone(),
                requested: p.requested.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }
}

/// Registry-wide counts
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub active: usize,
    pub pending: usize,
    pub sessions: Vec<SessionSummary>,
}

pub struct ConnectionRegistry {
    config: RegistryConfig,
    resolver: Arc<dyn ConfigResolver>,
    connector: Arc<dyn Connector>,
    negotiation: NegotiationOptions,
    state: Mutex<RegistryState>,
    events: RegistryEvents,
    self_ref: Weak<ConnectionRegistry>,
}

impl ConnectionRegistry {
    pub fn new(
        config: RegistryConfig,
        resolver: Arc<dyn ConfigResolver>,
        connector: Arc<dyn Connector>,
        remote_handler: Option<Arc<dyn RemoteCommandHandler>>,
    ) -> Arc<Self> {
        let negotiation = NegotiationOptions {
            base_environment: config.base_environment.clone(),
            tty_timeout: config.tty_discovery_timeout(),
            remote_handler,
        };
        Arc::new_cyclic(|self_ref| Self {
            config,
            resolver,
            connector,
            negotiation,
            state: Mutex::new(RegistryState::default()),
            events: RegistryEvents::default(),
            self_ref: self_ref.clone(),
        })
    }

    /// Registry over real SSH transports
    pub fn with_ssh(
        config: RegistryConfig,
        resolver: Arc<dyn ConfigResolver>,
        prompter: Arc<dyn Prompter>,
        remote_handler: Option<Arc<dyn RemoteCommandHandler>>,
    ) -> Arc<Self> {
        let connector = Arc::new(SshConnector::new(
            prompter,
            ConnectorOptions::from_config(&config),
        ));
        Self::new(config, resolver, connector, remote_handler)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn events(&self) -> &RegistryEvents {
        &self.events
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Creation
    // ═══════════════════════════════════════════════════════════════════════

    /// Return the active session for `name` (or for a structurally identical
    /// `descriptor`), join an in-flight creation, or start a new one.
    ///
    /// Returns without suspending when a matching session is already active.
    /// A failed creation is not cached; the next call starts over.
    pub async fn get_or_create(
        &self,
        name: &str,
        descriptor: Option<TargetDescriptor>,
    ) -> Result<Arc<Session>, SshError> {
        if let Some(creation) = self.lookup(name, descriptor.as_ref()) {
            return creation.await;
        }

        let target = match descriptor.clone() {
            Some(d) => d,
            None => self.resolver.resolve(name).ok_or_else(|| {
                SshError::Configuration(format!("unknown target '{}'", name))
            })?,
        };
        let plan = target.validate()?;
        self.check_hop_chain(&target)?;

        let creation = self.begin_creation(name, descriptor, target, plan)?;
        creation.await
    }

    /// [`get_or_create`](Self::get_or_create) with recovery advice attached
    pub async fn connect(
        &self,
        name: &str,
        descriptor: Option<TargetDescriptor>,
    ) -> Result<Arc<Session>, CreationFailure> {
        self.get_or_create(name, descriptor)
            .await
            .map_err(|e| CreationFailure::new(name, e))
    }

    /// Fast path: an active session as a ready future, or the pending creation
    fn lookup(
        &self,
        name: &str,
        descriptor: Option<&TargetDescriptor>,
    ) -> Option<BoxFuture<'static, CreationResult>> {
        let state = self.state.lock();
        if let Some(session) = state.find_active(name, descriptor) {
            debug!("Reusing active session '{}'", session.name());
            return Some(futures_util::future::ready(Ok(session)).boxed());
        }
        let pending = state.pending.get(&name_key(name))?;
        debug!("Joining pending creation of '{}'", pending.name);
        Some(pending.result.clone().boxed())
    }

    fn begin_creation(
        &self,
        name: &str,
        requested: Option<TargetDescriptor>,
        target: TargetDescriptor,
        plan: ConnectionPlan,
    ) -> Result<SharedCreation, SshError> {
        let registry = self.arc()?;
        let key = name_key(name);

        let mut state = self.state.lock();
        // Someone may have started (or finished) while we resolved
        if let Some(session) = state.find_active(name, requested.as_ref()) {
            return Ok(futures_util::future::ready(Ok(session)).boxed().shared());
        }
        if let Some(pending) = state.pending.get(&key) {
            return Ok(pending.result.clone());
        }

        info!("Creating session '{}'", name);
        let task_name = name.to_string();
        let task: JoinHandle<CreationResult> =
            tokio::spawn(async move { registry.create(task_name, target, plan).await });
        let result = async move {
            task.await.unwrap_or_else(|e| {
                Err(SshError::Cancelled(format!("session creation aborted: {}", e)))
            })
        }
        .boxed()
        .shared();

        state.pending.insert(
            key,
            PendingCreation {
                name: name.to_string(),
                requested,
                result: result.clone(),
            },
        );
        let entries = state.pending_entries();
        drop(state);

        self.events.pending_changed.emit(entries);
        Ok(result)
    }

    /// Establish, negotiate and settle one creation
    async fn create(
        self: Arc<Self>,
        name: String,
        target: TargetDescriptor,
        plan: ConnectionPlan,
    ) -> CreationResult {
        let outcome = self.establish_session(&name, &target, &plan).await;

        let mut state = self.state.lock();
        state.pending.remove(&name_key(&name));
        match outcome {
            Ok(session) => {
                state.active.push(session.clone());
                *session.reaper.lock() = Some(self.spawn_reaper(&session));
                *session.monitor.lock() = Some(self.spawn_monitor(&session));
                let entries = state.pending_entries();
                drop(state);

                info!("Session '{}' active (root {})", name, session.root());
                self.events.added.emit(session.clone());
                self.events.pending_changed.emit(entries);
                Ok(session)
            }
            Err(e) => {
                let entries = state.pending_entries();
                drop(state);

                error!("Session '{}' failed: {}", name, e);
                self.events.pending_changed.emit(entries);
                Err(e)
            }
        }
    }

    async fn establish_session(
        self: &Arc<Self>,
        name: &str,
        target: &TargetDescriptor,
        plan: &ConnectionPlan,
    ) -> CreationResult {
        let transport = self.connector.establish(target, plan, self).await?;

        let negotiated = match negotiate(&transport.controller, &transport.actual, &self.negotiation)
            .await
        {
            Ok(negotiated) => negotiated,
            Err(e) => {
                transport.controller.disconnect().await;
                return Err(e);
            }
        };

        Ok(Arc::new(Session::new(SessionParts {
            name: name.to_string(),
            requested: target.clone(),
            actual: transport.actual,
            controller: transport.controller,
            home: negotiated.home,
            root: negotiated.root,
            shell: negotiated.shell,
            environment: negotiated.environment,
            cache: negotiated.cache,
            remote_command: negotiated.remote_command,
            hop: transport.hop,
        })))
    }

    /// Reject hop chains that lead back to themselves before anything connects
    fn check_hop_chain(&self, target: &TargetDescriptor) -> Result<(), SshError> {
        let mut chain = vec![target.key()];
        let mut next = target.hop.clone();
        while let Some(hop) = next {
            let key = name_key(&hop);
            if chain.contains(&key) || chain.len() > MAX_HOP_DEPTH {
                return Err(SshError::Configuration(format!(
                    "hop chain of '{}' loops: {} -> {}",
                    target.name,
                    chain.join(" -> "),
                    hop
                )));
            }
            chain.push(key);
            next = self.resolver.resolve(&hop).and_then(|d| d.hop);
        }
        Ok(())
    }

    fn arc(&self) -> Result<Arc<Self>, SshError> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| SshError::Cancelled("registry is shutting down".into()))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════

    pub fn get_active(&self) -> Vec<Arc<Session>> {
        self.state.lock().active.clone()
    }

    pub fn get_pending(&self) -> Vec<PendingEntry> {
        self.state.lock().pending_entries()
    }

    /// Newest active session named `name`
    pub fn find(&self, name: &str) -> Option<Arc<Session>> {
        self.state.lock().find_active(name, None)
    }

    pub fn is_active(&self, session: &Arc<Session>) -> bool {
        self.state
            .lock()
            .active
            .iter()
            .any(|s| Arc::ptr_eq(s, session))
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.state.lock();
        RegistryStats {
            active: state.active.len(),
            pending: state.pending.len(),
            sessions: state.active.iter().map(|s| s.summary()).collect(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Mutation
    // ═══════════════════════════════════════════════════════════════════════

    /// Mutate a session's consumer bookkeeping and announce it.
    ///
    /// The mutation is applied even when the session has already left the
    /// registry (so releases still balance); the event is only sent for
    /// active sessions. Returns whether the session is active.
    pub fn update<F>(&self, session: &Arc<Session>, mutate: F) -> bool
    where
        F: FnOnce(&mut SessionUsage),
    {
        mutate(&mut session.usage.lock());
        let active = self.is_active(session);
        if active {
            self.events.updated.emit(session.clone());
        }
        active
    }

    /// Close `session`. Closing a session that is not active does nothing.
    ///
    /// `reason` is diagnostic only. Returns whether this call closed it.
    pub async fn close_connection(&self, session: &Arc<Session>, reason: Option<&str>) -> bool {
        self.close_with(session, RemovalReason::requested(reason)).await
    }

    /// Close `session` if nothing uses or is about to use it
    pub async fn close_if_unused(&self, session: &Arc<Session>) -> bool {
        let unused = {
            let usage = session.usage.lock();
            usage.pending_user_count == 0 && !usage.has_consumers()
        };
        if !unused {
            return false;
        }
        self.close_with(session, RemovalReason::requested(Some("no remaining consumers")))
            .await
    }

    /// Close every active session. Pending creations settle on their own.
    pub async fn close_all(&self) {
        let sessions = self.get_active();
        info!("Closing {} session(s)", sessions.len());
        for session in sessions {
            self.close_with(&session, RemovalReason::Shutdown).await;
        }
    }

    pub(crate) async fn close_with(&self, session: &Arc<Session>, reason: RemovalReason) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let before = state.active.len();
            state.active.retain(|s| !Arc::ptr_eq(s, session));
            before != state.active.len()
        };
        if !removed {
            debug!("Session '{}' already closed", session.name());
            return false;
        }

        if let Some(reaper) = session.reaper.lock().take() {
            reaper.abort();
        }
        if let Some(monitor) = session.monitor.lock().take() {
            monitor.abort();
        }
        info!("Closing session '{}' ({})", session.name(), reason);
        self.events.removed.emit(SessionRemoved {
            session: session.clone(),
            reason,
        });

        // Forwards first, then the marker channel, then the transport
        let forwardings = std::mem::take(&mut session.usage.lock().forwardings);
        for forwarding in &forwardings {
            forwarding.stop();
        }
        for fs in &session.usage.lock().filesystems {
            fs.set_state(crate::session::FilesystemState::Closed);
        }
        if let Some(channel) = session.remote_command.lock().take() {
            channel.close();
        }
        session.controller().disconnect().await;

        // Releases the tunnel on the hop session last
        let hop = session.hop.lock().take();
        drop(hop);
        true
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Background tasks
    // ═══════════════════════════════════════════════════════════════════════

    /// Idle reaper: one tick per interval, closes on the second empty tick
    fn spawn_reaper(self: &Arc<Self>, session: &Arc<Session>) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let weak_session = Arc::downgrade(session);
        let period = self.config.reaper_interval();

        tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut reaper = IdleReaper::new();

            loop {
                ticks.tick().await;
                let (Some(registry), Some(session)) = (registry.upgrade(), weak_session.upgrade())
                else {
                    break;
                };

                let occupancy = {
                    let mut usage = session.usage.lock();
                    if usage.pending_user_count == 0 {
                        let pruned = usage.prune_filesystems();
                        if pruned > 0 {
                            debug!("Pruned {} closed filesystem(s) from '{}'", pruned, session.name());
                        }
                    }
                    Occupancy {
                        pending_user_count: usage.pending_user_count,
                        has_consumers: usage.has_consumers(),
                    }
                };

                match reaper.tick(occupancy) {
                    ReaperState::Active => {}
                    ReaperState::GracePeriod => {
                        debug!("Session '{}' idle, closing on next tick", session.name())
                    }
                    ReaperState::Closing => {
                        info!("Reaping idle session '{}'", session.name());
                        // Separate task: closing aborts this one
                        tokio::spawn(async move {
                            registry.close_with(&session, RemovalReason::Idle).await;
                        });
                        break;
                    }
                }
            }
        })
    }

    /// Watches for the transport ending without us asking, with keepalives
    fn spawn_monitor(self: &Arc<Self>, session: &Arc<Session>) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let weak_session = Arc::downgrade(session);
        let controller = session.controller().clone();
        let mut closure = controller.closure();
        let period = self.config.keepalive_interval();

        tokio::spawn(async move {
            let mut keepalive = interval_at(Instant::now() + period, period);
            keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut missed = 0u32;

            let error: Option<String> = loop {
                tokio::select! {
                    changed = closure.changed() => {
                        // Nobody can report a closure anymore
                        if changed.is_err() {
                            return;
                        }
                        let current = closure.borrow_and_update().clone();
                        match current {
                            None => continue,
                            Some(TransportClosure::Requested) => return,
                            Some(TransportClosure::Clean) => break None,
                            Some(TransportClosure::Error(e)) => break Some(e),
                        }
                    }
                    _ = keepalive.tick() => match controller.ping().await {
                        PingResult::Ok => missed = 0,
                        PingResult::Timeout => {
                            missed += 1;
                            if missed >= MAX_MISSED_KEEPALIVES {
                                break Some(format!("{} keepalives unanswered", missed));
                            }
                        }
                        PingResult::IoError => break Some("keepalive failed".to_string()),
                    },
                }
            };

            let (Some(registry), Some(session)) = (registry.upgrade(), weak_session.upgrade())
            else {
                return;
            };
            let reason = RemovalReason::transport_lost(error);
            warn!("Transport of '{}' lost ({})", session.name(), reason);
            let reconnect = matches!(
                reason,
                RemovalReason::TransportLost {
                    advice: ClosureAdvice::Reconnect,
                    ..
                }
            ) && registry.config.auto_reconnect;

            tokio::spawn(async move {
                if !registry.close_with(&session, reason).await || !reconnect {
                    return;
                }
                info!("Reconnecting '{}'", session.name());
                if let Err(e) = registry
                    .get_or_create(session.name(), Some(session.requested().clone()))
                    .await
                {
                    error!("Reconnect of '{}' failed: {}", session.name(), e);
                }
            });
        })
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConnectionRegistry")
            .field("active", &state.active.len())
            .field("pending", &state.pending.len())
            .finish_non_exhaustive()
    }
}

/// A tunnel carried by a hop session.
///
/// While alive the hop lists the child in its `tunnels`, which keeps the
/// reaper away. Dropping the lease removes the entry.
pub struct HopLease {
    registry: Weak<ConnectionRegistry>,
    hop: Arc<Session>,
    child: String,
}

impl HopLease {
    pub(crate) fn acquire(registry: &Arc<ConnectionRegistry>, hop: &Arc<Session>, child: &str) -> Self {
        let child = child.to_string();
        registry.update(hop, |usage| usage.tunnels.push(child.clone()));
        Self {
            registry: Arc::downgrade(registry),
            hop: hop.clone(),
            child,
        }
    }

    pub fn hop_name(&self) -> &str {
        self.hop.name()
    }
}

impl Drop for HopLease {
    fn drop(&mut self) {
        let child = &self.child;
        let release = |usage: &mut SessionUsage| {
            if let Some(pos) = usage.tunnels.iter().position(|t| t == child) {
                usage.tunnels.remove(pos);
            }
        };
        match self.registry.upgrade() {
            Some(registry) => {
                registry.update(&self.hop, release);
            }
            None => release(&mut self.hop.usage.lock()),
        }
    }
}

impl fmt::Debug for HopLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HopLease")
            .field("hop", &self.hop.name())
            .field("child", &self.child)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxySpec, StaticResolver};
    use crate::session::{ShellProfile, TerminalEntry, TerminalKind};
    use crate::ssh::testing::MockConnector;
    use std::time::Duration;

    fn prod() -> TargetDescriptor {
        TargetDescriptor::new("prod", "10.0.0.1").with_root("~/app")
    }

    fn registry_with(
        targets: Vec<TargetDescriptor>,
        connector: Arc<MockConnector>,
    ) -> Arc<ConnectionRegistry> {
        ConnectionRegistry::new(
            RegistryConfig::default(),
            Arc::new(StaticResolver::new(targets)),
            connector,
            None,
        )
    }

    #[tokio::test]
    async fn test_prod_scenario() {
        let connector = MockConnector::bash("/home/deploy");
        let registry = registry_with(vec![prod()], connector.clone());
        let mut added = registry.events().added.subscribe();

        let session = registry.get_or_create("prod", None).await.unwrap();
        assert_eq!(session.root(), "/home/deploy/app");
        assert_eq!(session.shell().binary, "bash");
        assert_eq!(session.shell().profile, ShellProfile::Posix);
        assert_eq!(session.shell().profile.set_env("A", "1"), r#"export A="1""#);
        assert_eq!(
            session.shell().profile.embed_substitution("pwd").as_deref(),
            Some("`pwd`")
        );
        assert!(Arc::ptr_eq(&added.recv().await.unwrap(), &session));

        // Second call completes on its first poll
        let again = registry
            .get_or_create("prod", None)
            .now_or_never()
            .expect("active session is returned without suspending")
            .unwrap();
        assert!(Arc::ptr_eq(&session, &again));
        assert_eq!(connector.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_creation_is_coalesced() {
        let connector = MockConnector::bash("/home/deploy");
        let registry = registry_with(vec![prod()], connector.clone());

        let calls = (0..8).map(|_| registry.get_or_create("PROD", None));
        let sessions = futures_util::future::join_all(calls).await;

        assert_eq!(connector.calls(), 1);
        let first = sessions[0].as_ref().unwrap();
        for session in &sessions {
            assert!(Arc::ptr_eq(first, session.as_ref().unwrap()));
        }
        assert!(registry.get_pending().is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_not_cached() {
        let connector = MockConnector::bash("/home/deploy");
        connector.fail_next(SshError::ConnectionRefused("10.0.0.1:22".into()));
        let registry = registry_with(vec![prod()], connector.clone());

        let (a, b) = tokio::join!(
            registry.get_or_create("prod", None),
            registry.get_or_create("prod", None)
        );
        let (a, b) = (a.unwrap_err(), b.unwrap_err());
        assert!(matches!(a, SshError::ConnectionRefused(_)));
        assert_eq!(a, b);
        assert_eq!(connector.calls(), 1);
        assert!(registry.get_pending().is_empty());
        assert!(registry.get_active().is_empty());

        registry.get_or_create("prod", None).await.unwrap();
        assert_eq!(connector.calls(), 2);
    }

    #[tokio::test]
    async fn test_connect_returns_recovery_actions() {
        let connector = MockConnector::bash("/home/deploy");
        connector.fail_next(SshError::AuthenticationExhausted("tried: password".into()));
        let registry = registry_with(vec![prod()], connector);

        let failure = registry.connect("prod", None).await.unwrap_err();
        assert_eq!(failure.name, "prod");
        assert!(failure.can_retry());
    }

    #[tokio::test]
    async fn test_incomplete_proxy_fails_before_connecting() {
        let connector = MockConnector::bash("/home/deploy");
        let registry = registry_with(vec![], connector.clone());
        let target = prod().with_proxy(ProxySpec {
            kind: Some("socks5".into()),
            host: Some("proxy.local".into()),
            port: None,
        });

        let err = registry
            .get_or_create("prod", Some(target))
            .await
            .unwrap_err();
        assert!(matches!(err, SshError::Configuration(_)));
        assert_eq!(connector.calls(), 0);
        assert!(registry.get_pending().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let registry = registry_with(vec![], MockConnector::bash("/root"));
        let err = registry.get_or_create("nowhere", None).await.unwrap_err();
        assert!(matches!(err, SshError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_hop_cycle_rejected() {
        let a = TargetDescriptor::new("a", "10.0.0.1").with_hop("b");
        let b = TargetDescriptor::new("b", "10.0.0.2").with_hop("a");
        let connector = MockConnector::bash("/root");
        let registry = registry_with(vec![a, b], connector.clone());
        let err = registry.get_or_create("a", None).await.unwrap_err();
        assert!(matches!(err, SshError::Configuration(ref m) if m.contains("loops")));
        assert_eq!(connector.calls(), 0);
    }

    #[tokio::test]
    async fn test_structural_reuse() {
        let connector = MockConnector::bash("/home/deploy");
        let registry = registry_with(vec![], connector.clone());

        let from_config = registry.get_or_create("prod", Some(prod())).await.unwrap();
        let identical = registry.get_or_create("prod", Some(prod())).await.unwrap();
        assert!(Arc::ptr_eq(&from_config, &identical));
        assert_eq!(connector.calls(), 1);

        let different = prod().with_env("LANG", "C");
        let other = registry.get_or_create("prod-c", Some(different)).await.unwrap();
        assert!(!Arc::ptr_eq(&from_config, &other));
        assert_eq!(connector.calls(), 2);
        assert_eq!(registry.get_active().len(), 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let connector = MockConnector::bash("/home/deploy");
        let registry = registry_with(vec![prod()], connector);
        let mut removed = registry.events().removed.subscribe();

        let session = registry.get_or_create("prod", None).await.unwrap();
        assert!(registry.close_connection(&session, Some("user")).await);
        assert!(!registry.close_connection(&session, Some("user")).await);

        let event = removed.recv().await.unwrap();
        assert!(Arc::ptr_eq(&event.session, &session));
        assert_eq!(event.reason, RemovalReason::requested(Some("user")));
        assert!(matches!(
            removed.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
        assert!(registry.get_active().is_empty());
        assert!(session.reaper.lock().is_none());
        assert!(registry.find("prod").is_none());
    }

    #[tokio::test]
    async fn test_update_emits_only_for_active() {
        let registry = registry_with(vec![prod()], MockConnector::bash("/home/deploy"));
        let session = registry.get_or_create("prod", None).await.unwrap();
        let mut updated = registry.events().updated.subscribe();

        assert!(registry.update(&session, |u| u.add_pending()));
        assert_eq!(session.pending_user_count(), 1);
        assert!(updated.recv().await.is_ok());

        registry.close_connection(&session, None).await;
        assert!(!registry.update(&session, |u| u.release_pending()));
        assert_eq!(session.pending_user_count(), 0);
        assert!(updated.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_needs_two_empty_ticks() {
        let registry = registry_with(vec![prod()], MockConnector::bash("/home/deploy"));
        let mut removed = registry.events().removed.subscribe();
        let started = Instant::now();
        let session = registry.get_or_create("prod", None).await.unwrap();

        // First tick (5s) only starts the grace period
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(registry.is_active(&session));

        let event = tokio::time::timeout(Duration::from_secs(60), removed.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.reason, RemovalReason::Idle);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(15), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_between_ticks_rescues_session() {
        let registry = registry_with(vec![prod()], MockConnector::bash("/home/deploy"));
        let mut removed = registry.events().removed.subscribe();
        let started = Instant::now();
        let session = registry.get_or_create("prod", None).await.unwrap();

        // After the first empty tick, a terminal attaches
        tokio::time::sleep(Duration::from_secs(7)).await;
        let terminal = TerminalEntry::new(TerminalKind::Interactive, None);
        let id = terminal.id.clone();
        registry.update(&session, |u| u.terminals.push(terminal));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(registry.is_active(&session));

        registry.update(&session, |u| u.terminals.retain(|t| t.id != id));
        let event = tokio::time::timeout(Duration::from_secs(60), removed.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.reason, RemovalReason::Idle);
        assert!(started.elapsed() >= Duration::from_secs(25));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_use_blocks_reaper() {
        let registry = registry_with(vec![prod()], MockConnector::bash("/home/deploy"));
        let session = registry.get_or_create("prod", None).await.unwrap();

        registry.update(&session, |u| u.add_pending());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(registry.is_active(&session));

        registry.update(&session, |u| u.release_pending());
        tokio::time::sleep(Duration::from_secs(11)).await;
        // The close runs in its own task
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!registry.is_active(&session));
    }

    #[tokio::test]
    async fn test_transport_error_triggers_reconnect() {
        let connector = MockConnector::bash("/home/deploy");
        let registry = registry_with(vec![prod()], connector.clone());
        let mut removed = registry.events().removed.subscribe();
        let mut added = registry.events().added.subscribe();

        let session = registry.get_or_create("prod", None).await.unwrap();
        added.recv().await.unwrap();
        connector
            .transport(0)
            .close(TransportClosure::Error("connection reset".into()));

        let event = removed.recv().await.unwrap();
        assert_eq!(
            event.reason,
            RemovalReason::TransportLost {
                error: Some("connection reset".into()),
                advice: ClosureAdvice::Reconnect
            }
        );
        let replacement = added.recv().await.unwrap();
        assert!(!Arc::ptr_eq(&replacement, &session));
        assert_eq!(connector.calls(), 2);
    }

    #[tokio::test]
    async fn test_clean_closure_prompts_user() {
        let connector = MockConnector::bash("/home/deploy");
        let registry = registry_with(vec![prod()], connector.clone());
        let mut removed = registry.events().removed.subscribe();

        registry.get_or_create("prod", None).await.unwrap();
        connector.transport(0).close(TransportClosure::Clean);

        let event = removed.recv().await.unwrap();
        assert_eq!(
            event.reason,
            RemovalReason::TransportLost {
                error: None,
                advice: ClosureAdvice::PromptUser
            }
        );
        tokio::task::yield_now().await;
        assert_eq!(connector.calls(), 1);
    }

    #[tokio::test]
    async fn test_hop_lease_keeps_hop_in_use() {
        let registry = registry_with(vec![prod()], MockConnector::bash("/home/deploy"));
        let hop = registry.get_or_create("prod", None).await.unwrap();

        let lease = HopLease::acquire(&registry, &hop, "inner");
        assert_eq!(lease.hop_name(), "prod");
        assert_eq!(hop.usage().tunnels, vec!["inner".to_string()]);
        assert!(!registry.close_if_unused(&hop).await);

        drop(lease);
        assert!(hop.usage().tunnels.is_empty());
        assert!(registry.close_if_unused(&hop).await);
    }

    #[tokio::test]
    async fn test_stats_and_close_all() {
        let registry = registry_with(
            vec![prod(), TargetDescriptor::new("db", "10.0.0.9").with_root("/")],
            MockConnector::bash("/home/deploy"),
        );
        registry.get_or_create("prod", None).await.unwrap();
        registry.get_or_create("db", None).await.unwrap();

        let stats = registry.stats();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.pending, 0);
        assert!(stats.sessions.iter().any(|s| s.name == "db" && s.root == "/"));

        registry.close_all().await;
        assert!(registry.get_active().is_empty());
    }
}
