//! One-shot remote commands
//!
//! Runs a command to completion in the session root with the session
//! environment. The command counts as a terminal while it runs.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{command_line, PendingUse};
use crate::session::{Session, TerminalEntry, TerminalKind};
use crate::ssh::{ConnectionRegistry, ExecOutput, SshError};

pub struct RemoteTask;

impl RemoteTask {
    pub async fn run(
        registry: &Arc<ConnectionRegistry>,
        name: &str,
        command: &str,
    ) -> Result<ExecOutput, SshError> {
        let session = registry.get_or_create(name, None).await?;
        Self::run_on(registry, &session, command).await
    }

    pub async fn run_on(
        registry: &Arc<ConnectionRegistry>,
        session: &Arc<Session>,
        command: &str,
    ) -> Result<ExecOutput, SshError> {
        let entry = TerminalEntry::new(TerminalKind::Task, Some(command.to_string()));
        let registration = Registration {
            registry: registry.clone(),
            session: session.clone(),
            id: entry.id.clone(),
        };
        PendingUse::acquire(registry, session).register(|usage| usage.terminals.push(entry));

        info!("Running task on '{}': {}", session.name(), command);
        let result = session
            .controller()
            .exec(&command_line(session, Some(command)))
            .await;

        drop(registration);
        match &result {
            Ok(output) if output.exit_status != Some(0) => {
                warn!("Task on '{}' exited with {:?}", session.name(), output.exit_status)
            }
            Err(e) => warn!("Task on '{}' failed: {}", session.name(), e),
            Ok(_) => {}
        }
        result
    }
}

/// Unregisters the task terminal, also when the caller stops polling
struct Registration {
    registry: Arc<ConnectionRegistry>,
    session: Arc<Session>,
    id: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let id = &self.id;
        self.registry
            .update(&self.session, |usage| usage.terminals.retain(|t| &t.id != id));
        debug!("Task {} unregistered from '{}'", id, self.session.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::{RegistryConfig, StaticResolver, TargetDescriptor};
    use crate::ssh::testing::{bash_reply, FakeTransport, MockConnector, Reply};

    fn registry(connector: Arc<MockConnector>) -> Arc<ConnectionRegistry> {
        ConnectionRegistry::new(
            RegistryConfig::default(),
            Arc::new(StaticResolver::new(vec![
                TargetDescriptor::new("prod", "10.0.0.1").with_root("~/app")
            ])),
            connector,
            None,
        )
    }

    #[tokio::test]
    async fn test_runs_in_root() {
        let connector = MockConnector::bash("/home/deploy");
        let registry = registry(connector.clone());

        let output = RemoteTask::run(&registry, "prod", "make test").await.unwrap();
        assert_eq!(output.exit_status, Some(0));

        let commands = connector.transport(0).commands();
        assert_eq!(
            commands.last().map(String::as_str),
            Some(r#"cd "/home/deploy/app"; make test"#)
        );
        let session = registry.find("prod").unwrap();
        assert!(session.usage().terminals.is_empty());
        assert_eq!(session.pending_user_count(), 0);
    }

    #[tokio::test]
    async fn test_failing_command_unregisters() {
        let registry = registry(MockConnector::bash("/home/deploy"));
        let session = registry.get_or_create("prod", None).await.unwrap();

        // Swap in a transport whose exec always fails
        let fake = FakeTransport::spawn(|_| Reply::Fail(SshError::Channel("refused".into())));
        let broken = crate::session::SessionParts {
            name: "broken".into(),
            requested: session.requested().clone(),
            actual: session.actual().clone(),
            controller: fake.controller(),
            home: None,
            root: "/".into(),
            shell: session.shell().clone(),
            environment: Vec::new(),
            cache: Default::default(),
            remote_command: None,
            hop: None,
        };
        let broken = Arc::new(Session::new(broken));

        let err = RemoteTask::run_on(&registry, &broken, "true").await.unwrap_err();
        assert_eq!(err, SshError::Channel("refused".into()));
        assert!(broken.usage().terminals.is_empty());
        assert_eq!(broken.pending_user_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_task_unregisters() {
        let registry = registry(MockConnector::with_responder(|command: &str| {
            if command.ends_with("sleep 100") {
                Reply::Hang
            } else {
                bash_reply("/home/deploy", command)
            }
        }));
        let session = registry.get_or_create("prod", None).await.unwrap();

        let running = tokio::time::timeout(
            Duration::from_secs(1),
            RemoteTask::run_on(&registry, &session, "sleep 100"),
        );
        assert!(running.await.is_err());
        assert!(session.usage().terminals.is_empty());
        assert_eq!(session.pending_user_count(), 0);

        // Nothing holds the session any more, so the reaper takes it
        tokio::time::sleep(Duration::from_secs(120)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!registry.is_active(&session));
    }
}
