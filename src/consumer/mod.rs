//! Consumer adapters
//!
//! Everything that attaches to a session follows the same protocol:
//!
//! 1. `get_or_create` the session
//! 2. take a [`PendingUse`] before any further async setup
//! 3. on success register in the session's lists, then release the pending use
//! 4. on failure only release the pending use (and close the session if
//!    nothing else uses it). This close is immediate, without the reaper's
//!    grace ticks: a caller holding the session from `get_or_create` that has
//!    not taken its own pending use yet finds the transport gone and has to
//!    call `get_or_create` again
//! 5. on close unregister; session teardown belongs to the reaper
//!
//! The pending use is a guard, so step 4 also happens on `?` and on panic.

mod filesystem;
mod task;
mod terminal;

use std::sync::Arc;

pub use filesystem::RemoteFilesystem;
pub use task::RemoteTask;
pub use terminal::{RemoteTerminal, TerminalInput, TerminalSize};

use crate::session::{Session, SessionUsage};
use crate::ssh::ConnectionRegistry;

/// One in-flight acquisition of a session.
///
/// Counts in `pending_user_count` from creation until drop, exactly once.
pub struct PendingUse {
    registry: Arc<ConnectionRegistry>,
    session: Arc<Session>,
}

impl PendingUse {
    pub fn acquire(registry: &Arc<ConnectionRegistry>, session: &Arc<Session>) -> Self {
        registry.update(session, SessionUsage::add_pending);
        Self {
            registry: registry.clone(),
            session: session.clone(),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Register the consumer, then release the pending use
    pub fn register<F>(self, register: F)
    where
        F: FnOnce(&mut SessionUsage),
    {
        self.registry.update(&self.session, register);
    }
}

impl Drop for PendingUse {
    fn drop(&mut self) {
        self.registry
            .update(&self.session, SessionUsage::release_pending);
    }
}

/// Shell line that sets the session environment, enters the root and runs
/// `command` (or the login shell).
pub(crate) fn command_line(session: &Session, command: Option<&str>) -> String {
    let profile = session.shell().profile;
    let mut parts: Vec<String> = session
        .environment()
        .iter()
        .map(|var| profile.set_env(&var.key, &var.value))
        .collect();
    parts.push(profile.change_directory(session.root()));
    parts.push(command.unwrap_or(profile.login_shell()).to_string());
    profile.join(&parts)
}
