//! Remote filesystem handle
//!
//! Opens the SFTP subsystem on a session and registers a filesystem entry.
//! File operations themselves are left to the VFS layer, which uses
//! [`RemoteFilesystem::sftp`] directly.

use std::sync::Arc;

use russh_sftp::client::SftpSession;
use tracing::{debug, info, warn};

use super::PendingUse;
use crate::session::{FilesystemEntry, FilesystemState, Session};
use crate::ssh::{ConnectionRegistry, SshError};

pub struct RemoteFilesystem {
    registry: Arc<ConnectionRegistry>,
    session: Arc<Session>,
    entry: FilesystemEntry,
    sftp: SftpSession,
}

impl RemoteFilesystem {
    /// Acquire the session named `name` and open a filesystem on its root
    pub async fn open(registry: &Arc<ConnectionRegistry>, name: &str) -> Result<Self, SshError> {
        let session = registry.get_or_create(name, None).await?;
        Self::attach(registry, session).await
    }

    pub async fn attach(
        registry: &Arc<ConnectionRegistry>,
        session: Arc<Session>,
    ) -> Result<Self, SshError> {
        let pending = PendingUse::acquire(registry, &session);

        let sftp = match open_sftp(&session).await {
            Ok(sftp) => sftp,
            Err(e) => {
                drop(pending);
                warn!("Filesystem on '{}' failed: {}", session.name(), e);
                // No grace ticks here, see the consumer protocol notes
                registry.close_if_unused(&session).await;
                return Err(e);
            }
        };

        let entry = FilesystemEntry::new(session.root());
        let registered = entry.clone();
        pending.register(|usage| usage.filesystems.push(registered));
        info!("Filesystem {} opened on '{}' at {}", entry.id, session.name(), entry.root);

        Ok(Self {
            registry: registry.clone(),
            session,
            entry,
            sftp,
        })
    }

    pub fn id(&self) -> &str {
        &self.entry.id
    }

    pub fn root(&self) -> &str {
        &self.entry.root
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn sftp(&self) -> &SftpSession {
        &self.sftp
    }

    pub fn state(&self) -> FilesystemState {
        self.entry.state()
    }

    /// Close the SFTP channel and unregister. The session stays up for the reaper.
    pub async fn close(&self) {
        if !self.entry.is_open() {
            return;
        }
        self.entry.set_state(FilesystemState::Closing);
        if let Err(e) = self.sftp.close().await {
            debug!("SFTP close on '{}': {}", self.session.name(), e);
        }
        self.entry.set_state(FilesystemState::Closed);

        let id = self.entry.id.clone();
        self.registry
            .update(&self.session, |usage| usage.filesystems.retain(|f| f.id != id));
        info!("Filesystem {} closed", id);
    }
}

impl Drop for RemoteFilesystem {
    fn drop(&mut self) {
        // Not closed explicitly: the reaper prunes it on its next tick
        if self.entry.is_open() {
            self.entry.set_state(FilesystemState::Closing);
        }
    }
}

async fn open_sftp(session: &Session) -> Result<SftpSession, SshError> {
    let channel = session.controller().open_session_channel().await?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| SshError::Sftp(format!("failed to request SFTP subsystem: {}", e)))?;
    let sftp = SftpSession::new(channel.into_stream()).await?;

    let root = session.root();
    let metadata = sftp
        .metadata(root)
        .await
        .map_err(|e| SshError::Sftp(format!("root {} is not accessible: {}", root, e)))?;
    if !metadata.is_dir() {
        return Err(SshError::Sftp(format!("root {} is not a directory", root)));
    }
    Ok(sftp)
}
