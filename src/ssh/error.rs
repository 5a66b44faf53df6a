//! SSH Error types
//!
//! One taxonomy for the whole connection lifecycle. The enum is `Clone` because a
//! coalesced creation failure is handed to every caller awaiting the same name.

use std::io;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SshError {
    /// Malformed descriptor (proxy, hop, port). Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to resolve {host}: {message}")]
    DnsResolution { host: String, message: String },

    #[error("Proxy handshake failed: {0}")]
    ProxyHandshake(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Every applicable credential method was tried and rejected
    #[error("Authentication failed: {0}")]
    AuthenticationExhausted(String),

    #[error("Hop '{hop}' unavailable: {message}")]
    HopUnavailable { hop: String, message: String },

    #[error("Could not detect home directory: {0}")]
    HomeDirectoryUndetectable(String),

    #[error("Could not detect remote shell: {0}")]
    ShellUndetectable(String),

    #[error("Remote command setup failed: {0}")]
    RemoteCommandSetup(String),

    /// The transport ended without being asked to. `error` is `None` for a clean close.
    #[error("Transport closed unexpectedly{}", .error.as_ref().map(|e| format!(": {}", e)).unwrap_or_default())]
    TransportClosed { error: Option<String> },

    #[error("Cancelled by user: {0}")]
    Cancelled(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("SSH protocol error: {0}")]
    Protocol(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("SSH Agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("SSH Agent error: {0}")]
    AgentError(String),

    #[error("SFTP error: {0}")]
    Sftp(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Disconnected")]
    Disconnected,
}

/// What the UI may offer after a failed creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RecoveryAction {
    Retry,
    Reconfigure,
    Ignore,
}

impl SshError {
    /// Soft errors degrade a feature instead of failing session creation.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            SshError::ShellUndetectable(_) | SshError::RemoteCommandSetup(_)
        )
    }

    pub fn recovery_actions(&self) -> Vec<RecoveryAction> {
        use RecoveryAction::*;
        match self {
            SshError::Configuration(_) | SshError::KeyError(_) => vec![Reconfigure, Ignore],
            SshError::Cancelled(_) => vec![Ignore],
            SshError::AuthenticationExhausted(_)
            | SshError::HomeDirectoryUndetectable(_)
            | SshError::DnsResolution { .. }
            | SshError::ProxyHandshake(_)
            | SshError::HopUnavailable { .. } => vec![Retry, Reconfigure, Ignore],
            _ => vec![Retry, Ignore],
        }
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::IO(e) => e.into(),
            russh::Error::Disconnect => SshError::Disconnected,
            other => SshError::Protocol(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

impl From<io::Error> for SshError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => SshError::ConnectionRefused(err.to_string()),
            io::ErrorKind::TimedOut => SshError::Timeout(err.to_string()),
            _ => SshError::Io(err.to_string()),
        }
    }
}

impl From<russh_sftp::client::error::Error> for SshError {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        SshError::Sftp(err.to_string())
    }
}

impl serde::Serialize for SshError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refused_io_maps_to_connection_refused() {
        let err: SshError = io::Error::new(io::ErrorKind::ConnectionRefused, "nope").into();
        assert!(matches!(err, SshError::ConnectionRefused(_)));
    }

    #[test]
    fn test_configuration_errors_are_not_retryable() {
        let actions = SshError::Configuration("bad proxy".into()).recovery_actions();
        assert!(!actions.contains(&RecoveryAction::Retry));
        assert!(actions.contains(&RecoveryAction::Reconfigure));
    }

    #[test]
    fn test_transport_closed_message() {
        let clean = SshError::TransportClosed { error: None };
        assert_eq!(clean.to_string(), "Transport closed unexpectedly");
        let dirty = SshError::TransportClosed {
            error: Some("reset".into()),
        };
        assert_eq!(dirty.to_string(), "Transport closed unexpectedly: reset");
    }

    #[test]
    fn test_soft_errors() {
        assert!(SshError::RemoteCommandSetup("x".into()).is_soft());
        assert!(!SshError::HomeDirectoryUndetectable("x".into()).is_soft());
        assert!(!SshError::Timeout("tty discovery".into()).is_soft());
    }
}
