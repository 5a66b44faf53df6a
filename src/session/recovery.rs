//! Recovery advice handed to the UI layer
//!
//! Creation failures and unexpected closures are returned as data; rendering
//! the choices (dialogs, notifications) is up to the caller.

use serde::Serialize;

use crate::ssh::{RecoveryAction, SshError};

/// A `getOrCreate` that failed, with what the user can do about it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreationFailure {
    pub name: String,
    pub error: SshError,
    pub actions: Vec<RecoveryAction>,
}

impl CreationFailure {
    pub fn new(name: impl Into<String>, error: SshError) -> Self {
        let actions = error.recovery_actions();
        Self {
            name: name.into(),
            error,
            actions,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.actions.contains(&RecoveryAction::Retry)
    }
}

impl std::fmt::Display for CreationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to connect to '{}': {}", self.name, self.error)
    }
}

impl std::error::Error for CreationFailure {}

/// What to do after a transport closed without being asked to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClosureAdvice {
    /// The closure carried a transport error: reconnect automatically
    Reconnect,
    /// Clean but unexpected: ask whether to reconnect or disconnect for good
    PromptUser,
}

impl ClosureAdvice {
    pub fn for_error(error: Option<&str>) -> Self {
        match error {
            Some(_) => ClosureAdvice::Reconnect,
            None => ClosureAdvice::PromptUser,
        }
    }
}

/// Why a session left the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum RemovalReason {
    /// Explicit close; the text is diagnostic only
    Requested { reason: Option<String> },
    /// Closed by the idle reaper
    Idle,
    TransportLost {
        error: Option<String>,
        advice: ClosureAdvice,
    },
    /// Registry shutdown
    Shutdown,
}

impl RemovalReason {
    pub fn requested(reason: Option<&str>) -> Self {
        RemovalReason::Requested {
            reason: reason.map(String::from),
        }
    }

    pub fn transport_lost(error: Option<String>) -> Self {
        let advice = ClosureAdvice::for_error(error.as_deref());
        RemovalReason::TransportLost { error, advice }
    }
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemovalReason::Requested { reason: Some(r) } => write!(f, "closed: {}", r),
            RemovalReason::Requested { reason: None } => f.write_str("closed"),
            RemovalReason::Idle => f.write_str("idle"),
            RemovalReason::TransportLost { error: Some(e), .. } => {
                write!(f, "transport lost: {}", e)
            }
            RemovalReason::TransportLost { error: None, .. } => f.write_str("transport closed"),
            RemovalReason::Shutdown => f.write_str("shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_failure_is_not_retryable() {
        let failure = CreationFailure::new("prod", SshError::Configuration("bad proxy".into()));
        assert!(!failure.can_retry());
        assert!(failure.actions.contains(&RecoveryAction::Reconfigure));
        assert!(failure.to_string().contains("prod"));
    }

    #[test]
    fn test_closure_advice() {
        assert_eq!(
            RemovalReason::transport_lost(Some("reset".into())),
            RemovalReason::TransportLost {
                error: Some("reset".into()),
                advice: ClosureAdvice::Reconnect
            }
        );
        assert_eq!(
            RemovalReason::transport_lost(None),
            RemovalReason::TransportLost {
                error: None,
                advice: ClosureAdvice::PromptUser
            }
        );
    }
}
