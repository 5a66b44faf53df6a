//! SSH Agent authentication
//!
//! Delegates challenge signing to a running agent through russh's [`AgentClient`].
//!
//! - Unix: `$SSH_AUTH_SOCK`, or an explicit socket path from the descriptor
//! - Windows: the OpenSSH named pipe `\\.\pipe\openssh-ssh-agent`
//!
//! russh 0.54's own `impl Signer for AgentClient` borrows the requested key
//! across an `.await`, which makes the authentication future `!Send`.
//! [`AgentSigner`] clones the key first so the future stays `Send`.

use std::future::Future;

use russh::client::Handle;
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::ssh_key;
use russh::{AgentAuthError, CryptoVec, Signer};
use tracing::{debug, info, warn};

use crate::ssh::client::ClientHandler;
use crate::ssh::error::SshError;

/// Descriptor value that means "use the environment's agent"
pub const AGENT_FROM_ENV: &str = "env";

#[cfg(windows)]
const WINDOWS_AGENT_PIPE: &str = r"\\.\pipe\openssh-ssh-agent";

/// `Send`-safe [`Signer`] over an agent connection.
struct AgentSigner<'a> {
    agent: &'a mut AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key_owned = key.clone();
        async move {
            self.agent
                .sign_request(&key_owned, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

pub struct SshAgentClient {
    agent: AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>,
}

impl SshAgentClient {
    /// Connect to the agent named by a descriptor's `agent` field.
    pub async fn connect_to(location: &str) -> Result<Self, SshError> {
        if location == AGENT_FROM_ENV {
            return Self::connect().await;
        }

        #[cfg(unix)]
        {
            let agent = AgentClient::connect_uds(location).await.map_err(|e| {
                SshError::AgentNotAvailable(format!("Failed to connect to agent at {}: {}", location, e))
            })?;
            info!("Connected to SSH Agent at {}", location);
            Ok(Self {
                agent: agent.dynamic(),
            })
        }

        #[cfg(windows)]
        {
            let agent = AgentClient::connect_named_pipe(location).await.map_err(|e| {
                SshError::AgentNotAvailable(format!("Failed to connect to agent pipe {}: {}", location, e))
            })?;
            info!("Connected to SSH Agent via {}", location);
            Ok(Self {
                agent: agent.dynamic(),
            })
        }

        #[cfg(not(any(unix, windows)))]
        {
            Err(SshError::AgentNotAvailable(format!(
                "SSH Agent is not supported on this platform ({})",
                location
            )))
        }
    }

    /// Connect to the system agent
    pub async fn connect() -> Result<Self, SshError> {
        #[cfg(unix)]
        {
            let agent = AgentClient::connect_env().await.map_err(|e| {
                SshError::AgentNotAvailable(format!("SSH_AUTH_SOCK agent unreachable: {}", e))
            })?;
            debug!("Using SSH Agent from SSH_AUTH_SOCK");
            Ok(Self {
                agent: agent.dynamic(),
            })
        }

        #[cfg(windows)]
        {
            Box::pin(Self::connect_to(WINDOWS_AGENT_PIPE)).await
        }

        #[cfg(not(any(unix, windows)))]
        {
            Err(SshError::AgentNotAvailable("no agent transport on this platform".into()))
        }
    }

    /// Try every identity the agent holds until the server accepts one.
    pub async fn authenticate(
        &mut self,
        handle: &mut Handle<ClientHandler>,
        username: &str,
    ) -> Result<bool, SshError> {
        let keys = self
            .agent
            .request_identities()
            .await
            .map_err(|e| SshError::AgentError(format!("Failed to list agent keys: {}", e)))?;

        if keys.is_empty() {
            warn!("SSH Agent has no keys loaded");
            return Ok(false);
        }

        debug!("SSH Agent reports {} key(s)", keys.len());

        for key in &keys {
            match handle
                .authenticate_publickey_with(
                    username,
                    key.clone(),
                    None,
                    &mut AgentSigner {
                        agent: &mut self.agent,
                    },
                )
                .await
            {
                Ok(result) if result.success() => {
                    info!("SSH Agent authentication succeeded with key: {}", key.comment());
                    return Ok(true);
                }
                Ok(_) => debug!("Key rejected by server: {}", key.comment()),
                Err(e) => warn!("Agent signing error for key {}: {}", key.comment(), e),
            }
        }

        Ok(false)
    }
}

/// Check if SSH Agent is available on the system
///
/// Returns `true` if the agent socket/pipe appears to be accessible.
/// This is a quick pre-check; actual connection may still fail.
pub fn is_agent_available() -> bool {
    #[cfg(unix)]
    {
        std::env::var("SSH_AUTH_SOCK").is_ok()
    }

    #[cfg(windows)]
    {
        // OpenSSH for Windows agent uses a named pipe that is always "present"
        // as long as the service is installed; actual availability checked on connect.
        true
    }

    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}
