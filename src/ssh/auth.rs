//! Authentication chain
//!
//! Methods are tried in a fixed order and a rejection moves on to the next one:
//!
//! 1. agent (when the descriptor names one)
//! 2. private key (passphrase may be prompted)
//! 3. password value
//! 4. prompted password, then keyboard-interactive
//!
//! Only when every applicable method has been rejected does the attempt fail
//! with [`SshError::AuthenticationExhausted`]. A prompt the user dismisses
//! aborts immediately with [`SshError::Cancelled`].

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{Handle, KeyboardInteractiveAuthResponse};
use russh::keys::key::PrivateKeyWithHashAlg;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::agent::{is_agent_available, SshAgentClient, AGENT_FROM_ENV};
use super::client::ClientHandler;
use super::error::SshError;
use crate::config::{Promptable, TargetDescriptor};

/// Keyboard-interactive rounds before giving up
const MAX_KBI_ROUNDS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptKind {
    Host,
    Username,
    Password,
    Passphrase,
    /// A keyboard-interactive challenge from the server
    Challenge { instructions: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    /// Target the prompt is for
    pub target: String,
    pub kind: PromptKind,
    pub message: String,
    /// Whether the answer must be masked
    pub secret: bool,
}

/// Asks the user for a missing credential or address.
///
/// `None` means the user dismissed the prompt.
#[async_trait]
pub trait Prompter: Send + Sync {
    async fn prompt(&self, request: PromptRequest) -> Option<String>;
}

/// Never answers. For non-interactive embedders.
pub struct NoPrompter;

#[async_trait]
impl Prompter for NoPrompter {
    async fn prompt(&self, request: PromptRequest) -> Option<String> {
        debug!("No prompter installed, declining {:?}", request.kind);
        None
    }
}

/// Resolve a promptable field, asking the user when needed.
pub async fn resolve_promptable(
    prompter: &dyn Prompter,
    target: &str,
    field: &Promptable,
    kind: PromptKind,
    message: &str,
) -> Result<Zeroizing<String>, SshError> {
    match field {
        Promptable::Value(v) => Ok(Zeroizing::new(v.clone())),
        Promptable::Prompt => {
            let secret = matches!(kind, PromptKind::Password | PromptKind::Passphrase);
            let answer = prompter
                .prompt(PromptRequest {
                    target: target.to_string(),
                    kind,
                    message: message.to_string(),
                    secret,
                })
                .await;
            answer
                .map(Zeroizing::new)
                .ok_or_else(|| SshError::Cancelled(format!("{} for {}", message, target)))
        }
    }
}

/// Expand `~` so key paths work with `russh::keys`
pub fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped).to_string_lossy().into_owned();
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

/// Run the chain against an unauthenticated handle.
///
/// `target` must already have its host and username resolved.
pub async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    target: &TargetDescriptor,
    username: &str,
    prompter: &Arc<dyn Prompter>,
) -> Result<(), SshError> {
    let mut attempted: Vec<&'static str> = Vec::new();

    if let Some(agent) = &target.agent {
        attempted.push("agent");
        if try_agent(handle, agent, username).await {
            return Ok(());
        }
    }

    if let Some(key_path) = &target.private_key_path {
        attempted.push("publickey");
        if try_key(handle, target, key_path, username, prompter.as_ref()).await? {
            return Ok(());
        }
    }

    match &target.password {
        Some(Promptable::Value(password)) => {
            attempted.push("password");
            if try_password(handle, username, password).await? {
                return Ok(());
            }
        }
        Some(Promptable::Prompt) => {
            attempted.push("password");
            let password = resolve_promptable(
                prompter.as_ref(),
                &target.name,
                &Promptable::Prompt,
                PromptKind::Password,
                &format!("Password for {}", username),
            )
            .await?;
            if try_password(handle, username, &password).await? {
                return Ok(());
            }

            attempted.push("keyboard-interactive");
            if try_keyboard_interactive(handle, &target.name, username, prompter.as_ref()).await? {
                return Ok(());
            }
        }
        None => {}
    }

    if attempted.is_empty() {
        return Err(SshError::AuthenticationExhausted(format!(
            "no credentials configured for '{}'",
            target.name
        )));
    }

    Err(SshError::AuthenticationExhausted(format!(
        "all methods rejected for {} (tried: {})",
        username,
        attempted.join(", ")
    )))
}

/// Agent failures are never fatal; the chain continues.
async fn try_agent(handle: &mut Handle<ClientHandler>, location: &str, username: &str) -> bool {
    if location == AGENT_FROM_ENV && !is_agent_available() {
        debug!("Agent requested but SSH_AUTH_SOCK is not set");
        return false;
    }
    let mut agent = match SshAgentClient::connect_to(location).await {
        Ok(agent) => agent,
        Err(e) => {
            warn!("{}", e);
            return false;
        }
    };
    match agent.authenticate(handle, username).await {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!("{}", e);
            false
        }
    }
}

async fn try_key(
    handle: &mut Handle<ClientHandler>,
    target: &TargetDescriptor,
    key_path: &str,
    username: &str,
    prompter: &dyn Prompter,
) -> Result<bool, SshError> {
    let key_path = expand_tilde(key_path);
    let passphrase = match &target.passphrase {
        Some(field) => Some(
            resolve_promptable(
                prompter,
                &target.name,
                field,
                PromptKind::Passphrase,
                &format!("Passphrase for {}", key_path),
            )
            .await?,
        ),
        None => None,
    };

    let key = match russh::keys::load_secret_key(&key_path, passphrase.as_ref().map(|p| p.as_str())) {
        Ok(key) => key,
        Err(e) => {
            // Unreadable key: fall through to the next method
            warn!("Failed to load private key {}: {}", key_path, e);
            return Ok(false);
        }
    };

    let hash_alg = handle.best_supported_rsa_hash().await.ok().flatten().flatten();
    let result = handle
        .authenticate_publickey(
            username,
            PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
        )
        .await?;
    if result.success() {
        info!("Public key authentication succeeded ({})", key_path);
    } else {
        debug!("Public key {} rejected", key_path);
    }
    Ok(result.success())
}

async fn try_password(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    password: &str,
) -> Result<bool, SshError> {
    let result = handle.authenticate_password(username, password).await?;
    if result.success() {
        info!("Password authentication succeeded");
    } else {
        debug!("Password rejected for {}", username);
    }
    Ok(result.success())
}

async fn try_keyboard_interactive(
    handle: &mut Handle<ClientHandler>,
    target: &str,
    username: &str,
    prompter: &dyn Prompter,
) -> Result<bool, SshError> {
    let mut response = handle
        .authenticate_keyboard_interactive_start(username, None::<String>)
        .await?;

    for _ in 0..MAX_KBI_ROUNDS {
        match response {
            KeyboardInteractiveAuthResponse::Success => {
                info!("Keyboard-interactive authentication succeeded");
                return Ok(true);
            }
            KeyboardInteractiveAuthResponse::Failure { .. } => return Ok(false),
            KeyboardInteractiveAuthResponse::InfoRequest {
                name,
                instructions,
                prompts,
            } => {
                let mut answers = Vec::with_capacity(prompts.len());
                for p in prompts {
                    let answer = prompter
                        .prompt(PromptRequest {
                            target: target.to_string(),
                            kind: PromptKind::Challenge {
                                instructions: instructions.clone(),
                            },
                            message: if name.is_empty() {
                                p.prompt.clone()
                            } else {
                                format!("{}: {}", name, p.prompt)
                            },
                            secret: !p.echo,
                        })
                        .await
                        .ok_or_else(|| {
                            SshError::Cancelled(format!("keyboard-interactive for {}", target))
                        })?;
                    answers.push(answer);
                }
                response = handle
                    .authenticate_keyboard_interactive_respond(answers)
                    .await?;
            }
        }
    }

    warn!("Keyboard-interactive gave up after {} rounds", MAX_KBI_ROUNDS);
    Ok(false)
}
