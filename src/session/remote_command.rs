//! Remote command channel
//!
//! Lets programs on the remote host talk back to the client. A helper script
//! (`code`) prints marker lines of the form `::sshfs:<command>:<args>` to the
//! tty of a dedicated interactive shell; this module reads that shell's output
//! and dispatches every recognised marker to a [`RemoteCommandHandler`].
//!
//! ```text
//! remote$ code notes.txt
//!    └─▶ printf '::sshfs:code:/home/me:::notes.txt' > $OXIDEFS_CMD_TTY
//!           └─▶ channel data ─▶ parse_marker ─▶ RemoteCommand::Open
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::ChannelMsg;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::shell::ShellProfile;
use crate::config::EnvironmentVariable;
use crate::ssh::{HandleController, SshError};

pub const MARKER_PREFIX: &str = "::sshfs:";
pub const SCRIPT_DIR: &str = "/tmp/.oxidefs";
/// Session cache key holding the written script path
pub const SCRIPT_CACHE_KEY: &str = "remote_command_script";
/// Variable that tells the helper script where to write markers
pub const TTY_ENV: &str = "OXIDEFS_CMD_TTY";

const SCRIPT: &str = r#"#!/bin/sh
if [ -z "$OXIDEFS_CMD_TTY" ]; then
  echo "code: not running inside an oxidefs terminal" >&2
  exit 1
fi
if [ "$#" -eq 0 ]; then
  set -- .
fi
for arg in "$@"; do
  printf '::sshfs:code:%s:::%s\n' "$(pwd)" "$arg" > "$OXIDEFS_CMD_TTY"
done
"#;

/// A command sent from the remote side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    /// Open a path in the editor
    Open { path: String },
    Unknown { name: String, args: String },
}

/// Receives commands from the remote side (the editor integration)
#[async_trait]
pub trait RemoteCommandHandler: Send + Sync {
    async fn handle(&self, session: &str, command: RemoteCommand);
}

/// Split a marker line into command and arguments
pub fn parse_marker(line: &str) -> Option<(String, String)> {
    let line = line.trim_end_matches(['\r', '\n']).trim_start();
    let rest = line.strip_prefix(MARKER_PREFIX)?;
    let (name, args) = rest.split_once(':').unwrap_or((rest, ""));
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return None;
    }
    Some((name.to_string(), args.to_string()))
}

pub fn interpret(name: &str, args: &str) -> RemoteCommand {
    match name {
        "code" => {
            let (cwd, path) = args.split_once(":::").unwrap_or(("", args));
            RemoteCommand::Open {
                path: resolve_remote_path(cwd, path),
            }
        }
        _ => RemoteCommand::Unknown {
            name: name.to_string(),
            args: args.to_string(),
        },
    }
}

fn resolve_remote_path(cwd: &str, path: &str) -> String {
    if path.starts_with('/') || cwd.is_empty() {
        return path.to_string();
    }
    if path == "." {
        return cwd.to_string();
    }
    format!("{}/{}", cwd.trim_end_matches('/'), path.trim_start_matches("./"))
}

/// Single-quote for a POSIX shell
fn sh_single_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Live marker channel. Closing (or dropping) it ends the remote shell.
#[derive(Debug)]
pub struct RemoteCommandChannel {
    tty: String,
    task: JoinHandle<()>,
}

impl RemoteCommandChannel {
    pub fn tty(&self) -> &str {
        &self.tty
    }

    pub fn close(&self) {
        self.task.abort();
    }
}

impl Drop for RemoteCommandChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Result of a successful setup
#[derive(Debug)]
pub struct RemoteCommandSetup {
    pub channel: RemoteCommandChannel,
    /// Added to the session environment
    pub environment: Vec<EnvironmentVariable>,
}

/// Open the marker channel.
///
/// Returns [`SshError::Timeout`] when the tty cannot be discovered in time
/// (fatal for the session) and [`SshError::RemoteCommandSetup`] for anything
/// that merely disables the feature.
pub async fn setup(
    controller: &HandleController,
    profile: ShellProfile,
    session_name: &str,
    handler: Option<Arc<dyn RemoteCommandHandler>>,
    tty_timeout: Duration,
    cache: &mut HashMap<String, String>,
) -> Result<RemoteCommandSetup, SshError> {
    if profile.is_windows() {
        return Err(SshError::RemoteCommandSetup(
            "not supported on Windows shells".into(),
        ));
    }
    let soft = |stage: &str, e: SshError| SshError::RemoteCommandSetup(format!("{}: {}", stage, e));

    let channel = controller
        .open_session_channel()
        .await
        .map_err(|e| soft("open channel", e))?;
    channel
        .request_pty(false, "dumb", 200, 24, 0, 0, &[])
        .await
        .map_err(|e| soft("request pty", e.into()))?;
    channel
        .request_shell(true)
        .await
        .map_err(|e| soft("request shell", e.into()))?;

    let probe = format!(
        "stty -echo 2>/dev/null; printf '{}tty:%s\\n' \"{}\"\n",
        MARKER_PREFIX,
        profile.embed_substitution("tty").unwrap_or_default()
    );
    channel
        .data(probe.as_bytes())
        .await
        .map_err(|e| soft("write probe", e.into()))?;

    let (tty_tx, tty_rx) = oneshot::channel();
    let name = session_name.to_string();
    let task = tokio::spawn(read_markers(channel, name, handler, tty_tx));

    let tty = match tokio::time::timeout(tty_timeout, tty_rx).await {
        Ok(Ok(tty)) => tty,
        Ok(Err(_)) => {
            task.abort();
            return Err(SshError::RemoteCommandSetup(
                "channel closed before reporting its tty".into(),
            ));
        }
        Err(_) => {
            task.abort();
            return Err(SshError::Timeout(format!(
                "remote command tty discovery exceeded {:?}",
                tty_timeout
            )));
        }
    };
    let channel = RemoteCommandChannel { tty, task };
    debug!("Remote command channel for {} on {}", session_name, channel.tty);

    // The channel aborts its task on drop if the script cannot be written
    let script = write_script(controller, cache).await?;
    let dir = script
        .rsplit_once('/')
        .map(|(dir, _)| dir.to_string())
        .unwrap_or_else(|| SCRIPT_DIR.to_string());

    info!("Remote commands enabled for {}", session_name);
    Ok(RemoteCommandSetup {
        environment: vec![
            EnvironmentVariable::new(TTY_ENV, channel.tty.clone()),
            EnvironmentVariable::new("PATH", format!("{}:$PATH", dir)),
        ],
        channel,
    })
}

/// Write the helper script once per session
async fn write_script(
    controller: &HandleController,
    cache: &mut HashMap<String, String>,
) -> Result<String, SshError> {
    if let Some(path) = cache.get(SCRIPT_CACHE_KEY) {
        return Ok(path.clone());
    }
    let path = format!("{}/code", SCRIPT_DIR);
    let command = format!(
        "mkdir -p {dir} && printf '%s' {body} > {path} && chmod +x {path}",
        dir = SCRIPT_DIR,
        body = sh_single_quote(SCRIPT),
        path = path
    );
    let out = controller
        .exec(&command)
        .await
        .map_err(|e| SshError::RemoteCommandSetup(format!("write script: {}", e)))?;
    if out.exit_status.unwrap_or(0) != 0 {
        return Err(SshError::RemoteCommandSetup(format!(
            "write script exited with {:?}: {}",
            out.exit_status,
            out.stderr.trim()
        )));
    }
    cache.insert(SCRIPT_CACHE_KEY.to_string(), path.clone());
    Ok(path)
}

async fn read_markers(
    mut channel: russh::Channel<russh::client::Msg>,
    session: String,
    handler: Option<Arc<dyn RemoteCommandHandler>>,
    tty_tx: oneshot::Sender<String>,
) {
    let mut tty_tx = Some(tty_tx);
    let mut pending = String::new();

    while let Some(msg) = channel.wait().await {
        let data = match msg {
            ChannelMsg::Data { ref data } => String::from_utf8_lossy(data).into_owned(),
            ChannelMsg::Eof | ChannelMsg::Close => break,
            _ => continue,
        };
        pending.push_str(&data);

        while let Some(pos) = pending.find('\n') {
            let line: String = pending.drain(..=pos).collect();
            let Some((name, args)) = parse_marker(&line) else {
                continue;
            };
            if name == "tty" {
                if let Some(tx) = tty_tx.take() {
                    let _ = tx.send(args);
                }
                continue;
            }
            let command = interpret(&name, &args);
            match (&handler, &command) {
                (_, RemoteCommand::Unknown { name, .. }) => {
                    warn!("Unknown remote command '{}' from {}", name, session)
                }
                (Some(handler), _) => handler.handle(&session, command).await,
                (None, _) => debug!("No handler for remote command {:?}", command),
            }
        }
    }
    debug!("Remote command channel for {} ended", session);
}
