//! Session Negotiator
//!
//! Post-connect probes on a fresh transport: which shell runs remote commands,
//! where the home directory is, and (optionally) the remote command channel.
//!
//! # Design
//! - Every probe is a one-shot `exec` that echoes a value between markers, so
//!   banners and MOTD noise never confuse the parser
//! - Shell probes run POSIX first, then PowerShell, then cmd.exe
//! - "Marker not found" is soft; a failed `exec` is a transport error and fatal
//! - Home detection only runs when the root starts with `~`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::remote_command::{self, RemoteCommandChannel, RemoteCommandHandler};
use super::shell::{ShellInfo, ShellProfile};
use crate::config::descriptor::HOME_SENTINEL;
use crate::config::{merge_environment, EnvironmentVariable, TargetDescriptor};
use crate::ssh::{HandleController, SshError};

// ═══════════════════════════════════════════════════════════════════════════
// Probes
// ═══════════════════════════════════════════════════════════════════════════

const POSIX_SHELL_PROBE: &str = "echo \":::SHELL:$SHELL:SHELL:::\"";
const POWERSHELL_PROBE: &str = "echo \":::PS:$($PSVersionTable.PSVersion.Major):PS:::\"";
const CMD_PROBE: &str = "echo :::CMD:%COMSPEC%:CMD:::";

/// Settings the negotiator takes from the registry
#[derive(Clone, Default)]
pub struct NegotiationOptions {
    pub base_environment: Vec<EnvironmentVariable>,
    pub tty_timeout: Duration,
    pub remote_handler: Option<Arc<dyn RemoteCommandHandler>>,
}

/// Everything the probes found out
#[derive(Debug)]
pub struct NegotiatedSession {
    pub shell: ShellInfo,
    pub home: Option<String>,
    /// Root with the home sentinel resolved
    pub root: String,
    pub environment: Vec<EnvironmentVariable>,
    pub cache: HashMap<String, String>,
    pub remote_command: Option<RemoteCommandChannel>,
}

/// Run all probes against `actual`.
pub async fn negotiate(
    controller: &HandleController,
    actual: &TargetDescriptor,
    options: &NegotiationOptions,
) -> Result<NegotiatedSession, SshError> {
    let name = actual.name.as_str();
    let flags = actual.parsed_flags();

    let shell = match detect_shell(controller).await? {
        Some(shell) => shell,
        None => {
            warn!(
                "[Negotiator] {}",
                SshError::ShellUndetectable(format!("no shell marker from '{}'", name))
            );
            ShellInfo::unknown()
        }
    };
    info!("[Negotiator] {} runs {} ({})", name, shell.binary, shell.profile);

    let mut home = None;
    let mut root = actual.root.clone();
    if root.starts_with(HOME_SENTINEL) {
        home = detect_home(controller, shell.profile).await?;
        match &home {
            Some(dir) => root = substitute_home(&root, dir),
            None if flags.check_home() => {
                return Err(SshError::HomeDirectoryUndetectable(format!(
                    "could not detect the home directory of '{}' (disable CHECK_HOME to use /)",
                    name
                )));
            }
            None => {
                warn!(
                    "[Negotiator] Home directory of {} undetectable, using / as root",
                    name
                );
                root = "/".to_string();
            }
        }
    }
    debug!("[Negotiator] {} root resolved to {}", name, root);

    let mut environment =
        merge_environment(&[&options.base_environment, &actual.environment]);
    let mut cache = HashMap::new();
    let mut remote_command = None;

    if flags.remote_commands() {
        if shell.profile.is_windows() {
            warn!(
                "[Negotiator] Remote commands are not supported on {} ({})",
                name, shell.profile
            );
        } else {
            let setup = remote_command::setup(
                controller,
                shell.profile,
                name,
                options.remote_handler.clone(),
                options.tty_timeout,
                &mut cache,
            )
            .await;
            if let Some(setup) = degrade_soft(name, setup)? {
                environment = merge_environment(&[&environment, &setup.environment]);
                remote_command = Some(setup.channel);
            }
        }
    }

    Ok(NegotiatedSession {
        shell,
        home,
        root,
        environment,
        cache,
        remote_command,
    })
}

/// Soft failures only disable the optional feature; the rest abort negotiation
fn degrade_soft<T>(name: &str, result: Result<T, SshError>) -> Result<Option<T>, SshError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_soft() => {
            warn!("[Negotiator] {}: {}", name, e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// `Ok(None)` when no probe produced a usable marker
async fn detect_shell(controller: &HandleController) -> Result<Option<ShellInfo>, SshError> {
    let out = controller.exec(POSIX_SHELL_PROBE).await?.combined();
    if let Some(binary) = extract_marker(&out, "SHELL").filter(|v| !v.contains('$')) {
        return Ok(Some(shell_info(&binary)));
    }

    let out = controller.exec(POWERSHELL_PROBE).await?.combined();
    if extract_marker(&out, "PS").is_some_and(|v| v.chars().all(|c| c.is_ascii_digit())) {
        return Ok(Some(ShellInfo {
            binary: "powershell".into(),
            profile: ShellProfile::PowerShell,
        }));
    }

    let out = controller.exec(CMD_PROBE).await?.combined();
    if let Some(comspec) = extract_marker(&out, "CMD").filter(|v| !v.contains('%')) {
        return Ok(Some(ShellInfo {
            binary: comspec,
            profile: ShellProfile::Cmd,
        }));
    }

    Ok(None)
}

fn shell_info(binary: &str) -> ShellInfo {
    let profile = ShellProfile::classify(binary).unwrap_or_else(|| {
        warn!("[Negotiator] Unrecognized shell {}, assuming POSIX sh", binary);
        ShellProfile::Posix
    });
    ShellInfo {
        binary: binary.rsplit('/').next().unwrap_or(binary).to_string(),
        profile,
    }
}

async fn detect_home(
    controller: &HandleController,
    profile: ShellProfile,
) -> Result<Option<String>, SshError> {
    let out = controller.exec(&profile.home_probe()).await?.combined();
    let Some(home) = extract_marker(&out, "HOME") else {
        return Ok(None);
    };
    // Unexpanded: the variable or tilde came back literally
    if home == HOME_SENTINEL || home.contains('%') || home.contains('$') {
        return Ok(None);
    }
    Ok(Some(normalize_home(&home)))
}

/// Value between `:::TAG:` and `:TAG:::`, trimmed; `None` if absent or empty
fn extract_marker(output: &str, tag: &str) -> Option<String> {
    let open = format!(":::{}:", tag);
    let close = format!(":{}:::", tag);
    let start = output.find(&open)? + open.len();
    let end = output[start..].find(&close)? + start;
    let value = output[start..end].trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// `C:\Users\me` → `/C:/Users/me`; POSIX paths pass through
fn normalize_home(home: &str) -> String {
    let bytes = home.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return format!("/{}", home.replace('\\', "/"));
    }
    home.to_string()
}

fn substitute_home(root: &str, home: &str) -> String {
    let rest = root
        .strip_prefix(HOME_SENTINEL)
        .unwrap_or(root)
        .trim_start_matches('/');
    let home = home.trim_end_matches('/');
    match (home.is_empty(), rest.is_empty()) {
        (true, true) => "/".to_string(),
        (false, true) => home.to_string(),
        _ => format!("{}/{}", home, rest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::flags::{CHECK_HOME, REMOTE_COMMANDS};
    use crate::session::remote_command::TTY_ENV;
    use crate::ssh::testing::{FakeTransport, Reply};

    fn bash_with_home(home: &'static str) -> FakeTransport {
        FakeTransport::bash(home)
    }

    #[test]
    fn test_extract_marker() {
        let out = "Welcome!\n:::SHELL:/usr/bin/zsh:SHELL:::\n";
        assert_eq!(extract_marker(out, "SHELL").as_deref(), Some("/usr/bin/zsh"));
        assert_eq!(extract_marker(":::SHELL::SHELL:::", "SHELL"), None);
        assert_eq!(extract_marker("nothing", "SHELL"), None);
    }

    #[test]
    fn test_substitute_home() {
        assert_eq!(substitute_home("~/app", "/home/deploy"), "/home/deploy/app");
        assert_eq!(substitute_home("~", "/home/deploy/"), "/home/deploy");
        assert_eq!(substitute_home("~/", "/"), "/");
        assert_eq!(normalize_home(r"C:\Users\me"), "/C:/Users/me");
    }

    #[tokio::test]
    async fn test_bash_home_resolution() {
        let fake = bash_with_home("/home/deploy");
        let target = TargetDescriptor::new("prod", "10.0.0.1").with_root("~/app");
        let negotiated = negotiate(&fake.controller(), &target, &NegotiationOptions::default())
            .await
            .unwrap();

        assert_eq!(negotiated.root, "/home/deploy/app");
        assert_eq!(negotiated.home.as_deref(), Some("/home/deploy"));
        assert_eq!(negotiated.shell.binary, "bash");
        assert_eq!(negotiated.shell.profile, ShellProfile::Posix);
        assert!(negotiated.remote_command.is_none());
    }

    #[tokio::test]
    async fn test_absolute_root_skips_home_probe() {
        let fake = bash_with_home("/home/deploy");
        let target = TargetDescriptor::new("prod", "10.0.0.1").with_root("/srv");
        let negotiated = negotiate(&fake.controller(), &target, &NegotiationOptions::default())
            .await
            .unwrap();
        assert_eq!(negotiated.root, "/srv");
        assert!(negotiated.home.is_none());
        assert!(!fake.commands().iter().any(|c| c.contains(":::HOME:")));
    }

    #[tokio::test]
    async fn test_unknown_shell_falls_back() {
        let fake = FakeTransport::spawn(|command: &str| {
            if command.contains(":::HOME:") {
                Reply::stdout(":::HOME:/root:HOME:::")
            } else {
                // Literal echo, nothing expanded
                Reply::stdout(command.trim_start_matches("echo ").replace('"', ""))
            }
        });
        let target = TargetDescriptor::new("odd", "10.0.0.2");
        let negotiated = negotiate(&fake.controller(), &target, &NegotiationOptions::default())
            .await
            .unwrap();
        assert!(negotiated.shell.is_unknown());
        assert_eq!(negotiated.shell.profile, ShellProfile::Posix);
        assert_eq!(negotiated.root, "/root");
    }

    #[tokio::test]
    async fn test_powershell_detected() {
        let fake = FakeTransport::spawn(|command: &str| {
            if command.contains(":::PS:") {
                Reply::stdout(":::PS:7:PS:::\r\n")
            } else if command.contains(":::HOME:") {
                Reply::stdout(":::HOME:C:\\Users\\me:HOME:::\r\n")
            } else {
                Reply::stdout(":::SHELL::SHELL:::\r\n")
            }
        });
        let target = TargetDescriptor::new("win", "10.0.0.3");
        let negotiated = negotiate(&fake.controller(), &target, &NegotiationOptions::default())
            .await
            .unwrap();
        assert_eq!(negotiated.shell.profile, ShellProfile::PowerShell);
        assert_eq!(negotiated.root, "/C:/Users/me");
    }

    #[tokio::test]
    async fn test_home_required_by_default() {
        let fake = bash_with_home("~");
        let target = TargetDescriptor::new("prod", "10.0.0.1");
        let err = negotiate(&fake.controller(), &target, &NegotiationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SshError::HomeDirectoryUndetectable(_)));

        let target = target.with_flag(format!("-{}", CHECK_HOME));
        let negotiated = negotiate(&fake.controller(), &target, &NegotiationOptions::default())
            .await
            .unwrap();
        assert_eq!(negotiated.root, "/");
    }

    #[tokio::test]
    async fn test_exec_failure_is_fatal() {
        let fake = FakeTransport::spawn(|_: &str| Reply::Fail(SshError::Channel("refused".into())));
        let target = TargetDescriptor::new("prod", "10.0.0.1");
        let err = negotiate(&fake.controller(), &target, &NegotiationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SshError::Channel(_)));
    }

    #[tokio::test]
    async fn test_environment_merges_base_then_descriptor() {
        let fake = bash_with_home("/home/deploy");
        let target = TargetDescriptor::new("prod", "10.0.0.1")
            .with_root("/")
            .with_env("LANG", "C")
            .with_env("EDITOR", "vi");
        let options = NegotiationOptions {
            base_environment: vec![
                EnvironmentVariable::new("LANG", "en_US.UTF-8"),
                EnvironmentVariable::new("TERM", "xterm"),
            ],
            ..Default::default()
        };
        let negotiated = negotiate(&fake.controller(), &target, &options).await.unwrap();
        assert_eq!(
            negotiated.environment,
            vec![
                EnvironmentVariable::new("LANG", "C"),
                EnvironmentVariable::new("TERM", "xterm"),
                EnvironmentVariable::new("EDITOR", "vi"),
            ]
        );
    }

    #[tokio::test]
    async fn test_remote_command_failure_keeps_session() {
        // The fake refuses channels, so the marker channel cannot open
        let fake = bash_with_home("/home/deploy");
        let target = TargetDescriptor::new("prod", "10.0.0.1")
            .with_root("~/app")
            .with_flag(REMOTE_COMMANDS);
        let negotiated = negotiate(&fake.controller(), &target, &NegotiationOptions::default())
            .await
            .unwrap();

        assert_eq!(negotiated.root, "/home/deploy/app");
        assert!(negotiated.remote_command.is_none());
        assert!(!negotiated.environment.iter().any(|v| v.key == TTY_ENV));
        assert!(!fake.commands().iter().any(|c| c.contains("mkdir -p")));
    }

    #[tokio::test]
    async fn test_windows_shell_skips_remote_commands() {
        let fake = FakeTransport::spawn(|command: &str| {
            if command.contains(":::PS:") {
                Reply::stdout(":::PS:5:PS:::\r\n")
            } else if command.contains(":::HOME:") {
                Reply::stdout(":::HOME:C:\\Users\\me:HOME:::\r\n")
            } else {
                Reply::stdout(":::SHELL::SHELL:::\r\n")
            }
        });
        let target = TargetDescriptor::new("win", "10.0.0.3").with_flag(REMOTE_COMMANDS);
        let negotiated = negotiate(&fake.controller(), &target, &NegotiationOptions::default())
            .await
            .unwrap();

        assert_eq!(negotiated.shell.profile, ShellProfile::PowerShell);
        assert!(negotiated.remote_command.is_none());
        assert!(negotiated.cache.is_empty());
    }

    #[test]
    fn test_tty_timeout_aborts_negotiation() {
        let err = degrade_soft::<()>("prod", Err(SshError::Timeout("tty".into()))).unwrap_err();
        assert!(matches!(err, SshError::Timeout(_)));

        let skipped =
            degrade_soft::<()>("prod", Err(SshError::RemoteCommandSetup("no pty".into())));
        assert_eq!(skipped.unwrap(), None);
        assert_eq!(degrade_soft("prod", Ok(7)).unwrap(), Some(7));
    }
}
