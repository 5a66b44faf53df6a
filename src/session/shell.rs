//! Shell profiles
//!
//! Each shell family has its own syntax for setting environment variables,
//! embedding a command substitution and chaining commands. A detected shell
//! binary is mapped to one family by [`ShellProfile::classify`].

use std::fmt;

/// Shell name used when detection finds nothing
pub const UNKNOWN_SHELL: &str = "???";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShellProfile {
    /// sh, bash, zsh, ksh, dash, ash and friends
    Posix,
    Fish,
    /// csh, tcsh
    Csh,
    PowerShell,
    Cmd,
}

impl ShellProfile {
    /// Map a shell binary (path or name) to its family.
    pub fn classify(binary: &str) -> Option<Self> {
        let name = binary
            .trim()
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let name = name.strip_suffix(".exe").unwrap_or(&name);

        match name {
            "sh" | "bash" | "rbash" | "ash" | "dash" | "ksh" | "mksh" | "pdksh" | "zsh"
            | "yash" | "busybox" => Some(ShellProfile::Posix),
            "fish" => Some(ShellProfile::Fish),
            "csh" | "tcsh" => Some(ShellProfile::Csh),
            "powershell" | "pwsh" => Some(ShellProfile::PowerShell),
            "cmd" => Some(ShellProfile::Cmd),
            _ => None,
        }
    }

    pub fn is_windows(&self) -> bool {
        matches!(self, ShellProfile::PowerShell | ShellProfile::Cmd)
    }

    /// Double-quote `value` for this shell. Variable references stay live.
    pub fn quote(&self, value: &str) -> String {
        let mut out = String::with_capacity(value.len() + 2);
        out.push('"');
        for c in value.chars() {
            match (self, c) {
                (ShellProfile::Posix, '"' | '\\' | '`') | (ShellProfile::Fish, '"' | '\\') => {
                    out.push('\\');
                    out.push(c);
                }
                (ShellProfile::Csh, '"') => out.push_str("\"\\\"\""),
                (ShellProfile::PowerShell, '"' | '`') => {
                    out.push('`');
                    out.push(c);
                }
                (ShellProfile::Cmd, '"') => out.push_str("\"\""),
                _ => out.push(c),
            }
        }
        out.push('"');
        out
    }

    /// Command that sets `key` to `value` in the current shell and its children
    pub fn set_env(&self, key: &str, value: &str) -> String {
        match self {
            ShellProfile::Posix => format!("export {}={}", key, self.quote(value)),
            ShellProfile::Fish => format!("set -gx {} {}", key, self.quote(value)),
            ShellProfile::Csh => format!("setenv {} {}", key, self.quote(value)),
            ShellProfile::PowerShell => format!("$env:{} = {}", key, self.quote(value)),
            ShellProfile::Cmd => format!("set {}={}", key, value),
        }
    }

    /// Fragment that, placed inside a double-quoted string, expands to the
    /// output of `command`. `cmd.exe` has no substitution syntax.
    pub fn embed_substitution(&self, command: &str) -> Option<String> {
        match self {
            ShellProfile::Posix | ShellProfile::Csh => Some(format!("`{}`", command)),
            // fish only substitutes outside quotes
            ShellProfile::Fish => Some(format!("\"({})\"", command)),
            ShellProfile::PowerShell => Some(format!("$({})", command)),
            ShellProfile::Cmd => None,
        }
    }

    pub fn separator(&self) -> &'static str {
        match self {
            ShellProfile::Cmd => " & ",
            _ => "; ",
        }
    }

    pub fn join<S: AsRef<str>>(&self, commands: &[S]) -> String {
        commands
            .iter()
            .map(AsRef::as_ref)
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join(self.separator())
    }

    pub fn change_directory(&self, path: &str) -> String {
        match self {
            ShellProfile::Cmd => format!("cd /d {}", self.quote(&windows_path(path))),
            ShellProfile::PowerShell => format!("Set-Location {}", self.quote(&windows_path(path))),
            _ => format!("cd {}", self.quote(path)),
        }
    }

    /// Command echoing the home directory between `:::HOME:` markers
    pub fn home_probe(&self) -> String {
        match self {
            ShellProfile::PowerShell => "echo \":::HOME:$env:USERPROFILE:HOME:::\"".to_string(),
            ShellProfile::Cmd => "echo :::HOME:%USERPROFILE%:HOME:::".to_string(),
            _ => format!(
                "echo \":::HOME:{}:HOME:::\"",
                self.embed_substitution("echo ~").unwrap_or_default()
            ),
        }
    }

    /// The user's login shell, used when a terminal has no explicit command
    pub fn login_shell(&self) -> &'static str {
        match self {
            ShellProfile::Posix | ShellProfile::Csh => "$SHELL",
            ShellProfile::Fish => "fish",
            ShellProfile::PowerShell => "powershell",
            ShellProfile::Cmd => "cmd",
        }
    }
}

impl fmt::Display for ShellProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShellProfile::Posix => "posix",
            ShellProfile::Fish => "fish",
            ShellProfile::Csh => "csh",
            ShellProfile::PowerShell => "powershell",
            ShellProfile::Cmd => "cmd",
        };
        f.write_str(name)
    }
}

/// `/C:/Users/x` → `C:\Users\x`
fn windows_path(path: &str) -> String {
    let trimmed = match path.strip_prefix('/') {
        Some(rest) if rest.get(1..2) == Some(":") => rest,
        _ => path,
    };
    trimmed.replace('/', "\\")
}

/// The shell a session runs, as detected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellInfo {
    /// Binary name, or [`UNKNOWN_SHELL`]
    pub binary: String,
    pub profile: ShellProfile,
}

impl ShellInfo {
    pub fn unknown() -> Self {
        Self {
            binary: UNKNOWN_SHELL.to_string(),
            profile: ShellProfile::Posix,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.binary == UNKNOWN_SHELL
    }
}
