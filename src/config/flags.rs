//! Descriptor flags
//!
//! Free-form strings that switch optional behavior on a target:
//! `FLAG`, `+FLAG`, `-FLAG` or `FLAG=value`. Keys are case-insensitive and
//! later entries win.

use std::collections::HashMap;

use tracing::debug;

/// Open a marker channel so remote shells can talk back (`code <file>`).
pub const REMOTE_COMMANDS: &str = "REMOTE_COMMANDS";
/// Fail session creation when the home directory cannot be detected.
pub const CHECK_HOME: &str = "CHECK_HOME";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagValue {
    Enabled,
    Disabled,
    Text(String),
}

impl FlagValue {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => FlagValue::Enabled,
            "false" | "no" | "off" | "0" => FlagValue::Disabled,
            _ => FlagValue::Text(raw.trim().to_string()),
        }
    }

    pub fn as_bool(&self) -> bool {
        !matches!(self, FlagValue::Disabled)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flags {
    values: HashMap<String, FlagValue>,
}

impl Flags {
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Self {
        let mut values = HashMap::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            let (key, value) = if let Some((k, v)) = entry.split_once('=') {
                (k, FlagValue::parse(v))
            } else if let Some(k) = entry.strip_prefix('-') {
                (k, FlagValue::Disabled)
            } else if let Some(k) = entry.strip_prefix('+') {
                (k, FlagValue::Enabled)
            } else {
                (entry, FlagValue::Enabled)
            };
            let key = key.trim().to_ascii_uppercase();
            if key.is_empty() {
                debug!("Ignoring flag entry without a name: {:?}", entry);
                continue;
            }
            values.insert(key, value);
        }
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&FlagValue> {
        self.values.get(&key.to_ascii_uppercase())
    }

    pub fn enabled(&self, key: &str, default: bool) -> bool {
        self.get(key).map(FlagValue::as_bool).unwrap_or(default)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(FlagValue::Text(t)) => Some(t),
            _ => None,
        }
    }

    pub fn remote_commands(&self) -> bool {
        self.enabled(REMOTE_COMMANDS, false)
    }

    pub fn check_home(&self) -> bool {
        self.enabled(CHECK_HOME, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let flags = Flags::parse::<&str>(&[]);
        assert!(!flags.remote_commands());
        assert!(flags.check_home());
    }

    #[test]
    fn test_forms() {
        let flags = Flags::parse(&["remote_commands", "-CHECK_HOME", "LEVEL=debug", "+X", "Y=off"]);
        assert!(flags.remote_commands());
        assert!(!flags.check_home());
        assert_eq!(flags.text("level"), Some("debug"));
        assert!(flags.enabled("x", false));
        assert!(!flags.enabled("Y", true));
    }

    #[test]
    fn test_later_entries_win() {
        let flags = Flags::parse(&["REMOTE_COMMANDS", "-remote_commands"]);
        assert!(!flags.remote_commands());
    }
}
