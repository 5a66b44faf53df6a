//! Target Descriptor
//!
//! The resolved, immutable description of how to reach one remote target.
//! Produced by a [`ConfigResolver`](super::ConfigResolver) or parsed from a
//! connection string; never mutated by the registry.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::flags::Flags;
use crate::ssh::SshError;

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const HOME_SENTINEL: &str = "~";

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_root() -> String {
    HOME_SENTINEL.to_string()
}

/// A credential or address field that may be supplied at connect time.
///
/// In JSON, `true` asks the user and a string is the literal value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PromptableRepr", into = "PromptableRepr")]
pub enum Promptable {
    Value(String),
    Prompt,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PromptableRepr {
    Flag(bool),
    Value(String),
}

impl TryFrom<PromptableRepr> for Promptable {
    type Error = String;

    fn try_from(repr: PromptableRepr) -> Result<Self, Self::Error> {
        match repr {
            PromptableRepr::Flag(true) => Ok(Promptable::Prompt),
            PromptableRepr::Flag(false) => {
                Err("`false` is not a valid value; omit the field instead".to_string())
            }
            PromptableRepr::Value(v) => Ok(Promptable::Value(v)),
        }
    }
}

impl From<Promptable> for PromptableRepr {
    fn from(p: Promptable) -> Self {
        match p {
            Promptable::Prompt => PromptableRepr::Flag(true),
            Promptable::Value(v) => PromptableRepr::Value(v),
        }
    }
}

impl Promptable {
    pub fn value(&self) -> Option<&str> {
        match self {
            Promptable::Value(v) => Some(v),
            Promptable::Prompt => None,
        }
    }

    pub fn is_prompt(&self) -> bool {
        matches!(self, Promptable::Prompt)
    }
}

impl fmt::Debug for Promptable {
    // Values may be secrets; never print them
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Promptable::Value(_) => f.write_str("Value(..)"),
            Promptable::Prompt => f.write_str("Prompt"),
        }
    }
}

impl From<&str> for Promptable {
    fn from(v: &str) -> Self {
        Promptable::Value(v.to_string())
    }
}

/// Raw proxy settings as written by the user. Every field is optional here so
/// that an incomplete proxy is reported by [`TargetDescriptor::validate`]
/// rather than by the deserializer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySpec {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Socks4,
    Socks5,
    Http,
}

impl ProxyKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "socks4" => Some(ProxyKind::Socks4),
            "socks5" => Some(ProxyKind::Socks5),
            "http" => Some(ProxyKind::Http),
            _ => None,
        }
    }
}

/// Proxy settings that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidProxy {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub key: String,
    pub value: String,
}

impl EnvironmentVariable {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Merge environment lists. Later lists override earlier ones key by key;
/// an overridden key keeps its first position.
pub fn merge_environment(layers: &[&[EnvironmentVariable]]) -> Vec<EnvironmentVariable> {
    let mut merged: Vec<EnvironmentVariable> = Vec::new();
    for layer in layers {
        for var in layer.iter() {
            match merged.iter_mut().find(|v| v.key == var.key) {
                Some(existing) => existing.value = var.value.clone(),
                None => merged.push(var.clone()),
            }
        }
    }
    merged
}

/// How the transport reaches the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Direct,
    Proxy(ValidProxy),
    Hop(String),
}

/// Result of [`TargetDescriptor::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionPlan {
    pub route: Route,
    pub flags: Flags,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDescriptor {
    /// Logical name, matched case-insensitively
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<Promptable>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<Promptable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<Promptable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<Promptable>,
    /// Agent socket path, or `"env"` for `$SSH_AUTH_SOCK`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxySpec>,
    /// Name of another target to tunnel through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hop: Option<String>,
    #[serde(default = "default_root")]
    pub root: String,
    #[serde(default)]
    pub environment: Vec<EnvironmentVariable>,
    #[serde(default)]
    pub flags: Vec<String>,
    /// Where this descriptor was loaded from. Bookkeeping only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
}

impl fmt::Debug for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetDescriptor")
            .field("name", &self.name)
            .field("host", &self.host.as_ref().map(|h| h.value().unwrap_or("<prompt>")))
            .field("port", &self.port)
            .field("username", &self.username.as_ref().map(|u| u.value().unwrap_or("<prompt>")))
            .field("password", &self.password)
            .field("private_key_path", &self.private_key_path)
            .field("agent", &self.agent)
            .field("proxy", &self.proxy)
            .field("hop", &self.hop)
            .field("root", &self.root)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl TargetDescriptor {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: Some(Promptable::Value(host.into())),
            port: DEFAULT_SSH_PORT,
            username: None,
            password: None,
            private_key_path: None,
            passphrase: None,
            agent: None,
            proxy: None,
            hop: None,
            root: default_root(),
            environment: Vec::new(),
            flags: Vec::new(),
            provenance: None,
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(Promptable::Value(username.into()));
        self
    }

    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_proxy(mut self, proxy: ProxySpec) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_hop(mut self, hop: impl Into<String>) -> Self {
        self.hop = Some(hop.into());
        self
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.push(flag.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.push(EnvironmentVariable::new(key, value));
        self
    }

    /// Case-insensitive logical key
    pub fn key(&self) -> String {
        name_key(&self.name)
    }

    pub fn parsed_flags(&self) -> Flags {
        Flags::parse(&self.flags)
    }

    /// Check everything that has to hold before a socket is opened.
    pub fn validate(&self) -> Result<ConnectionPlan, SshError> {
        if self.name.trim().is_empty() {
            return Err(SshError::Configuration("target name is empty".into()));
        }
        if self.port == 0 {
            return Err(SshError::Configuration(format!(
                "invalid port 0 for target '{}'",
                self.name
            )));
        }
        match &self.host {
            None => {
                return Err(SshError::Configuration(format!(
                    "target '{}' has no host",
                    self.name
                )))
            }
            Some(Promptable::Value(h)) if h.trim().is_empty() => {
                return Err(SshError::Configuration(format!(
                    "target '{}' has an empty host",
                    self.name
                )))
            }
            _ => {}
        }

        let proxy = self.proxy.as_ref().map(|p| self.validate_proxy(p)).transpose()?;

        let route = match (&self.hop, proxy) {
            (Some(_), Some(_)) => {
                return Err(SshError::Configuration(format!(
                    "target '{}' specifies both a proxy and a hop",
                    self.name
                )))
            }
            (Some(hop), None) => {
                if hop.trim().is_empty() {
                    return Err(SshError::Configuration("hop name is empty".into()));
                }
                if name_key(hop) == self.key() {
                    return Err(SshError::Configuration(format!(
                        "target '{}' cannot hop through itself",
                        self.name
                    )));
                }
                Route::Hop(hop.clone())
            }
            (None, Some(proxy)) => Route::Proxy(proxy),
            (None, None) => Route::Direct,
        };

        Ok(ConnectionPlan {
            route,
            flags: self.parsed_flags(),
        })
    }

    fn validate_proxy(&self, proxy: &ProxySpec) -> Result<ValidProxy, SshError> {
        let (Some(kind), Some(host), Some(port)) = (&proxy.kind, &proxy.host, proxy.port) else {
            return Err(SshError::Configuration(format!(
                "proxy for '{}' requires type, host and port",
                self.name
            )));
        };
        let kind = ProxyKind::parse(kind).ok_or_else(|| {
            SshError::Configuration(format!(
                "unsupported proxy type '{}' (expected socks4, socks5 or http)",
                kind
            ))
        })?;
        if host.trim().is_empty() || port == 0 {
            return Err(SshError::Configuration(format!(
                "proxy for '{}' has an empty host or port 0",
                self.name
            )));
        }
        Ok(ValidProxy {
            kind,
            host: host.clone(),
            port,
        })
    }

    /// Structural identity used to reuse an active session.
    ///
    /// Deep, order-sensitive comparison of every field except `provenance`.
    /// Names compare case-insensitively.
    pub fn same_target(&self, other: &TargetDescriptor) -> bool {
        let TargetDescriptor {
            name,
            host,
            port,
            username,
            password,
            private_key_path,
            passphrase,
            agent,
            proxy,
            hop,
            root,
            environment,
            flags,
            provenance: _,
        } = self;

        name_key(name) == other.key()
            && *host == other.host
            && *port == other.port
            && *username == other.username
            && *password == other.password
            && *private_key_path == other.private_key_path
            && *passphrase == other.passphrase
            && *agent == other.agent
            && *proxy == other.proxy
            && *hop == other.hop
            && *root == other.root
            && *environment == other.environment
            && *flags == other.flags
    }

    /// Parse `[user@]host[:port][/root]`. The whole string becomes the name.
    pub fn from_connection_string(input: &str) -> Result<Self, SshError> {
        let re = Regex::new(r"^(?:([^@:/\s]+)@)?([^@:/\s]+)(?::(\d+))?(/.*)?$")
            .map_err(|e| SshError::Configuration(e.to_string()))?;
        let caps = re.captures(input.trim()).ok_or_else(|| {
            SshError::Configuration(format!("invalid connection string '{}'", input))
        })?;

        let mut descriptor = TargetDescriptor::new(input.trim(), &caps[2]);
        if let Some(user) = caps.get(1) {
            descriptor.username = Some(Promptable::Value(user.as_str().to_string()));
        }
        if let Some(port) = caps.get(3) {
            descriptor.port = port.as_str().parse().map_err(|_| {
                SshError::Configuration(format!("invalid port in '{}'", input))
            })?;
        }
        if let Some(path) = caps.get(4) {
            let path = path.as_str();
            // "/~/app" means a home-relative root
            descriptor.root = match path.strip_prefix('/') {
                Some(rest) if rest == HOME_SENTINEL || rest.starts_with("~/") => rest.to_string(),
                _ => path.to_string(),
            };
        }
        Ok(descriptor)
    }
}

pub fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socks5(host: Option<&str>, port: Option<u16>) -> ProxySpec {
        ProxySpec {
            kind: Some("socks5".into()),
            host: host.map(String::from),
            port,
        }
    }

    #[test]
    fn test_proxy_missing_port_is_configuration_error() {
        let d = TargetDescriptor::new("prod", "10.0.0.1").with_proxy(socks5(Some("proxy"), None));
        assert!(matches!(d.validate(), Err(SshError::Configuration(_))));
    }

    #[test]
    fn test_unknown_proxy_type() {
        let d = TargetDescriptor::new("prod", "10.0.0.1").with_proxy(ProxySpec {
            kind: Some("socks6".into()),
            host: Some("proxy".into()),
            port: Some(1080),
        });
        let err = d.validate().unwrap_err();
        assert!(err.to_string().contains("socks6"));
    }

    #[test]
    fn test_valid_routes() {
        let direct = TargetDescriptor::new("a", "h").validate().unwrap();
        assert_eq!(direct.route, Route::Direct);

        let proxied = TargetDescriptor::new("a", "h")
            .with_proxy(socks5(Some("proxy"), Some(1080)))
            .validate()
            .unwrap();
        assert_eq!(
            proxied.route,
            Route::Proxy(ValidProxy {
                kind: ProxyKind::Socks5,
                host: "proxy".into(),
                port: 1080
            })
        );

        let hopped = TargetDescriptor::new("a", "h").with_hop("bastion").validate().unwrap();
        assert_eq!(hopped.route, Route::Hop("bastion".into()));
    }

    #[test]
    fn test_hop_and_proxy_are_exclusive() {
        let d = TargetDescriptor::new("a", "h")
            .with_hop("bastion")
            .with_proxy(socks5(Some("p"), Some(1)));
        assert!(matches!(d.validate(), Err(SshError::Configuration(_))));
        let selfhop = TargetDescriptor::new("A", "h").with_hop("a");
        assert!(selfhop.validate().is_err());
    }

    #[test]
    fn test_same_target_ignores_provenance_and_name_case() {
        let a = TargetDescriptor::new("Prod", "10.0.0.1").with_env("A", "1");
        let mut b = TargetDescriptor::new("prod", "10.0.0.1").with_env("A", "1");
        b.provenance = Some("/etc/oxidefs.json".into());
        assert!(a.same_target(&b));
    }

    #[test]
    fn test_same_target_is_order_sensitive() {
        let a = TargetDescriptor::new("p", "h").with_env("A", "1").with_env("B", "2");
        let b = TargetDescriptor::new("p", "h").with_env("B", "2").with_env("A", "1");
        assert!(!a.same_target(&b));

        let mut c = a.clone();
        c.proxy = Some(ProxySpec::default());
        assert!(!a.same_target(&c));
    }

    #[test]
    fn test_connection_string() {
        let d = TargetDescriptor::from_connection_string("deploy@10.0.0.1:2222/~/app").unwrap();
        assert_eq!(d.name, "deploy@10.0.0.1:2222/~/app");
        assert_eq!(d.host, Some(Promptable::from("10.0.0.1")));
        assert_eq!(d.username, Some(Promptable::from("deploy")));
        assert_eq!(d.port, 2222);
        assert_eq!(d.root, "~/app");

        let bare = TargetDescriptor::from_connection_string("example.com").unwrap();
        assert_eq!(bare.port, DEFAULT_SSH_PORT);
        assert_eq!(bare.root, "~");

        let abs = TargetDescriptor::from_connection_string("h/srv/www").unwrap();
        assert_eq!(abs.root, "/srv/www");

        assert!(TargetDescriptor::from_connection_string("a@b@c").is_err());
    }

    #[test]
    fn test_promptable_json() {
        let d: TargetDescriptor = serde_json::from_str(
            r#"{"name":"prod","host":"10.0.0.1","username":true,"password":"hunter2"}"#,
        )
        .unwrap();
        assert_eq!(d.username, Some(Promptable::Prompt));
        assert_eq!(d.password, Some(Promptable::from("hunter2")));
        assert_eq!(d.root, "~");
        assert!(!format!("{:?}", d).contains("hunter2"));

        let bad = serde_json::from_str::<TargetDescriptor>(r#"{"name":"x","password":false}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_merge_environment_overrides_in_place() {
        let base = vec![EnvironmentVariable::new("A", "1"), EnvironmentVariable::new("B", "2")];
        let over = vec![EnvironmentVariable::new("A", "9"), EnvironmentVariable::new("C", "3")];
        let merged = merge_environment(&[&base, &over]);
        let keys: Vec<_> = merged.iter().map(|v| (v.key.as_str(), v.value.as_str())).collect();
        assert_eq!(keys, vec![("A", "9"), ("B", "2"), ("C", "3")]);
    }
}
