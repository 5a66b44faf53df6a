//! OxideFS - connection lifecycle and multiplexing core
//!
//! Exposes a remote machine over SSH/SFTP to an editor: one authenticated
//! transport per logical target, shared by filesystem handles, terminals,
//! tasks and port forwards, and closed once nothing uses it anymore.
//!
//! ```ignore
//! let registry = ConnectionRegistry::with_ssh(config, resolver, prompter, None);
//! let fs = RemoteFilesystem::open(&registry, "prod").await?;
//! let term = RemoteTerminal::open(&registry, "prod", None, TerminalSize::default()).await?;
//! let forwards = ForwardingManager::new(registry.clone());
//! forwards.open("prod", ForwardingSpec::parse("L 8080 localhost:80")?).await?;
//! ```

pub mod config;
pub mod consumer;
pub mod forwarding;
pub mod session;
pub mod ssh;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::{ConfigResolver, RegistryConfig, StaticResolver, TargetDescriptor};
pub use consumer::{RemoteFilesystem, RemoteTask, RemoteTerminal, TerminalSize};
pub use forwarding::{ActiveForwarding, ForwardingManager, ForwardingSpec};
pub use session::{CreationFailure, RemovalReason, Session};
pub use ssh::{ConnectionRegistry, SshError};

/// Install a `tracing` subscriber filtered by `RUST_LOG` (default `info`).
///
/// For binaries and tests; the library never installs one itself. Fails if a
/// global subscriber is already set.
pub fn init_logging() -> Result<(), tracing_subscriber::util::TryInitError> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
}
