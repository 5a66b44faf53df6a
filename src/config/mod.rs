//! Configuration
//!
//! Target descriptors, flags, resolution and the on-disk descriptor store.

pub mod descriptor;
pub mod flags;
pub mod resolver;
pub mod storage;
pub mod types;

pub use descriptor::{
    merge_environment, ConnectionPlan, EnvironmentVariable, Promptable, ProxyKind, ProxySpec,
    Route, TargetDescriptor, ValidProxy,
};
pub use flags::Flags;
pub use resolver::{ConfigResolver, StaticResolver};
pub use storage::{config_dir, connections_file, ConfigStorage, StorageError};
pub use types::{ConfigFile, RegistryConfig, CONFIG_VERSION};
