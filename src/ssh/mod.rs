//! SSH module - handles SSH connections and sessions
//!
//! This module provides the core SSH functionality using russh library.
//!
//! # Features
//! - Direct, SOCKS4/5, HTTP CONNECT and hop (SSH-over-SSH) transports
//! - Authentication chain: agent, key, password, keyboard-interactive
//! - Single-owner handle task (`HandleController`)
//! - Connection registry with creation coalescing and an idle reaper
//!   (see `connection_registry`)

mod agent;
pub mod auth;
mod client;
pub mod connection_registry;
pub mod connector;
mod error;
pub mod events;
mod handle_owner;
pub mod proxy;
pub mod reaper;
#[cfg(test)]
pub(crate) mod testing;

pub use agent::{is_agent_available, SshAgentClient};
pub use auth::{NoPrompter, PromptKind, PromptRequest, Prompter};
pub use client::ClientHandler;
pub use connection_registry::{ConnectionRegistry, HopLease, RegistryStats};
pub use connector::{Connector, ConnectorOptions, EstablishedTransport, SshConnector};
pub use error::{RecoveryAction, SshError};
pub use events::{EventChannel, PendingEntry, RegistryEvents, SessionRemoved};
pub use handle_owner::{
    spawn_handle_owner_task, ExecOutput, HandleCommand, HandleController, PingResult,
    TransportClosure,
};
pub use reaper::{IdleReaper, Occupancy, ReaperState};
