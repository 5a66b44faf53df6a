//! Session Management Module
//!
//! A session is one authenticated transport plus what was negotiated on it:
//! - `types`: the `Session` record and its consumer bookkeeping
//! - `shell`: shell families and their command syntax
//! - `negotiator`: shell, home directory and remote-command probes
//! - `remote_command`: the `::sshfs:` marker channel
//! - `recovery`: failure and closure advice for the UI layer

pub mod negotiator;
pub mod recovery;
pub mod remote_command;
pub mod shell;
pub mod types;

pub use negotiator::{negotiate, NegotiatedSession, NegotiationOptions};
pub use recovery::{ClosureAdvice, CreationFailure, RemovalReason};
pub use remote_command::{RemoteCommand, RemoteCommandChannel, RemoteCommandHandler};
pub use shell::{ShellInfo, ShellProfile, UNKNOWN_SHELL};
pub(crate) use types::SessionParts;
pub use types::{
    FilesystemEntry, FilesystemState, Session, SessionSummary, SessionUsage, TerminalEntry,
    TerminalKind,
};
