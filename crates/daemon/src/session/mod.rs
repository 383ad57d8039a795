//! Shell sessions.
//!
//! This module provides PTY spawning, the launcher that wires shells to the
//! provisioned environment, the broker that pumps a session over its
//! connection, and the registry of live sessions.

pub mod broker;
pub mod launcher;
pub mod pty;
pub mod registry;

pub use broker::{SessionBroker, SessionOutcome, Transport};
pub use launcher::{LaunchError, SessionLauncher};
pub use pty::{Session, SessionError, SessionId, SessionStatus, ShellCommand};
pub use registry::{SessionInfo, SessionRegistry, SessionSlot};
