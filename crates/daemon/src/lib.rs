//! # Shellbridge Daemon Library
//!
//! This crate provides the server side of Shellbridge: interactive shells
//! on the host machine, served one per WebSocket connection.
//!
//! ## Overview
//!
//! Every shell starts inside a pseudo-terminal with a shared Python virtual
//! environment already activated. The daemon provides:
//!
//! - **Provisioning**: Create the sandbox once and keep its activation script current
//! - **Session Launching**: Build the shell's environment and spawn it in a PTY
//! - **Session Brokering**: Pump output, input and resize events over the connection
//! - **Listening**: Accept WebSocket connections and tear sessions down cleanly
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         ShellServer                          │
//! │            accept loop, session registry, shutdown           │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌──────────────┐   ┌──────────────────┐   ┌─────────────┐  │
//! │  │ Provisioner  │──▶│ SessionLauncher  │──▶│   Session   │  │
//! │  │  (venv +     │   │  (env, shell,    │   │  (PTY +     │  │
//! │  │   init file) │   │   args)          │   │   shell)    │  │
//! │  └──────────────┘   └──────────────────┘   └──────┬──────┘  │
//! │                                                   │         │
//! │  ┌────────────────────────────────────────────────▼──────┐  │
//! │  │                    SessionBroker                      │  │
//! │  │   pty ⇄ {"type":"output"|"input"|"resize"} ⇄ socket   │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use daemon::{Config, Provisioner, ServerSettings, ShellServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     // Make sure the sandbox exists before accepting anyone
//!     let provisioner = Arc::new(Provisioner::from_config(&config));
//!     provisioner.ensure_environment()?;
//!
//!     let server = ShellServer::bind(
//!         config.bind_addr()?,
//!         ServerSettings::from_config(&config),
//!         provisioner,
//!     )
//!     .await?;
//!
//!     // Cancel `server.shutdown_token()` to stop
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading, defaults and environment overrides
//! - [`provision`]: Sandbox creation and the activation script
//! - [`session`]: PTY sessions, launching, brokering and the registry
//! - [`server`]: WebSocket listener

pub mod config;
pub mod provision;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::{Config, ConfigError};

// Re-export provisioning types for convenience
pub use provision::{Environment, EnvironmentBuilder, ProvisionError, Provisioner, VenvBuilder};

// Re-export session types for convenience
pub use session::{
    LaunchError, Session, SessionBroker, SessionError, SessionId, SessionInfo, SessionLauncher,
    SessionOutcome, SessionRegistry, SessionStatus,
};

// Re-export server types for convenience
pub use server::{ServerError, ServerSettings, ShellServer};
