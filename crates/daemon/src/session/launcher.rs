//! Shell launching.
//!
//! Turns a connection's request into a running [`Session`]: picks the
//! shell, builds its environment on top of the provisioned sandbox, and
//! spawns it inside a new PTY.

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;

use super::pty::{Session, SessionError, ShellCommand};
use crate::provision::Environment;

/// Variable recording the sandbox root, as `activate` would set it.
pub const VIRTUAL_ENV_VAR: &str = "VIRTUAL_ENV";

/// Errors that can occur while launching a session.
#[derive(Error, Debug)]
pub enum LaunchError {
    /// The requested terminal has a zero dimension.
    #[error("invalid terminal size: {cols}x{rows}")]
    InvalidSize { cols: u16, rows: u16 },

    /// The working directory does not exist.
    #[error("working directory does not exist: {0}")]
    MissingWorkDir(std::path::PathBuf),

    /// PTY allocation or process spawn failed.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Spawns shells wired to a provisioned environment.
#[derive(Debug, Clone)]
pub struct SessionLauncher {
    environment: Environment,
    shell: String,
    term: String,
}

impl SessionLauncher {
    /// Creates a launcher for `shell` using the given environment.
    pub fn new(environment: Environment, shell: impl Into<String>, term: impl Into<String>) -> Self {
        Self {
            environment,
            shell: shell.into(),
            term: term.into(),
        }
    }

    /// Returns the shell executable this launcher spawns.
    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Returns the environment sessions are wired to.
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Spawns a shell in `cwd` with a `cols`x`rows` terminal.
    ///
    /// `base_env` is usually the daemon's own environment; the sandbox
    /// variables are layered on top of it.
    pub fn launch<I>(
        &self,
        cwd: &Path,
        base_env: I,
        cols: u16,
        rows: u16,
    ) -> Result<Session, LaunchError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        if cols == 0 || rows == 0 {
            return Err(LaunchError::InvalidSize { cols, rows });
        }

        if !cwd.is_dir() {
            return Err(LaunchError::MissingWorkDir(cwd.to_path_buf()));
        }

        let env = build_environment(base_env, &self.environment, &self.term);
        let command = ShellCommand {
            program: self.shell.clone(),
            args: shell_args(&self.shell, &self.environment.activation_script),
            env: env.into_iter().collect(),
            cwd: cwd.to_path_buf(),
        };

        let session = Session::spawn(command, cols, rows)?;

        tracing::info!(
            session_id = %session.id(),
            pid = ?session.pid(),
            shell = %self.shell,
            cwd = %session.cwd().display(),
            cols = cols,
            rows = rows,
            "Launched shell"
        );

        Ok(session)
    }
}

/// Builds a shell's environment from `base_env`.
///
/// Sets `VIRTUAL_ENV` and `TERM`, and puts the sandbox `bin` directory in
/// front of `PATH`. Existing `PATH` entries are kept in their order.
pub fn build_environment<I>(base_env: I, environment: &Environment, term: &str) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: BTreeMap<String, String> = base_env.into_iter().collect();

    env.insert(
        VIRTUAL_ENV_VAR.to_string(),
        environment.root.to_string_lossy().into_owned(),
    );
    env.insert("TERM".to_string(), term.to_string());

    let bin_dir = environment.bin_dir.to_string_lossy().into_owned();
    let path = match env.get("PATH") {
        Some(existing) if !existing.is_empty() => format!("{}:{}", bin_dir, existing),
        _ => bin_dir,
    };
    env.insert("PATH".to_string(), path);

    env
}

/// Arguments that make `shell` run the activation script on startup.
///
/// Only bash understands `--init-file`; other shells get no arguments and
/// rely on the exported `VIRTUAL_ENV` and `PATH`.
pub fn shell_args(shell: &str, activation_script: &Path) -> Vec<String> {
    let name = Path::new(shell)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    if name == "bash" {
        vec![
            "--init-file".to_string(),
            activation_script.to_string_lossy().into_owned(),
        ]
    } else {
        Vec::new()
    }
}
