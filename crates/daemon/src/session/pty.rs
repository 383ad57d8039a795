//! PTY session primitives.
//!
//! A [`Session`] is one shell process attached to one pseudo-terminal.
//! It owns every handle exclusively; the broker takes them apart with
//! [`Session::into_parts`] to drive the two I/O directions concurrently.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, ExitStatus, MasterPty, PtySize};
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a session, used for log correlation.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Failed to allocate the pseudo-terminal.
    #[error("failed to open PTY: {0}")]
    OpenFailed(String),

    /// Failed to spawn the shell.
    #[error("failed to spawn {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to signal or kill the shell.
    #[error("failed to kill session: {0}")]
    KillFailed(String),
}

/// Final status of a session's shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Shell exited with a code.
    Exited(u32),
    /// Shell exit could not be observed.
    Terminated,
}

impl From<ExitStatus> for SessionStatus {
    fn from(status: ExitStatus) -> Self {
        SessionStatus::Exited(status.exit_code())
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Exited(code) => write!(f, "status {}", code),
            SessionStatus::Terminated => write!(f, "unknown status"),
        }
    }
}

/// The process to run inside a new pseudo-terminal.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    /// Executable name or path.
    pub program: String,
    /// Arguments after the program name.
    pub args: Vec<String>,
    /// Complete child environment; nothing else is inherited.
    pub env: Vec<(String, String)>,
    /// Working directory.
    pub cwd: PathBuf,
}

/// A PTY session with a shell process.
pub struct Session {
    id: SessionId,
    master: Box<dyn MasterPty + Send>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    pid: Option<u32>,
    cwd: PathBuf,
}

/// The handles of a session, split for independent ownership.
pub struct SessionParts {
    pub id: SessionId,
    pub pid: Option<u32>,
    /// Control handle, used for resizing.
    pub master: Box<dyn MasterPty + Send>,
    /// Shell output.
    pub reader: Box<dyn Read + Send>,
    /// Shell input.
    pub writer: Box<dyn Write + Send>,
    pub child: Box<dyn Child + Send + Sync>,
    pub killer: Box<dyn ChildKiller + Send + Sync>,
}

impl Session {
    /// Opens a new PTY of the given size and spawns `command` as its
    /// session leader.
    pub fn spawn(command: ShellCommand, cols: u16, rows: u16) -> Result<Self, SessionError> {
        let id = Uuid::new_v4().to_string();

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(cols, rows))
            .map_err(|e| SessionError::OpenFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&command.program);
        cmd.args(&command.args);
        cmd.cwd(&command.cwd);
        cmd.env_clear();
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        let spawn_failed = |e: anyhow::Error| SessionError::SpawnFailed {
            program: command.program.clone(),
            reason: e.to_string(),
        };

        let child = pair.slave.spawn_command(cmd).map_err(spawn_failed)?;
        // Only the child may hold the slave side, or the reader never sees EOF.
        drop(pair.slave);

        let pid = child.process_id();
        let reader = pair.master.try_clone_reader().map_err(spawn_failed)?;
        let writer = pair.master.take_writer().map_err(spawn_failed)?;

        tracing::debug!(
            session_id = %id,
            pid = ?pid,
            program = %command.program,
            cols = cols,
            rows = rows,
            "Spawned shell"
        );

        Ok(Session {
            id,
            master: pair.master,
            reader,
            writer,
            child,
            pid,
            cwd: command.cwd,
        })
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the shell's starting directory.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Returns the live terminal size as `(cols, rows)`.
    pub fn size(&self) -> Result<(u16, u16), SessionError> {
        let size = self
            .master
            .get_size()
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
        Ok((size.cols, size.rows))
    }

    /// Splits the session into its owned handles.
    pub fn into_parts(self) -> SessionParts {
        let killer = self.child.clone_killer();
        SessionParts {
            id: self.id,
            pid: self.pid,
            master: self.master,
            reader: self.reader,
            writer: self.writer,
            child: self.child,
            killer,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("cwd", &self.cwd)
            .finish_non_exhaustive()
    }
}

/// Applies a new size to a live PTY.
pub fn resize_pty(master: &dyn MasterPty, cols: u16, rows: u16) -> Result<(), SessionError> {
    master
        .resize(pty_size(cols, rows))
        .map_err(|e| SessionError::ResizeFailed(e.to_string()))
}

/// Sends SIGHUP to the shell, the signal a terminal hangup delivers.
///
/// Interactive shells ignore SIGTERM but exit on SIGHUP.
pub fn hang_up(pid: u32) -> Result<(), SessionError> {
    signal(pid, Signal::SIGHUP)
}

/// Sends SIGKILL to the shell.
pub fn force_kill(pid: u32) -> Result<(), SessionError> {
    signal(pid, Signal::SIGKILL)
}

fn signal(pid: u32, signal: Signal) -> Result<(), SessionError> {
    let pid = i32::try_from(pid).map_err(|e| SessionError::KillFailed(e.to_string()))?;
    kill(Pid::from_raw(pid), signal).map_err(|e| SessionError::KillFailed(e.to_string()))
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}
