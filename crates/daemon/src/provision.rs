//! Sandbox environment provisioning.
//!
//! Before any shell is launched, the daemon makes sure a Python virtual
//! environment exists under the work dir and (re)writes the bash init file
//! that activates it. Creation happens at most once per process; every
//! later call only refreshes the activation script.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use thiserror::Error;

use crate::config::Config;

/// Errors that can occur while provisioning the sandbox.
///
/// All of these are fatal at startup.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// The interpreter could not be started at all.
    #[error("failed to run {interpreter}: {source}")]
    InterpreterSpawn {
        interpreter: String,
        #[source]
        source: io::Error,
    },

    /// The interpreter ran but reported failure.
    #[error("{interpreter} -m venv exited with {status}")]
    InterpreterFailed {
        interpreter: String,
        status: ExitStatus,
    },

    /// The interpreter succeeded but left no environment behind.
    #[error("environment directory missing after setup: {0}")]
    MissingDirectory(PathBuf),

    /// Writing the activation script failed.
    #[error("failed to write activation script {path}: {source}")]
    Script {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A provisioned sandbox, shared read-only by every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    /// Root of the virtual environment (`VIRTUAL_ENV`).
    pub root: PathBuf,
    /// Executable directory prepended to `PATH`.
    pub bin_dir: PathBuf,
    /// Bash init file that activates the environment.
    pub activation_script: PathBuf,
}

impl Environment {
    /// Describes the sandbox layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, activation_script: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let bin_dir = root.join("bin");
        Self {
            root,
            bin_dir,
            activation_script: activation_script.into(),
        }
    }
}

/// Performs the heavy, one-time environment creation.
pub trait EnvironmentBuilder: Send + Sync {
    /// Creates an isolated environment at `dir`.
    fn build(&self, dir: &Path) -> Result<(), ProvisionError>;
}

/// Builds environments with `<interpreter> -m venv <dir>`.
#[derive(Debug, Clone)]
pub struct VenvBuilder {
    interpreter: String,
}

impl VenvBuilder {
    /// Creates a builder using the given interpreter executable.
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

impl EnvironmentBuilder for VenvBuilder {
    fn build(&self, dir: &Path) -> Result<(), ProvisionError> {
        tracing::info!(
            interpreter = %self.interpreter,
            dir = %dir.display(),
            "Setting up Python virtual environment"
        );

        let status = Command::new(&self.interpreter)
            .arg("-m")
            .arg("venv")
            .arg(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|source| ProvisionError::InterpreterSpawn {
                interpreter: self.interpreter.clone(),
                source,
            })?;

        if !status.success() {
            return Err(ProvisionError::InterpreterFailed {
                interpreter: self.interpreter.clone(),
                status,
            });
        }

        Ok(())
    }
}

/// Ensures the sandbox exists and keeps its activation script current.
///
/// Concurrent first calls are serialised so a spawning shell never sees a
/// half-built environment.
pub struct Provisioner {
    environment: Environment,
    builder: Box<dyn EnvironmentBuilder>,
    ready: AtomicBool,
    guard: Mutex<()>,
}

impl Provisioner {
    /// Creates a provisioner for the given layout and builder.
    pub fn new(environment: Environment, builder: Box<dyn EnvironmentBuilder>) -> Self {
        Self {
            environment,
            builder,
            ready: AtomicBool::new(false),
            guard: Mutex::new(()),
        }
    }

    /// Creates a `venv`-backed provisioner from the daemon configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Environment::new(config.environment_dir(), config.init_script_path()),
            Box::new(VenvBuilder::new(config.environment.interpreter.clone())),
        )
    }

    /// Returns the sandbox layout, provisioned or not.
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Makes sure the environment exists, then rewrites the activation script.
    ///
    /// Blocking. The builder runs only if the directory is absent and no
    /// earlier call has succeeded.
    pub fn ensure_environment(&self) -> Result<Environment, ProvisionError> {
        let _guard = self
            .guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if !self.ready.load(Ordering::Acquire) {
            let root = &self.environment.root;
            if root.is_dir() {
                tracing::debug!(dir = %root.display(), "Environment already present");
            } else {
                self.builder.build(root)?;
                if !root.is_dir() {
                    return Err(ProvisionError::MissingDirectory(root.clone()));
                }
                tracing::info!(dir = %root.display(), "Environment created");
            }
            self.ready.store(true, Ordering::Release);
        }

        write_activation_script(&self.environment)?;

        Ok(self.environment.clone())
    }
}

/// Renders the bash init file for `environment`.
///
/// Bash skips `~/.bashrc` when started with `--init-file`, so the script
/// loads it first and then activates the sandbox on top of it.
pub fn activation_script(environment: &Environment) -> String {
    let activate = environment.bin_dir.join("activate");
    let activate = shell_quote(&activate.to_string_lossy());

    format!(
        "#!/bin/bash\n\
         # Load the user's interactive configuration\n\
         if [ -f \"$HOME/.bashrc\" ]; then\n\
         \x20   . \"$HOME/.bashrc\"\n\
         fi\n\
         # Activate the virtual environment\n\
         if [ -f {activate} ]; then\n\
         \x20   . {activate}\n\
         fi\n"
    )
}

fn write_activation_script(environment: &Environment) -> Result<(), ProvisionError> {
    let path = &environment.activation_script;
    let script_err = |source| ProvisionError::Script {
        path: path.clone(),
        source,
    };

    // Write beside the target and rename so readers never see a partial file.
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    fs::write(&tmp_path, activation_script(environment)).map_err(script_err)?;
    fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o755)).map_err(script_err)?;
    fs::rename(&tmp_path, path).map_err(script_err)?;

    tracing::debug!(path = %path.display(), "Activation script written");
    Ok(())
}

/// Single-quotes `value` for a POSIX shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
