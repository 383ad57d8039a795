//! Configuration management for the shellbridge daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/shellbridge/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Port the WebSocket listener binds to unless overridden.
pub const DEFAULT_PORT: u16 = 8083;

/// Environment variable overriding `network.port`.
pub const PORT_ENV: &str = "TERMINAL_PORT";

/// Environment variable overriding `network.host`.
pub const HOST_ENV: &str = "SHELLBRIDGE_HOST";

/// Environment variable overriding `session.shell`.
pub const SHELL_ENV: &str = "SHELLBRIDGE_SHELL";

/// Environment variable overriding `daemon.log_level`.
pub const LOG_LEVEL_ENV: &str = "SHELLBRIDGE_LOG_LEVEL";

/// Environment variable overriding `daemon.work_dir`.
pub const WORK_DIR_ENV: &str = "SHELLBRIDGE_WORK_DIR";

/// Upper bound accepted for `session.max_sessions`.
const MAX_SESSIONS_LIMIT: usize = 10_000;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("port must be non-zero")]
    InvalidPort,

    #[error("host is not a valid IP address: {0}")]
    InvalidHost(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("default terminal size must be positive, got {cols}x{rows}")]
    InvalidDefaultSize { cols: u16, rows: u16 },

    #[error("max_sessions must be at most 10000 (0 = unlimited), got {0}")]
    InvalidMaxSessions(usize),

    #[error("shell not found: {0}")]
    InvalidShellPath(String),

    #[error("interpreter must not be empty")]
    EmptyInterpreter,

    #[error("environment {0} must be a plain file name")]
    InvalidEnvironmentName(&'static str),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the shellbridge daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Listener configuration.
    pub network: NetworkConfig,

    /// Shell session configuration.
    pub session: SessionConfig,

    /// Sandbox provisioning configuration.
    pub environment: EnvironmentConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory shells start in; the sandbox and activation script live here.
    pub work_dir: PathBuf,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind.
    pub host: String,

    /// TCP port for the WebSocket listener.
    pub port: u16,
}

/// Shell session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell executable spawned for each connection.
    pub shell: String,

    /// Value of `TERM` in the spawned shell.
    pub term: String,

    /// Initial terminal width.
    pub default_cols: u16,

    /// Initial terminal height.
    pub default_rows: u16,

    /// Maximum concurrent sessions; 0 means unlimited.
    pub max_sessions: usize,

    /// How long a hung-up shell gets to exit before it is killed.
    pub kill_grace_ms: u64,
}

/// Sandbox provisioning configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Interpreter invoked as `<interpreter> -m venv <dir>`.
    pub interpreter: String,

    /// Sandbox directory name under the work dir.
    pub dir_name: String,

    /// Activation script file name under the work dir.
    pub init_script: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            work_dir: default_work_dir(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            term: "xterm-256color".to_string(),
            default_cols: 80,
            default_rows: 24,
            max_sessions: 0,
            kill_grace_ms: 2000,
        }
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            dir_name: "venv".to_string(),
            init_script: "init_python_env.sh".to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shellbridge")
        .join("config.toml")
}

/// Returns the process working directory, or `.` if it cannot be read.
fn default_work_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Returns the user's shell, falling back to bash.
fn default_shell() -> String {
    match std::env::var("SHELL") {
        Ok(shell) if !shell.is_empty() => shell,
        _ => "bash".to_string(),
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMINAL_PORT: listener port
    /// - SHELLBRIDGE_HOST: listener address
    /// - SHELLBRIDGE_SHELL: shell executable
    /// - SHELLBRIDGE_LOG_LEVEL: log level
    /// - SHELLBRIDGE_WORK_DIR: working directory for shells and the sandbox
    ///
    /// Empty values are ignored. An unparsable port is logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(port) = non_empty_var(PORT_ENV) {
            match port.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Overriding port from environment: {}", port);
                    self.network.port = port;
                }
                Err(e) => {
                    tracing::warn!("Ignoring invalid {}={:?}: {}", PORT_ENV, port, e);
                }
            }
        }

        if let Some(host) = non_empty_var(HOST_ENV) {
            tracing::info!("Overriding host from environment: {}", host);
            self.network.host = host;
        }

        if let Some(shell) = non_empty_var(SHELL_ENV) {
            tracing::info!("Overriding shell from environment: {}", shell);
            self.session.shell = shell;
        }

        if let Some(level) = non_empty_var(LOG_LEVEL_ENV) {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.daemon.log_level = level;
        }

        if let Some(dir) = non_empty_var(WORK_DIR_ENV) {
            tracing::info!("Overriding work_dir from environment: {}", dir);
            self.daemon.work_dir = PathBuf::from(dir);
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        if self.network.host.parse::<std::net::IpAddr>().is_err() {
            return Err(ConfigError::InvalidHost(self.network.host.clone()));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        if self.session.default_cols == 0 || self.session.default_rows == 0 {
            return Err(ConfigError::InvalidDefaultSize {
                cols: self.session.default_cols,
                rows: self.session.default_rows,
            });
        }

        if self.session.max_sessions > MAX_SESSIONS_LIMIT {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        let shell_path = Path::new(&self.session.shell);
        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(self.session.shell.clone()));
            }
        } else if which::which(&self.session.shell).is_err() {
            return Err(ConfigError::InvalidShellPath(self.session.shell.clone()));
        }

        if self.environment.interpreter.trim().is_empty() {
            return Err(ConfigError::EmptyInterpreter);
        }

        if !is_plain_file_name(&self.environment.dir_name) {
            return Err(ConfigError::InvalidEnvironmentName("dir_name"));
        }

        if !is_plain_file_name(&self.environment.init_script) {
            return Err(ConfigError::InvalidEnvironmentName("init_script"));
        }

        Ok(())
    }

    /// Returns the socket address the listener should bind.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let ip: std::net::IpAddr = self
            .network
            .host
            .parse()
            .with_context(|| format!("Invalid host address: {}", self.network.host))?;
        Ok(SocketAddr::new(ip, self.network.port))
    }

    /// Sandbox directory under the work dir.
    pub fn environment_dir(&self) -> PathBuf {
        self.daemon.work_dir.join(&self.environment.dir_name)
    }

    /// Activation script path under the work dir.
    pub fn init_script_path(&self) -> PathBuf {
        self.daemon.work_dir.join(&self.environment.init_script)
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    /// Config that validates on any unix host regardless of $SHELL.
    fn valid_config() -> Config {
        let mut config = Config::default();
        config.session.shell = "/bin/sh".to_string();
        config
    }

    fn clear_env() {
        for key in [PORT_ENV, HOST_ENV, SHELL_ENV, LOG_LEVEL_ENV, WORK_DIR_ENV] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.network.host, "0.0.0.0");
        assert_eq!(config.network.port, 8083);
        assert_eq!(config.session.term, "xterm-256color");
        assert_eq!(config.session.default_cols, 80);
        assert_eq!(config.session.default_rows, 24);
        assert_eq!(config.session.max_sessions, 0);
        assert_eq!(config.session.kill_grace_ms, 2000);
        assert_eq!(config.environment.interpreter, "python3");
        assert_eq!(config.environment.dir_name, "venv");
        assert_eq!(config.environment.init_script, "init_python_env.sh");
    }

    #[test]
    fn test_default_shell_not_empty() {
        assert!(!SessionConfig::default().shell.is_empty());
    }

    #[test]
    fn test_environment_paths_under_work_dir() {
        let mut config = Config::default();
        config.daemon.work_dir = PathBuf::from("/srv/project");

        assert_eq!(config.environment_dir(), PathBuf::from("/srv/project/venv"));
        assert_eq!(
            config.init_script_path(),
            PathBuf::from("/srv/project/init_python_env.sh")
        );
    }

    #[test]
    fn test_bind_addr() {
        let mut config = Config::default();
        config.network.host = "127.0.0.1".to_string();
        config.network.port = 9000;

        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:9000");
    }

    #[test]
    fn test_bind_addr_invalid_host() {
        let mut config = Config::default();
        config.network.host = "not-an-ip".to_string();
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[network]
port = 9100

[session]
max_sessions = 4
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.network.port, 9100);
        assert_eq!(config.network.host, "0.0.0.0");
        assert_eq!(config.session.max_sessions, 4);
        assert_eq!(config.session.default_cols, 80);
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
log_level = "debug"
work_dir = "/tmp/work"

[network]
host = "127.0.0.1"
port = 7000

[session]
shell = "/bin/bash"
term = "xterm"
default_cols = 100
default_rows = 30
max_sessions = 8
kill_grace_ms = 500

[environment]
interpreter = "python3.12"
dir_name = ".venv"
init_script = "activate.sh"
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.daemon.work_dir, PathBuf::from("/tmp/work"));
        assert_eq!(config.network.host, "127.0.0.1");
        assert_eq!(config.network.port, 7000);
        assert_eq!(config.session.shell, "/bin/bash");
        assert_eq!(config.session.term, "xterm");
        assert_eq!(config.session.default_cols, 100);
        assert_eq!(config.session.default_rows, 30);
        assert_eq!(config.session.max_sessions, 8);
        assert_eq!(config.session.kill_grace_ms, 500);
        assert_eq!(config.environment.interpreter, "python3.12");
        assert_eq!(config.environment.dir_name, ".venv");
        assert_eq!(config.environment.init_script, "activate.sh");
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[network\nport = 1");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[network]
port = "eighty"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut config = Config::default();
        config.network.port = 4444;
        config.session.max_sessions = 3;
        config.environment.dir_name = "sandbox".to_string();

        let toml = config.to_toml().unwrap();
        assert_eq!(Config::from_toml(&toml).unwrap(), config);
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(temp_dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.network.port = 8123;
        config.save(&path).unwrap();

        assert!(path.exists());
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "this is [not valid").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("shellbridge/config.toml"));
    }

    #[test]
    fn test_validate_default_like_config() {
        assert_eq!(valid_config().validate(), Ok(()));
    }

    #[test]
    fn test_validate_port_zero() {
        let mut config = valid_config();
        config.network.port = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPort));
    }

    #[test]
    fn test_validate_invalid_host() {
        let mut config = valid_config();
        config.network.host = "localhost:80".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidHost(_))));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = valid_config();
        config.daemon.log_level = "WARN".to_string();
        assert_eq!(config.validate(), Ok(()));

        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_validate_default_size() {
        let mut config = valid_config();
        config.session.default_rows = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidDefaultSize { cols: 80, rows: 0 })
        );
    }

    #[test]
    fn test_validate_max_sessions_bounds() {
        let mut config = valid_config();
        config.session.max_sessions = 0;
        assert!(config.validate().is_ok());

        config.session.max_sessions = MAX_SESSIONS_LIMIT;
        assert!(config.validate().is_ok());

        config.session.max_sessions = MAX_SESSIONS_LIMIT + 1;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidMaxSessions(MAX_SESSIONS_LIMIT + 1))
        );
    }

    #[test]
    fn test_validate_missing_absolute_shell() {
        let mut config = valid_config();
        config.session.shell = "/nonexistent/shell".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidShellPath("/nonexistent/shell".to_string()))
        );
    }

    #[test]
    fn test_validate_shell_resolved_on_path() {
        let mut config = valid_config();
        config.session.shell = "sh".to_string();
        assert!(config.validate().is_ok());

        config.session.shell = "definitely-not-a-shell-xyz".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(_))
        ));
    }

    #[test]
    fn test_validate_environment_names() {
        let mut config = valid_config();
        config.environment.interpreter = "  ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::EmptyInterpreter));

        let mut config = valid_config();
        config.environment.dir_name = "../escape".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidEnvironmentName("dir_name"))
        );

        let mut config = valid_config();
        config.environment.init_script = String::new();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidEnvironmentName("init_script"))
        );
    }

    #[test]
    #[serial]
    fn test_env_override_port() {
        clear_env();
        std::env::set_var(PORT_ENV, "9555");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.network.port, 9555);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_port_ignored() {
        clear_env();
        std::env::set_var(PORT_ENV, "not-a-port");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.network.port, DEFAULT_PORT);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        clear_env();
        std::env::set_var(SHELL_ENV, "");
        std::env::set_var(LOG_LEVEL_ENV, "");

        let mut config = Config::default();
        let original = config.clone();
        config.apply_env_overrides();
        assert_eq!(config, original);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_shell_host_level_work_dir() {
        clear_env();
        std::env::set_var(SHELL_ENV, "/bin/sh");
        std::env::set_var(HOST_ENV, "127.0.0.1");
        std::env::set_var(LOG_LEVEL_ENV, "trace");
        std::env::set_var(WORK_DIR_ENV, "/var/tmp/bridge");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.session.shell, "/bin/sh");
        assert_eq!(config.network.host, "127.0.0.1");
        assert_eq!(config.daemon.log_level, "trace");
        assert_eq!(config.daemon.work_dir, PathBuf::from("/var/tmp/bridge"));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_unset_does_not_override() {
        clear_env();

        let mut config = Config::default();
        let original = config.clone();
        config.apply_env_overrides();
        assert_eq!(config, original);
    }
}
