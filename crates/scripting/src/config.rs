//! Configuration management for scripting.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/scripting/config.toml`.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rendezvous::DEFAULT_RENDEZVOUS_PORT;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::streamer::DEFAULT_READ_BUFFER_SIZE;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("read_buffer_size must be between 1 and {max}, got {got}")]
    InvalidReadBufferSize { got: usize, max: usize },

    #[error("rendezvous host must be an IP address, got {0}")]
    InvalidHost(String),

    #[error("rendezvous timeout must be between 0 and 3600 seconds, got {0}")]
    InvalidTimeout(u64),

    #[error("terminal program must not be empty")]
    EmptyTerminalProgram,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Largest accepted single read.
const MAX_READ_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ScriptingConfig {
    /// Child process configuration.
    pub process: ProcessConfig,

    /// Terminal rendezvous configuration.
    pub rendezvous: RendezvousConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Child process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessConfig {
    /// Shell used to interpret commands, invoked as `<shell> -c <cmd>`.
    pub shell: String,

    /// Kill the child when its streamer is dropped before it exited.
    pub kill_on_drop: bool,

    /// Size of a single pipe read in bytes.
    pub read_buffer_size: usize,
}

/// Terminal multiplexer used to open interactive windows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TerminalKind {
    /// GNU screen: `screen -t <title> ...`.
    #[default]
    Screen,
    /// tmux: `tmux new-window -n <title> ...`.
    Tmux,
}

/// Terminal rendezvous configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Address the rendezvous listener binds to.
    pub host: String,

    /// Port the rendezvous listener binds to. 0 picks a free port.
    pub port: u16,

    /// Seconds to wait for a terminal to connect (0 = no timeout).
    pub timeout_secs: u64,

    /// Terminal multiplexer flavour.
    pub terminal: TerminalKind,

    /// Terminal multiplexer executable.
    pub terminal_program: String,

    /// Program used inside the window to dial the listener.
    pub netcat_program: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            kill_on_drop: true,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_RENDEZVOUS_PORT,
            timeout_secs: 0,
            terminal: TerminalKind::Screen,
            terminal_program: "screen".to_string(),
            netcat_program: "nc".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl RendezvousConfig {
    /// Returns the connect timeout, or `None` to wait forever.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("scripting")
        .join("config.toml")
}

/// Returns the default shell used to interpret commands.
fn default_shell() -> String {
    "/bin/sh".to_string()
}

impl ScriptingConfig {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SCRIPTING_SHELL: Override the command shell
    /// - SCRIPTING_RENDEZVOUS_PORT: Override the rendezvous port
    /// - SCRIPTING_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(shell) = std::env::var("SCRIPTING_SHELL") {
            if !shell.is_empty() {
                tracing::info!("Overriding shell from environment: {}", shell);
                self.process.shell = shell;
            }
        }

        if let Ok(port) = std::env::var("SCRIPTING_RENDEZVOUS_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Overriding rendezvous port from environment: {}", port);
                    self.rendezvous.port = port;
                }
                Err(_) if port.is_empty() => {}
                Err(e) => {
                    tracing::warn!("Ignoring SCRIPTING_RENDEZVOUS_PORT={:?}: {}", port, e);
                }
            }
        }

        if let Ok(level) = std::env::var("SCRIPTING_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.logging.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let shell_path = Path::new(&self.process.shell);
        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(self.process.shell.clone()));
            }
        } else if which::which(&self.process.shell).is_err() {
            return Err(ConfigError::InvalidShellPath(self.process.shell.clone()));
        }

        let size = self.process.read_buffer_size;
        if size == 0 || size > MAX_READ_BUFFER_SIZE {
            return Err(ConfigError::InvalidReadBufferSize {
                got: size,
                max: MAX_READ_BUFFER_SIZE,
            });
        }

        if self.rendezvous.host.parse::<IpAddr>().is_err() {
            return Err(ConfigError::InvalidHost(self.rendezvous.host.clone()));
        }

        if self.rendezvous.timeout_secs > 3600 {
            return Err(ConfigError::InvalidTimeout(self.rendezvous.timeout_secs));
        }

        if self.rendezvous.terminal_program.trim().is_empty() {
            return Err(ConfigError::EmptyTerminalProgram);
        }

        let level = self.logging.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
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

    /// Save configuration to a file, creating parent directories.
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

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
