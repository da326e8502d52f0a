//! Supervisor configuration with file loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mpv::default_ipc_path;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("Failed to read config {path}: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("Invalid config JSON: {0}")]
  Json(#[from] serde_json::Error),
  #[error("{0}")]
  Invalid(String),
}

/// Supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorConfig {
  /// Custom MPV executable path (None = auto-detect).
  #[serde(default)]
  pub mpv_path: Option<PathBuf>,

  /// Control socket (named pipe on Windows) MPV is told to listen on.
  #[serde(default = "default_ipc_path")]
  pub socket_path: PathBuf,

  /// Additional MPV command-line arguments.
  #[serde(default)]
  pub extra_args: Vec<String>,

  /// Connection attempts per connect cycle.
  #[serde(default = "default_connect_attempts")]
  pub connect_attempts: u32,

  /// Pause between connect attempts, reconnects and readiness polls.
  #[serde(default = "default_retry_interval_ms")]
  pub retry_interval_ms: u64,

  /// How many retry intervals `play` waits for a connection.
  #[serde(default = "default_play_wait_attempts")]
  pub play_wait_attempts: u32,

  /// Volume set right after connecting.
  #[serde(default = "default_initial_volume")]
  pub initial_volume: u32,

  #[serde(default = "default_response_timeout_ms")]
  pub response_timeout_ms: u64,

  /// Upper bound on waiting for background tasks in `stop`.
  #[serde(default = "default_stop_timeout_ms")]
  pub stop_timeout_ms: u64,
}

/// Upper bound for the attempt counts.
const MAX_ATTEMPTS: u32 = 100;

const MAX_RETRY_INTERVAL_MS: u64 = 60_000;

fn default_connect_attempts() -> u32 {
  3
}

fn default_retry_interval_ms() -> u64 {
  1000
}

fn default_play_wait_attempts() -> u32 {
  5
}

fn default_initial_volume() -> u32 {
  100
}

fn default_response_timeout_ms() -> u64 {
  5000
}

fn default_stop_timeout_ms() -> u64 {
  3000
}

impl Default for SupervisorConfig {
  fn default() -> Self {
    Self {
      mpv_path: None,
      socket_path: default_ipc_path(),
      extra_args: Vec::new(),
      connect_attempts: default_connect_attempts(),
      retry_interval_ms: default_retry_interval_ms(),
      play_wait_attempts: default_play_wait_attempts(),
      initial_volume: default_initial_volume(),
      response_timeout_ms: default_response_timeout_ms(),
      stop_timeout_ms: default_stop_timeout_ms(),
    }
  }
}

impl SupervisorConfig {
  /// Default config file location: `<config dir>/mpv-supervisor/config.json`.
  pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("mpv-supervisor").join("config.json"))
  }

  /// Load and validate a config file.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    let config: Self = serde_json::from_str(&text)?;
    config.validate()?;
    log::info!("Loaded config from {}", path.display());
    Ok(config)
  }

  /// Load the default config file, falling back to defaults when it is absent.
  pub fn load_or_default() -> Result<Self, ConfigError> {
    match Self::default_path() {
      Some(path) if path.exists() => Self::load(&path),
      _ => Ok(Self::default()),
    }
  }

  /// Validate configuration values.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.socket_path.as_os_str().is_empty() {
      return Err(ConfigError::Invalid("Socket path cannot be empty".to_string()));
    }
    if self.connect_attempts == 0 {
      return Err(ConfigError::Invalid(
        "Connect attempts must be at least 1".to_string(),
      ));
    }
    if self.connect_attempts > MAX_ATTEMPTS {
      return Err(ConfigError::Invalid(format!(
        "Connect attempts must be at most {}",
        MAX_ATTEMPTS
      )));
    }
    if self.retry_interval_ms == 0 || self.retry_interval_ms > MAX_RETRY_INTERVAL_MS {
      return Err(ConfigError::Invalid(format!(
        "Retry interval must be between 1 and {} ms",
        MAX_RETRY_INTERVAL_MS
      )));
    }
    if self.play_wait_attempts > MAX_ATTEMPTS {
      return Err(ConfigError::Invalid(format!(
        "Play wait attempts must be at most {}",
        MAX_ATTEMPTS
      )));
    }
    if self.initial_volume > 130 {
      return Err(ConfigError::Invalid(
        "Initial volume must be between 0 and 130".to_string(),
      ));
    }
    if self.response_timeout_ms == 0 {
      return Err(ConfigError::Invalid(
        "Response timeout must be greater than zero".to_string(),
      ));
    }
    Ok(())
  }

  pub fn retry_interval(&self) -> Duration {
    Duration::from_millis(self.retry_interval_ms)
  }

  pub fn response_timeout(&self) -> Duration {
    Duration::from_millis(self.response_timeout_ms)
  }

  pub fn stop_timeout(&self) -> Duration {
    Duration::from_millis(self.stop_timeout_ms)
  }
}
