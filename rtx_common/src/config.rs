//! Configuration loading traits and types.
//!
//! This module provides a standardized way to load TOML configuration files
//! across all RTX processes. One file carries every section; each process
//! reads the sections it needs.
//!
//! # Usage
//!
//! ```rust,no_run
//! use rtx_common::config::{ConfigError, RtxConfig};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = RtxConfig::load_validated(Some(Path::new("rtx.toml")))?;
//!     println!("Instance: {}", config.session.instance);
//!     Ok(())
//! }
//! ```
//!
//! # TOML Example
//!
//! ```toml
//! [shared]
//! log_level = "debug"
//! service_name = "rtx-bench-01"
//!
//! [session]
//! instance = 3
//! flavor = "posix"
//! rt_msg_level = "warn"
//!
//! [msgd]
//! log_file = "/var/log/rtx/messages.log"
//!
//! [host]
//! command_socket = "/run/rtx/host-3.sock"
//! autoload = ["loadrt scale count=2"]
//! ```

use crate::consts::{
    DEFAULT_GLOBAL_SIZE, DEFAULT_HAL_SIZE, DEFAULT_MESSAGE_RING_SIZE,
    DEFAULT_OBJECT_TABLE_CAPACITY, DEFAULT_PREFAULT_BYTES, DEFAULT_SHM_DIR, POLL_MAX_MS,
    POLL_MIN_MS, POLL_STEP_MS, SHM_MAX_SIZE, STARTUP_RETRIES, STARTUP_RETRY_INTERVAL_MS,
    SUPERVISE_INTERVAL_MS,
};
use crate::flavor::Flavor;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for configuration loading operations.
///
/// This enum represents all possible errors that can occur when loading
/// configuration files.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging and for the session message levels.
///
/// Uses lowercase serde values for TOML compatibility. The numeric codes
/// follow the message level scale stored in the session segment:
/// `0` none, `1` error, `2` warn, `3` info, `4` debug, `5` all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
    /// Nothing is emitted.
    Off,
}

impl LogLevel {
    /// Numeric code stored in shared memory.
    pub const fn code(self) -> u32 {
        match self {
            LogLevel::Off => 0,
            LogLevel::Error => 1,
            LogLevel::Warn => 2,
            LogLevel::Info => 3,
            LogLevel::Debug => 4,
            LogLevel::Trace => 5,
        }
    }

    /// Inverse of [`LogLevel::code`]. Codes above 5 saturate to `Trace`.
    pub const fn from_code(code: u32) -> Self {
        match code {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Whether a message at `level` passes when `self` is the threshold.
    pub const fn allows(self, level: LogLevel) -> bool {
        level.code() != 0 && level.code() <= self.code()
    }

    /// Lowercase name, as used in TOML and on the command line.
    pub const fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Off => "off",
        }
    }

    /// Parse a level name or a numeric code.
    pub fn parse(s: &str) -> Option<Self> {
        if let Ok(code) = s.parse::<u32>() {
            return Some(Self::from_code(code));
        }
        match s.to_ascii_lowercase().as_str() {
            "trace" | "all" => Some(LogLevel::Trace),
            "debug" | "dbg" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" | "err" => Some(LogLevel::Error),
            "off" | "none" => Some(LogLevel::Off),
            _ => None,
        }
    }

    /// Matching `tracing` level, `None` for `Off`.
    pub fn to_tracing(self) -> Option<tracing::Level> {
        match self {
            LogLevel::Trace => Some(tracing::Level::TRACE),
            LogLevel::Debug => Some(tracing::Level::DEBUG),
            LogLevel::Info => Some(tracing::Level::INFO),
            LogLevel::Warn => Some(tracing::Level::WARN),
            LogLevel::Error => Some(tracing::Level::ERROR),
            LogLevel::Off => None,
        }
    }
}

impl From<tracing::Level> for LogLevel {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common configuration fields shared across all RTX processes.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "rtx-bench-01"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Application instance identifier.
    pub service_name: String,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            service_name: "rtx".to_string(),
        }
    }
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - `service_name` is empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Session-wide settings: instance, segment sizing and message levels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Instance id scoping every segment key (0..=255).
    pub instance: u8,
    /// Directory holding the segment files.
    pub shm_dir: PathBuf,
    /// Requested flavor name. `None` selects by autodetection.
    pub flavor: Option<String>,
    /// Data size of the global session segment.
    pub global_size: usize,
    /// Capacity of the session message ring.
    pub message_ring_size: usize,
    /// Data size of the object store segment.
    pub hal_size: usize,
    /// Capacity of the object table.
    pub object_table_capacity: u32,
    /// Threshold for messages originating from realtime code.
    pub rt_msg_level: LogLevel,
    /// Threshold for messages originating from non-realtime code.
    pub user_msg_level: LogLevel,
    /// Attempts made while waiting for the session to become ready.
    pub startup_retries: u32,
    /// Delay between readiness attempts.
    pub startup_retry_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            instance: 0,
            shm_dir: PathBuf::from(DEFAULT_SHM_DIR),
            flavor: None,
            global_size: DEFAULT_GLOBAL_SIZE,
            message_ring_size: DEFAULT_MESSAGE_RING_SIZE,
            hal_size: DEFAULT_HAL_SIZE,
            object_table_capacity: DEFAULT_OBJECT_TABLE_CAPACITY,
            rt_msg_level: LogLevel::Error,
            user_msg_level: LogLevel::Info,
            startup_retries: STARTUP_RETRIES,
            startup_retry_interval_ms: STARTUP_RETRY_INTERVAL_MS,
        }
    }
}

impl SessionConfig {
    /// Validate sizes and the requested flavor name.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.message_ring_size >= self.global_size {
            return Err(ConfigError::ValidationError(format!(
                "message_ring_size ({}) must be smaller than global_size ({})",
                self.message_ring_size, self.global_size
            )));
        }
        if self.global_size > SHM_MAX_SIZE || self.hal_size > SHM_MAX_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "segment sizes are limited to {SHM_MAX_SIZE} bytes"
            )));
        }
        if self.hal_size < 64 * 1024 {
            return Err(ConfigError::ValidationError(
                "hal_size must be at least 64 KiB".to_string(),
            ));
        }
        if self.object_table_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "object_table_capacity cannot be zero".to_string(),
            ));
        }
        if self.startup_retries == 0 {
            return Err(ConfigError::ValidationError(
                "startup_retries cannot be zero".to_string(),
            ));
        }
        if let Some(name) = &self.flavor {
            if Flavor::from_name(name).is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "unknown flavor '{name}'"
                )));
            }
        }
        Ok(())
    }

    /// Readiness wait interval as a `Duration`.
    pub fn retry_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.startup_retry_interval_ms)
    }
}

/// Message daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MsgdConfig {
    /// Poll interval right after records were drained.
    pub poll_min_ms: u64,
    /// Cap of the idle poll interval.
    pub poll_max_ms: u64,
    /// Increase of the poll interval per idle cycle.
    pub poll_step_ms: u64,
    /// Append-only log file receiving every drained record.
    pub log_file: Option<PathBuf>,
    /// Unix socket on which live subscribers connect.
    pub publish_socket: Option<PathBuf>,
    /// Host liveness check interval.
    pub supervise_interval_ms: u64,
}

impl Default for MsgdConfig {
    fn default() -> Self {
        Self {
            poll_min_ms: POLL_MIN_MS,
            poll_max_ms: POLL_MAX_MS,
            poll_step_ms: POLL_STEP_MS,
            log_file: None,
            publish_socket: None,
            supervise_interval_ms: SUPERVISE_INTERVAL_MS,
        }
    }
}

impl MsgdConfig {
    /// Validate poll bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_min_ms == 0 || self.poll_min_ms > self.poll_max_ms {
            return Err(ConfigError::ValidationError(format!(
                "poll interval bounds invalid: min {} max {}",
                self.poll_min_ms, self.poll_max_ms
            )));
        }
        if self.poll_step_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poll_step_ms cannot be zero".to_string(),
            ));
        }
        if self.supervise_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "supervise_interval_ms cannot be zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Module host settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Unix socket serving the request/reply command channel.
    pub command_socket: Option<PathBuf>,
    /// Lock current and future pages at startup.
    pub lock_memory: bool,
    /// Bytes touched at startup so realtime code does not page fault.
    pub prefault_bytes: usize,
    /// Command lines executed after startup, in order.
    pub autoload: Vec<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            command_socket: None,
            lock_memory: true,
            prefault_bytes: DEFAULT_PREFAULT_BYTES,
            autoload: Vec::new(),
        }
    }
}

impl HostConfig {
    /// Validate the host section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.autoload.iter().any(|line| line.trim().is_empty()) {
            return Err(ConfigError::ValidationError(
                "autoload entries cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Complete configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RtxConfig {
    /// Common fields.
    #[serde(default)]
    pub shared: SharedConfig,
    /// Session and segment settings.
    #[serde(default)]
    pub session: SessionConfig,
    /// Message daemon settings.
    #[serde(default)]
    pub msgd: MsgdConfig,
    /// Module host settings.
    #[serde(default)]
    pub host: HostConfig,
}

impl RtxConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;
        self.session.validate()?;
        self.msgd.validate()?;
        self.host.validate()
    }

    /// Load and validate `path`, or fall back to defaults when no path is given.
    pub fn load_validated(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Trait for loading configuration from TOML files.
///
/// This trait provides a default implementation that works with any type
/// implementing `serde::de::DeserializeOwned`.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Blanket implementation for all types that implement DeserializeOwned.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
