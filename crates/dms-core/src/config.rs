//! Configuration for a DMS endpoint.
//!
//! Configuration is stored in TOML. Every field has a default, so an empty
//! file (or no file at all) yields a working endpoint.
//!
//! # Example TOML
//!
//! ```toml
//! [session]
//! module_name = "dms"
//! session_name = "com.huawei.harmonyos.foundation.dms"
//! busy_timeout_secs = 60
//! open_wait_timeout_ms = 10000
//! max_payload_size = 256
//!
//! [permission]
//! access_mode = "trusted_broker"  # "trusted_broker" | "test_harness" | "untrusted"
//! profile = "standard"            # "standard" | "wearable"
//! native_appid_dir = "/system/native_appid/"
//! native_uid_ceiling = 99
//!
//! [dispatch]
//! queue_depth = 32
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use dms_proto::MAX_PACKET_SIZE;

use crate::permission::{AccessMode, IdentityProfile};

/// Environment variable naming a configuration file.
pub const CONFIG_ENV: &str = "DMS_CONFIG";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse config file
    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Endpoint configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DmsConfig {
    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub permission: PermissionConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Session manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Module name the session server is registered under
    #[serde(default = "default_module_name")]
    pub module_name: String,

    /// Session name used on both ends
    #[serde(default = "default_session_name")]
    pub session_name: String,

    /// Age after which a busy slot may be preempted
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_secs: u64,

    /// How long the blocking send waits for the open callback
    #[serde(default = "default_open_wait")]
    pub open_wait_timeout_ms: u64,

    /// Largest payload accepted for sending or dispatch
    #[serde(default = "default_max_payload")]
    pub max_payload_size: usize,
}

fn default_module_name() -> String {
    "dms".to_string()
}

fn default_session_name() -> String {
    "com.huawei.harmonyos.foundation.dms".to_string()
}

fn default_busy_timeout() -> u64 {
    60
}

fn default_open_wait() -> u64 {
    10_000
}

fn default_max_payload() -> usize {
    MAX_PACKET_SIZE
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            module_name: default_module_name(),
            session_name: default_session_name(),
            busy_timeout_secs: default_busy_timeout(),
            open_wait_timeout_ms: default_open_wait(),
            max_payload_size: default_max_payload(),
        }
    }
}

impl SessionConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }

    pub fn open_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.open_wait_timeout_ms)
    }
}

/// Permission verifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionConfig {
    /// Trust level of this process toward the bundle registry
    #[serde(default)]
    pub access_mode: AccessMode,

    /// Platform identity lookup rules
    #[serde(default)]
    pub profile: IdentityProfile,

    /// Directory holding `uid_<uid>_appid` files
    #[serde(default = "default_native_dir")]
    pub native_appid_dir: PathBuf,

    /// Highest uid resolved through the native store
    #[serde(default = "default_native_ceiling")]
    pub native_uid_ceiling: u32,
}

fn default_native_dir() -> PathBuf {
    PathBuf::from("/system/native_appid/")
}

fn default_native_ceiling() -> u32 {
    99
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            access_mode: AccessMode::default(),
            profile: IdentityProfile::default(),
            native_appid_dir: default_native_dir(),
            native_uid_ceiling: default_native_ceiling(),
        }
    }
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Capacity of the request queue
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_queue_depth() -> usize {
    32
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl DmsConfig {
    /// Load and validate configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: DmsConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `custom_path`, else from `$DMS_CONFIG`, else defaults.
    pub fn load_from(custom_path: Option<&Path>) -> Result<Self, ConfigError> {
        match custom_path {
            Some(path) => Self::load(path),
            None => Self::from_env(),
        }
    }

    /// Load from the file named by `$DMS_CONFIG`, or defaults when unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) if !path.is_empty() => Self::load(Path::new(&path)),
            _ => Ok(Self::default()),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let max = self.session.max_payload_size;
        if max == 0 || max > MAX_PACKET_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "max_payload_size must be in 1..={MAX_PACKET_SIZE}, got {max}"
            )));
        }

        if self.session.busy_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "busy_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.session.open_wait_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "open_wait_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.session.module_name.is_empty() || self.session.session_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "module_name and session_name must not be empty".to_string(),
            ));
        }

        if self.dispatch.queue_depth == 0 {
            return Err(ConfigError::ValidationError(
                "queue_depth must be greater than 0".to_string(),
            ));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Valid values: {:?}",
                self.logging.level, valid_levels
            )));
        }

        Ok(())
    }
}
