//! Configuration types for the skylink-core crate
//!
//! [`ControllerConfig`] controls how the controller identifies itself to
//! devices, how long a connection handshake may take, the default no-ack
//! cadence and command logging. It can be built in code or loaded from JSON,
//! where durations are expressed in milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::log::CommandLogLevel;
use crate::command::CommandId;
use crate::error::{CoreError, Result};
use crate::noack;

/// Configuration for the Controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Name presented to devices when connecting
    /// Default: "skylink"
    pub descriptor: String,

    /// Version presented to devices when connecting
    /// Default: the crate version
    pub version: String,

    /// Maximum duration of a connection handshake before it is canceled
    /// Default: 30 seconds
    #[serde(with = "duration_ms", rename = "connect_timeout_ms")]
    pub connect_timeout: Duration,

    /// Period used by `create_default_no_ack_loop`
    /// Default: 50 milliseconds
    #[serde(with = "duration_ms", rename = "default_no_ack_period_ms")]
    pub default_no_ack_period: Duration,

    /// Process-wide command logging level
    /// Default: AckOnlyWithoutFrequent
    pub command_log_level: CommandLogLevel,

    /// Commands considered frequent by the command log filter
    /// Default: empty
    pub frequent_commands: Vec<CommandId>,

    /// Name of the event loop thread
    /// Default: "skylink-loop"
    pub loop_thread_name: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            descriptor: "skylink".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            connect_timeout: Duration::from_secs(30),
            default_no_ack_period: noack::DEFAULT_PERIOD,
            command_log_level: CommandLogLevel::default(),
            frequent_commands: Vec::new(),
            loop_thread_name: "skylink-loop".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for tests and simulations: short handshake timeout and
    /// every command logged
    pub fn simulation() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            command_log_level: CommandLogLevel::All,
            ..Default::default()
        }
    }

    /// Configuration for constrained links (BLE): longer handshake and a
    /// slower no-ack cadence
    pub fn low_bandwidth() -> Self {
        Self {
            connect_timeout: Duration::from_secs(60),
            default_no_ack_period: Duration::from_millis(100),
            ..Default::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.descriptor.is_empty() {
            return Err(CoreError::Config("descriptor must not be empty".to_string()));
        }

        if self.connect_timeout.is_zero() {
            return Err(CoreError::Config(
                "connect_timeout must be greater than 0".to_string(),
            ));
        }

        if self.default_no_ack_period.is_zero() {
            return Err(CoreError::Config(
                "default_no_ack_period must be greater than 0".to_string(),
            ));
        }

        if self.default_no_ack_period >= self.connect_timeout {
            return Err(CoreError::Config(
                "default_no_ack_period must be less than connect_timeout".to_string(),
            ));
        }

        if self.loop_thread_name.is_empty() {
            return Err(CoreError::Config(
                "loop_thread_name must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Parse a JSON configuration; missing fields take their default
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Builder method to set the descriptor and version
    pub fn with_descriptor(mut self, descriptor: impl Into<String>, version: impl Into<String>) -> Self {
        self.descriptor = descriptor.into();
        self.version = version.into();
        self
    }

    /// Builder method to set the handshake timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Builder method to set the default no-ack period
    pub fn with_default_no_ack_period(mut self, period: Duration) -> Self {
        self.default_no_ack_period = period;
        self
    }

    /// Builder method to set the command log level
    pub fn with_command_log_level(mut self, level: CommandLogLevel) -> Self {
        self.command_log_level = level;
        self
    }

    /// Builder method to set the frequent commands
    pub fn with_frequent_commands(mut self, ids: impl IntoIterator<Item = CommandId>) -> Self {
        self.frequent_commands = ids.into_iter().collect();
        self
    }

    /// Builder method to set the loop thread name
    pub fn with_loop_thread_name(mut self, name: impl Into<String>) -> Self {
        self.loop_thread_name = name.into();
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
