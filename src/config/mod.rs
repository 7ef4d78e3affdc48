//! Application configuration.
//!
//! Aggregates the broker, hub and supervisor settings into a single Config
//! struct that can be loaded from YAML files or environment variables.

use serde::Deserialize;

use crate::bus::ConsumerConfig;
use crate::events::TopicBinding;
use crate::hub::HubConfig;
use crate::supervisor::ConnectionTarget;
use crate::utils::retry::RetryPolicy;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "RELAY_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "RELAY";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "RELAY_LOG";
/// Environment variable selecting the log output format.
pub const LOG_FORMAT_ENV_VAR: &str = "RELAY_LOG_FORMAT";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Message broker connection and subscription settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    /// Durable queue owned by this relay instance.
    pub queue: String,
    pub consumer_tag: String,
    /// Exchange/routing key pairs to bind the queue with.
    pub bindings: Vec<TopicBinding>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let consumer = ConsumerConfig::default();
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            queue: consumer.queue,
            consumer_tag: consumer.consumer_tag,
            bindings: consumer.bindings,
        }
    }
}

impl BrokerConfig {
    /// AMQP URL for this broker.
    pub fn url(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.username,
            self.password,
            self.host,
            self.port,
            self.vhost.replace('/', "%2f")
        )
    }

    pub fn consumer(&self) -> ConsumerConfig {
        ConsumerConfig {
            queue: self.queue.clone(),
            consumer_tag: self.consumer_tag.clone(),
            bindings: self.bindings.clone(),
        }
    }
}

/// Outbound push hub connections.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    #[serde(flatten)]
    pub retry: RetryPolicy,
    /// Re-broadcast invocations received from connected hubs to local clients.
    pub relay_invocations: bool,
    pub targets: Vec<ConnectionTarget>,
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub hub: HubConfig,
    pub supervisor: SupervisorConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, e.g.
    ///    `RELAY__BROKER__HOST`
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the relay cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.queue.trim().is_empty() {
            return Err(ConfigError::Invalid("broker.queue must not be empty".to_string()));
        }
        if self.broker.bindings.is_empty() {
            return Err(ConfigError::Invalid(
                "broker.bindings must name at least one binding".to_string(),
            ));
        }
        if let Some(binding) = self
            .broker
            .bindings
            .iter()
            .find(|b| b.exchange.is_empty() || b.routing_key.is_empty())
        {
            return Err(ConfigError::Invalid(format!(
                "binding '{}' needs both an exchange and a routing key",
                binding
            )));
        }
        for target in &self.supervisor.targets {
            if !(target.url.starts_with("ws://") || target.url.starts_with("wss://")) {
                return Err(ConfigError::Invalid(format!(
                    "target '{}' url must be ws:// or wss://, got '{}'",
                    target.name, target.url
                )));
            }
        }
        Ok(())
    }
}
