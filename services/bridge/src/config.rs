//! Configuration for the bridge service.
//!
//! Loaded from `config/bridge`, `/etc/nier/bridge` and `BRIDGE__*` environment
//! variables, later sources overriding earlier ones.

use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

/// Main configuration for the bridge service
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// MQTT broker configuration
    pub broker: BrokerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Device supervision configuration
    pub devices: DeviceConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Metrics port, 0 disables the exporter
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// MQTT broker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Broker host
    pub host: String,
    /// Broker port
    #[serde(default = "default_broker_port")]
    pub port: u16,
    /// Topic filter to subscribe to, e.g. `sensors/#`
    pub topic: String,
    /// MQTT client ID (generated when absent)
    pub client_id: Option<String>,
    /// Subscription QoS level (0, 1 or 2)
    #[serde(default = "default_qos")]
    pub qos: u8,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Username for broker authentication
    pub username: Option<String>,
    /// Password for broker authentication
    pub password: Option<String>,
    /// Pause after a lost connection before the client reconnects
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    /// Capacity of the queue between the broker link and the ingest worker
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Database server host
    pub server: String,
    /// Database server port
    #[serde(default = "default_database_port")]
    pub port: u16,
    /// Database name
    pub database: String,
    /// Username
    pub username: String,
    /// Password
    pub password: Option<String>,
    /// Application name reported to the server
    #[serde(default = "default_service_name")]
    pub application_name: String,
    /// Connection retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds between connection attempts
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    /// Timeout for a single connection attempt in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// Device supervision configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Seconds of silence after which a timeout record is written
    pub idle_timeout_secs: u64,
}

// Default value functions
fn default_service_name() -> String {
    "bridge-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_broker_port() -> u16 {
    1883
}

fn default_qos() -> u8 {
    1
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_database_port() -> u16 {
    5432
}

fn default_max_retries() -> u32 {
    10
}

fn default_retry_interval_secs() -> u64 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    30
}

impl BridgeConfig {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/bridge").required(false))
            .add_source(config::File::with_name("/etc/nier/bridge").required(false))
            // Override with environment variables
            // BRIDGE__BROKER__HOST -> broker.host
            .add_source(
                config::Environment::with_prefix("BRIDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let required = [
            ("broker.host", &self.broker.host),
            ("broker.topic", &self.broker.topic),
            ("database.server", &self.database.server),
            ("database.database", &self.database.database),
            ("database.username", &self.database.username),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigValidationError::MissingField(field.to_string()));
            }
        }

        if self.broker.qos > 2 {
            return Err(ConfigValidationError::InvalidValue {
                field: "broker.qos".to_string(),
                message: "QoS must be 0, 1 or 2".to_string(),
            });
        }

        if self.broker.queue_capacity == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "broker.queue_capacity".to_string(),
                message: "Queue capacity must be greater than 0".to_string(),
            });
        }

        if self.devices.idle_timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "devices.idle_timeout_secs".to_string(),
                message: "Idle window must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl BrokerConfig {
    /// Configured client ID, or a fresh `bridge-` prefixed one.
    pub fn client_id(&self) -> String {
        match self.client_id {
            Some(ref id) if !id.is_empty() => id.clone(),
            _ => {
                let id = Uuid::new_v4().simple().to_string();
                format!("bridge-{}", &id[..12])
            }
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

impl DatabaseConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl DeviceConfig {
    pub fn idle_window(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> BridgeConfig {
        BridgeConfig {
            service: ServiceConfig::default(),
            broker: BrokerConfig {
                host: "localhost".to_string(),
                port: 1883,
                topic: "sensors/#".to_string(),
                client_id: None,
                qos: 1,
                keep_alive_secs: 30,
                username: None,
                password: None,
                reconnect_delay_secs: 5,
                queue_capacity: 1024,
            },
            database: DatabaseConfig {
                server: "localhost".to_string(),
                port: 5432,
                database: "telemetry".to_string(),
                username: "bridge".to_string(),
                password: Some("secret".to_string()),
                application_name: "bridge-service".to_string(),
                max_retries: 10,
                retry_interval_secs: 5,
                connect_timeout_secs: 30,
            },
            devices: DeviceConfig {
                idle_timeout_secs: 300,
            },
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(create_test_config().validate().is_ok());
    }

    #[test]
    fn test_missing_broker_host() {
        let mut config = create_test_config();
        config.broker.host = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(field)) if field == "broker.host"
        ));
    }

    #[test]
    fn test_missing_topic() {
        let mut config = create_test_config();
        config.broker.topic = "  ".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_invalid_qos() {
        let mut config = create_test_config();
        config.broker.qos = 3;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_zero_idle_window() {
        let mut config = create_test_config();
        config.devices.idle_timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { field, .. }) if field == "devices.idle_timeout_secs"
        ));
    }

    #[test]
    fn test_generated_client_id() {
        let config = create_test_config();
        let id = config.broker.client_id();
        assert!(id.starts_with("bridge-"));
        assert_eq!(id.len(), 19);
        assert_ne!(id, config.broker.client_id());
    }

    #[test]
    fn test_default_values() {
        assert_eq!(default_max_retries(), 10);
        assert_eq!(default_retry_interval_secs(), 5);
        assert_eq!(default_broker_port(), 1883);

        let config = create_test_config();
        assert_eq!(config.devices.idle_window(), Duration::from_secs(300));
        assert_eq!(config.database.retry_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_idle_window_is_required() {
        let source = config::Config::builder()
            .set_override("broker.host", "localhost")
            .unwrap()
            .set_override("broker.topic", "sensors/#")
            .unwrap()
            .set_override("database.server", "localhost")
            .unwrap()
            .set_override("database.database", "telemetry")
            .unwrap()
            .set_override("database.username", "bridge")
            .unwrap()
            .build()
            .unwrap();

        assert!(source.try_deserialize::<BridgeConfig>().is_err());
    }
}
