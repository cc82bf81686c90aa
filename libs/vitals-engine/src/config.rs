use serde::{Deserialize, Serialize};

use vitals_api::{ConsumerSettings, OffsetReset, SecurityProtocol, SecuritySettings};

use crate::error::RelayError;

/// Root configuration, parsed from TOML, then overridden from the environment.
///
/// Built once at process entry and handed to the relay by reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub topics: TopicsConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// `host:port` of the broker.
    #[serde(default = "default_address")]
    pub address: String,

    #[serde(default)]
    pub security: SecuritySettings,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            security: SecuritySettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicsConfig {
    #[serde(default = "default_input_topic")]
    pub input: String,

    #[serde(default = "default_healthy_topic")]
    pub healthy: String,

    #[serde(default = "default_unhealthy_topic")]
    pub unhealthy: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            input: default_input_topic(),
            healthy: default_healthy_topic(),
            unhealthy: default_unhealthy_topic(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_group_id")]
    pub group_id: String,

    #[serde(default)]
    pub auto_offset_reset: OffsetReset,

    #[serde(default = "default_true")]
    pub enable_auto_commit: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            auto_offset_reset: OffsetReset::default(),
            enable_auto_commit: true,
        }
    }
}

fn default_address() -> String {
    "localhost:9092".to_string()
}
fn default_input_topic() -> String {
    "vitals_input".to_string()
}
fn default_healthy_topic() -> String {
    "healthy_vitals".to_string()
}
fn default_unhealthy_topic() -> String {
    "unhealthy_vitals".to_string()
}
fn default_group_id() -> String {
    "vitals_health_group".to_string()
}
fn default_true() -> bool {
    true
}

/// Environment variables that override file values.
pub const ENV_BROKER: &str = "KAFKA_BROKER";
pub const ENV_INPUT_TOPIC: &str = "INPUT_TOPIC";
pub const ENV_HEALTHY_TOPIC: &str = "HEALTHY_TOPIC";
pub const ENV_UNHEALTHY_TOPIC: &str = "UNHEALTHY_TOPIC";
pub const ENV_GROUP_ID: &str = "GROUP_ID";
pub const ENV_SASL_USERNAME: &str = "SASL_USERNAME";
pub const ENV_SASL_PASSWORD: &str = "SASL_PASSWORD";
pub const ENV_SECURITY_PROTOCOL: &str = "SECURITY_PROTOCOL";
pub const ENV_SASL_MECHANISM: &str = "SASL_MECHANISM";

impl RelayConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, RelayError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("{path}: {e}")))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, RelayError> {
        toml::from_str(toml_str).map_err(|e| RelayError::Config(e.to_string()))
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, RelayError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Override fields from variables returned by `lookup`.
    ///
    /// Empty values count as set for credentials and as unset elsewhere.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), RelayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty(ENV_BROKER) {
            self.broker.address = v;
        }
        if let Some(v) = non_empty(ENV_INPUT_TOPIC) {
            self.topics.input = v;
        }
        if let Some(v) = non_empty(ENV_HEALTHY_TOPIC) {
            self.topics.healthy = v;
        }
        if let Some(v) = non_empty(ENV_UNHEALTHY_TOPIC) {
            self.topics.unhealthy = v;
        }
        if let Some(v) = non_empty(ENV_GROUP_ID) {
            self.consumer.group_id = v;
        }
        if let Some(v) = non_empty(ENV_SECURITY_PROTOCOL) {
            self.broker.security.protocol = v
                .parse::<SecurityProtocol>()
                .map_err(|e| RelayError::Config(format!("{ENV_SECURITY_PROTOCOL}: {}", e.message)))?;
        }
        if let Some(v) = non_empty(ENV_SASL_MECHANISM) {
            self.broker.security.mechanism = v;
        }
        if let Some(v) = lookup(ENV_SASL_USERNAME) {
            self.broker.security.username = v;
        }
        if let Some(v) = lookup(ENV_SASL_PASSWORD) {
            self.broker.security.password = v;
        }
        Ok(())
    }

    /// Check that the topic layout can route every record somewhere distinct.
    pub fn validate(&self) -> Result<(), RelayError> {
        let named = [
            ("broker.address", &self.broker.address),
            ("topics.input", &self.topics.input),
            ("topics.healthy", &self.topics.healthy),
            ("topics.unhealthy", &self.topics.unhealthy),
            ("consumer.group_id", &self.consumer.group_id),
        ];
        for (name, value) in named {
            if value.trim().is_empty() {
                return Err(RelayError::Config(format!("{name} must not be empty")));
            }
        }

        if self.topics.healthy == self.topics.unhealthy {
            return Err(RelayError::Config(format!(
                "healthy and unhealthy topics must differ (both '{}')",
                self.topics.healthy
            )));
        }
        if self.topics.input == self.topics.healthy || self.topics.input == self.topics.unhealthy {
            return Err(RelayError::Config(format!(
                "input topic '{}' must differ from the output topics",
                self.topics.input
            )));
        }
        if self.broker.security.protocol.uses_sasl() && self.broker.security.mechanism.trim().is_empty() {
            return Err(RelayError::Config(
                "broker.security.mechanism must be set for SASL protocols".into(),
            ));
        }
        Ok(())
    }

    /// Settings handed to the transport on subscribe.
    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            group_id: self.consumer.group_id.clone(),
            auto_offset_reset: self.consumer.auto_offset_reset,
            enable_auto_commit: self.consumer.enable_auto_commit,
        }
    }

    /// TOML rendering with the password masked (for `--check-config`).
    pub fn to_redacted_toml(&self) -> Result<String, RelayError> {
        let mut shown = self.clone();
        if !shown.broker.security.password.is_empty() {
            shown.broker.security.password = "***".to_string();
        }
        toml::to_string(&shown).map_err(|e| RelayError::Config(e.to_string()))
    }
}
