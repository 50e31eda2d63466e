use std::time::Duration;

use serde::Deserialize;

use crate::broker::{
    IdempotencyRegistry, OrderingMode, QueueConfig, RetentionWindow, RetryPolicy, TopicConfig,
};

/// Top-level configuration settings for the application.
///
/// Includes broker tuning, logging, dead-letter persistence and the queues
/// and topics declared at startup.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub logging: LoggingSettings,
    pub persistence: PersistenceSettings,
    pub queues: Vec<QueueSettings>,
    pub topics: Vec<TopicSettings>,
}

/// Configuration settings for the broker.
///
/// Controls the shared dead-letter store, duplicate suppression, and how
/// often idle consumers re-check their queue.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub dead_letter_capacity: usize,
    pub idempotency_retention_secs: u64,
    pub idempotency_max_entries: u64,
    pub poll_interval_ms: u64,
    pub metrics_interval_secs: u64,
}

impl BrokerSettings {
    pub fn validate(&self) -> Result<(), String> {
        let max_retention = IdempotencyRegistry::MAX_RETENTION.as_secs();
        if self.idempotency_retention_secs > max_retention {
            return Err(format!(
                "idempotency_retention_secs must not exceed {max_retention}, got {}",
                self.idempotency_retention_secs
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Where dead letters are archived. `None` keeps them in memory only.
#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
pub struct PersistenceSettings {
    pub dead_letter_path: Option<String>,
}

/// A queue declared in configuration. Omitted fields take queue defaults.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct QueueSettings {
    pub name: String,
    pub capacity: Option<usize>,
    pub ordering: Option<OrderingMode>,
    pub visibility_timeout_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub backoff_cap_ms: Option<u64>,
}

impl QueueSettings {
    pub fn to_config(&self) -> QueueConfig {
        let default = QueueConfig::default();
        QueueConfig {
            capacity: self.capacity.unwrap_or(default.capacity),
            ordering: self.ordering.unwrap_or(default.ordering),
            visibility_timeout: self
                .visibility_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(default.visibility_timeout),
            retry: RetryPolicy {
                max_attempts: self.max_attempts.unwrap_or(default.retry.max_attempts),
                backoff_base: self
                    .backoff_base_ms
                    .map(Duration::from_millis)
                    .unwrap_or(default.retry.backoff_base),
                backoff_multiplier: self
                    .backoff_multiplier
                    .unwrap_or(default.retry.backoff_multiplier),
                backoff_cap: self
                    .backoff_cap_ms
                    .map(Duration::from_millis)
                    .unwrap_or(default.retry.backoff_cap),
            },
        }
    }
}

/// A topic declared in configuration.
///
/// Without either retention field the default window (1000 messages)
/// applies.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TopicSettings {
    pub name: String,
    pub retention_messages: Option<usize>,
    pub retention_secs: Option<u64>,
}

impl TopicSettings {
    pub fn to_config(&self) -> TopicConfig {
        let retention = if self.retention_messages.is_none() && self.retention_secs.is_none() {
            RetentionWindow::default()
        } else {
            RetentionWindow {
                max_messages: self.retention_messages,
                max_age: self.retention_secs.map(Duration::from_secs),
            }
        };
        TopicConfig {
            retention,
            ..TopicConfig::default()
        }
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub logging: Option<PartialLoggingSettings>,
    pub persistence: Option<PersistenceSettings>,
    pub queues: Option<Vec<QueueSettings>>,
    pub topics: Option<Vec<TopicSettings>>,
}

/// Partial broker settings.
///
/// Used for broker configuration from external sources with optional values.
#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub dead_letter_capacity: Option<usize>,
    pub idempotency_retention_secs: Option<u64>,
    pub idempotency_max_entries: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub metrics_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            dead_letter_capacity: 10_000,
            idempotency_retention_secs: 300,
            idempotency_max_entries: 100_000,
            poll_interval_ms: 100,
            metrics_interval_secs: 30,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Provides default values for `Settings`.
///
/// Ensures the application has sensible defaults if no configuration is provided.
impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings::default(),
            logging: LoggingSettings::default(),
            persistence: PersistenceSettings::default(),
            queues: Vec::new(),
            topics: Vec::new(),
        }
    }
}
