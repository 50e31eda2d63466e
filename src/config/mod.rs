mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, LoggingSettings, PersistenceSettings, QueueSettings, Settings, TopicSettings,
};

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
/// Returns a `Settings` struct containing the broker, logging, persistence
/// and destination configurations
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as `load_config` but reads the file at `path` (extension optional).
///
/// Environment variables use the `HOPPER` prefix and `__` between levels,
/// e.g. `HOPPER_BROKER__DEAD_LETTER_CAPACITY=500`.
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix("HOPPER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    // Merge with defaults
    let default = Settings::default();

    let broker = partial.broker;
    let logging = partial.logging;

    Ok(Settings {
        broker: BrokerSettings {
            dead_letter_capacity: broker
                .as_ref()
                .and_then(|b| b.dead_letter_capacity)
                .unwrap_or(default.broker.dead_letter_capacity),
            idempotency_retention_secs: broker
                .as_ref()
                .and_then(|b| b.idempotency_retention_secs)
                .unwrap_or(default.broker.idempotency_retention_secs),
            idempotency_max_entries: broker
                .as_ref()
                .and_then(|b| b.idempotency_max_entries)
                .unwrap_or(default.broker.idempotency_max_entries),
            poll_interval_ms: broker
                .as_ref()
                .and_then(|b| b.poll_interval_ms)
                .unwrap_or(default.broker.poll_interval_ms),
            metrics_interval_secs: broker
                .as_ref()
                .and_then(|b| b.metrics_interval_secs)
                .unwrap_or(default.broker.metrics_interval_secs),
        },
        logging: LoggingSettings {
            level: logging
                .and_then(|l| l.level)
                .unwrap_or(default.logging.level),
        },
        persistence: partial.persistence.unwrap_or(default.persistence),
        queues: partial.queues.unwrap_or(default.queues),
        topics: partial.topics.unwrap_or(default.topics),
    })
}
