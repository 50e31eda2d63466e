use std::sync::Arc;
use std::time::Duration;

use hopper::broker::Broker;
use hopper::config::load_config;
use hopper::persistence::{DeadLetterArchive, SledArchive};
use hopper::utils::logging;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    logging::init(&config.logging.level);

    let archive: Option<Arc<dyn DeadLetterArchive>> = match &config.persistence.dead_letter_path {
        Some(path) => match SledArchive::open(path) {
            Ok(archive) => Some(Arc::new(archive)),
            Err(e) => {
                error!(path = %path, error = %e, "failed to open dead letter archive");
                std::process::exit(1);
            }
        },
        None => None,
    };

    let broker = match Broker::from_settings(&config, archive) {
        Ok(broker) => Arc::new(broker),
        Err(e) => {
            error!(error = %e, "failed to declare destinations");
            std::process::exit(1);
        }
    };
    info!(destinations = ?broker.destinations(), "broker ready");

    let mut ticker = tokio::time::interval(Duration::from_secs(
        config.broker.metrics_interval_secs.max(1),
    ));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match serde_json::to_string(&broker.metrics_snapshot()) {
                    Ok(snapshot) => info!(%snapshot, "metrics"),
                    Err(e) => error!(error = %e, "failed to serialize metrics"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("shutting down");
    broker.shutdown().await;
}
