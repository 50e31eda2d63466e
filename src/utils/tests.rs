use super::error::BrokerError;
use super::logging;

#[test]
fn logging_init_accepts_levels() {
    // Should not panic when called repeatedly
    logging::init("info");
    logging::init("debug");
    logging::init("warn");
}

#[test]
fn parse_level_falls_back_to_info() {
    assert_eq!(logging::parse_level("WARNING"), tracing::Level::WARN);
    assert_eq!(logging::parse_level(" trace "), tracing::Level::TRACE);
    assert_eq!(logging::parse_level("verbose"), tracing::Level::INFO);
}

#[test]
fn only_not_leased_is_a_warning() {
    let late_ack = BrokerError::NotLeased {
        destination: "orders".to_string(),
        message_id: "m-1".to_string(),
    };
    assert!(late_ack.is_warning());
    assert!(!BrokerError::UnknownDestination("nope".to_string()).is_warning());
}

#[test]
fn queue_full_message_names_queue_and_capacity() {
    let err = BrokerError::QueueFull {
        queue: "orders".to_string(),
        capacity: 10,
    };
    assert_eq!(err.to_string(), "queue `orders` is full (capacity: 10)");
}
