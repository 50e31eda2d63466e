//! # Hopper
//!
//! `hopper` is an in-process message broker core. Producers publish into
//! named queues (point-to-point, competing consumers) or topics (fan-out
//! with filters and replay); consumer groups lease messages, run handlers,
//! and translate the outcome into an ack, a retry with backoff, or a dead
//! letter. Delivery is at-least-once.
//!
//! ## Core Modules
//!
//! The library is structured into several modules, each with a distinct responsibility:
//!
//! - `broker`: queues, topics, consumer groups, dead letters, and the `Broker` registry.
//! - `config`: Handles loading and managing broker configuration.
//! - `persistence`: Archives dead letters beyond process lifetime (using `sled`).
//! - `utils`: Contains shared utilities, such as error handling and logging.

pub mod broker;
pub mod config;
pub mod persistence;
pub mod utils;

#[cfg(test)]
mod tests;
