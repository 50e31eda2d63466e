//! The `utils` module provides shared definitions used across the `hopper`
//! crate.
//!
//! It centralizes the error types every broker operation returns and the
//! logging bootstrap used by the host binary and by tests.

pub mod error;
pub mod logging;

#[cfg(test)]
mod tests;
