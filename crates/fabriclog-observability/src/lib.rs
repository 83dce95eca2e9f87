//! # fabriclog-observability
//!
//! `tracing` subscriber setup shared by the fabriclog binary and tests.
//! Logs are human-readable by default, or JSON for log shippers.

pub mod tracing_setup;

pub use tracing_setup::{init_tracing, LogConfig, PIPELINE_TARGETS};
