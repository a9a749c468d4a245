//! Runtime glue around the package runner: configuration, progress display,
//! logging and counters, and signal handling.

pub mod config;
pub mod progress;
pub mod runner;
pub mod telemetry;
