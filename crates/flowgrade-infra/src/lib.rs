//! Infrastructure layer for flowgrade.
//!
//! Filesystem implementations of the ports defined in `flowgrade-core`:
//! loading `flowgrade.toml` into an [`EngineConfig`](flowgrade_types::config::EngineConfig)
//! and appending run-log records as JSON lines.

pub mod config;
pub mod run_log;
