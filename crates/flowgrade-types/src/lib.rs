//! Shared domain types for flowgrade.
//!
//! Plain data shared by the engine and its edges: step definitions and
//! results, rubric/profile/report types, lifecycle events, run-log records
//! and engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, semver, thiserror.

pub mod config;
pub mod error;
pub mod evaluation;
pub mod event;
pub mod run_log;
pub mod workflow;
