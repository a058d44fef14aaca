//! Workflow execution and evaluation engine for flowgrade.
//!
//! This crate defines the engine and the ports (action, judge and run-log
//! traits) that outer layers implement. It depends only on `flowgrade-types`
//! -- never on `flowgrade-infra` or any filesystem/network crate.

pub mod eval;
pub mod event;
pub mod run_log;
pub mod runner;
pub mod workflow;
