//! Workflow engine core: graph model, step lifecycle, data flow and execution.
//!
//! - `graph` -- step definitions, dependency edges, validation and ordering
//! - `state` -- per-step lifecycle state machine
//! - `expression` -- JEXL expressions for conditions, input mapping and gates
//! - `context` -- run-scoped variables and recorded step results
//! - `action` -- the capability interface steps invoke
//! - `router` -- routing table and adaptive cooldown state for action targets
//! - `retry` -- retry decisions and backoff delays
//! - `executor` -- dynamic Kahn-driven concurrent DAG executor
//! - `strategy` -- single-run and iterative-repair execution strategies

pub mod action;
pub mod context;
pub mod executor;
pub mod expression;
pub mod graph;
pub mod retry;
pub mod router;
pub mod state;
pub mod strategy;
