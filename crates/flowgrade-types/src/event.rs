//! Lifecycle events for the flowgrade event bus.
//!
//! `FlowEvent` is broadcast while a workflow runs and while its result is
//! evaluated. All variants are Clone + Send + Sync for use with tokio
//! broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::evaluation::Grade;
use crate::workflow::{StepState, WorkflowStatus};

/// Events emitted during workflow execution and evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    /// A run has been admitted and its first steps are about to dispatch.
    RunStart {
        run_id: Uuid,
        workflow_id: String,
        step_count: usize,
    },

    /// A step has been handed to the worker pool.
    StepStart { run_id: Uuid, step: String },

    /// A step attempt failed and will be retried after `delay_ms`.
    StepRetry {
        run_id: Uuid,
        step: String,
        /// The attempt that failed (1-based).
        attempt: u32,
        error: String,
        delay_ms: u64,
    },

    /// A step reached a terminal state.
    StepEnd {
        run_id: Uuid,
        step: String,
        state: StepState,
        duration_ms: u64,
        retry_count: u32,
    },

    /// The run drained or was stopped.
    RunEnd {
        run_id: Uuid,
        status: WorkflowStatus,
        duration_ms: u64,
    },

    /// An iterative-repair attempt is starting.
    IterationStart { attempt: u32, max_attempts: u32 },

    /// An iterative-repair attempt has been evaluated.
    IterationEnd {
        attempt: u32,
        passed: bool,
        weighted_score: f64,
    },

    /// A score report has been produced.
    EvaluationComplete {
        run_id: Uuid,
        sample_id: Option<String>,
        passed: bool,
        grade: Grade,
        weighted_score: f64,
    },
}

impl FlowEvent {
    /// Run this event belongs to, when it is run-scoped.
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            FlowEvent::RunStart { run_id, .. }
            | FlowEvent::StepStart { run_id, .. }
            | FlowEvent::StepRetry { run_id, .. }
            | FlowEvent::StepEnd { run_id, .. }
            | FlowEvent::RunEnd { run_id, .. }
            | FlowEvent::EvaluationComplete { run_id, .. } => Some(*run_id),
            FlowEvent::IterationStart { .. } | FlowEvent::IterationEnd { .. } => None,
        }
    }
}
