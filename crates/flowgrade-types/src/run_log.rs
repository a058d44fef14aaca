//! Per-run log record.
//!
//! One record is written for every evaluated run (one per attempt under
//! iterative repair). Records are append-only JSON objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::evaluation::{CriterionResult, Grade, HardGateResult, JudgeMetadata};
use crate::workflow::{StepState, WorkflowStatus};

/// Structured record of one evaluated run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogRecord {
    pub run_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub workflow_id: String,
    pub workflow_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_id: Option<String>,
    /// Iterative-repair attempt number, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    pub overall_status: WorkflowStatus,
    pub hard_gates: HardGateResult,
    pub criteria: Vec<CriterionResult>,
    pub weighted_score: f64,
    pub grade: Grade,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge: Option<JudgeMetadata>,
    pub steps: Vec<StepLogEntry>,
}

/// Per-step slice of a run log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLogEntry {
    pub step: String,
    pub state: StepState,
    pub duration_ms: u64,
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_tier: Option<String>,
}
