//! Per-run log records and the sink trait that persists them.

use std::sync::Mutex;

use chrono::Utc;
use flowgrade_types::error::RunLogError;
use flowgrade_types::evaluation::ScoreReport;
use flowgrade_types::run_log::{RunLogRecord, StepLogEntry};
use flowgrade_types::workflow::WorkflowResult;

/// Build the log record for one evaluated run.
pub fn build_run_log(
    result: &WorkflowResult,
    report: &ScoreReport,
    sample_id: Option<&str>,
    attempt: Option<u32>,
) -> RunLogRecord {
    RunLogRecord {
        run_id: result.run_id,
        recorded_at: Utc::now(),
        workflow_id: result.workflow_id.clone(),
        workflow_version: result.workflow_version.clone(),
        sample_id: sample_id.map(str::to_string),
        attempt,
        overall_status: result.overall_status,
        hard_gates: report.hard_gates.clone(),
        criteria: report.criteria.clone(),
        weighted_score: report.weighted_score,
        grade: report.grade,
        passed: report.passed,
        judge: report.judge.clone(),
        steps: result
            .step_results
            .iter()
            .map(|s| StepLogEntry {
                step: s.step.clone(),
                state: s.state,
                duration_ms: s.duration_ms,
                retries: s.retry_count,
                model_tier: s.model_tier.clone(),
            })
            .collect(),
    }
}

/// Append-only destination for run log records.
///
/// Implementations live in flowgrade-infra (e.g., `JsonlRunLog`).
pub trait RunLogSink: Send + Sync {
    fn append(
        &self,
        record: &RunLogRecord,
    ) -> impl std::future::Future<Output = Result<(), RunLogError>> + Send;
}

/// In-memory sink, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryRunLog {
    records: Mutex<Vec<RunLogRecord>>,
}

impl MemoryRunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<RunLogRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

impl RunLogSink for MemoryRunLog {
    async fn append(&self, record: &RunLogRecord) -> Result<(), RunLogError> {
        self.records
            .lock()
            .map_err(|e| RunLogError::Io(e.to_string()))?
            .push(record.clone());
        Ok(())
    }
}
