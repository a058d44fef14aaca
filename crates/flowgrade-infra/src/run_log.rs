//! JSON-lines run log on the local filesystem.
//!
//! One [`RunLogRecord`] per line, appended and flushed per record. The format
//! is append-only: a crash mid-run leaves every earlier line intact.

use std::path::{Path, PathBuf};

use anyhow::Context;
use flowgrade_core::run_log::RunLogSink;
use flowgrade_types::error::RunLogError;
use flowgrade_types::run_log::RunLogRecord;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// [`RunLogSink`] writing to a single `.jsonl` file.
#[derive(Debug)]
pub struct JsonlRunLog {
    path: PathBuf,
    // Serializes appends from concurrent runs sharing one sink.
    write_lock: Mutex<()>,
}

impl JsonlRunLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_record(&self, line: &str) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
        }

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        file.flush().await.context("Failed to flush run log")?;
        Ok(())
    }

    /// Read every record back, in append order. A missing file is empty.
    pub async fn read_all(&self) -> anyhow::Result<Vec<RunLogRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to read {}", self.path.display()));
            }
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(i, line)| {
                serde_json::from_str(line).with_context(|| {
                    format!("Failed to parse line {} of {}", i + 1, self.path.display())
                })
            })
            .collect()
    }
}

impl RunLogSink for JsonlRunLog {
    async fn append(&self, record: &RunLogRecord) -> Result<(), RunLogError> {
        let mut line =
            serde_json::to_string(record).map_err(|e| RunLogError::Serialization(e.to_string()))?;
        line.push('\n');

        self.write_record(&line).await.map_err(|e| {
            tracing::error!(path = %self.path.display(), error = %e, "Failed to append run log record");
            RunLogError::Io(format!("{e:#}"))
        })?;

        tracing::debug!(
            path = %self.path.display(),
            run_id = %record.run_id,
            attempt = ?record.attempt,
            "Run log record appended"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgrade_core::run_log::build_run_log;
    use flowgrade_types::evaluation::{Grade, HardGateResult, ScoreReport};
    use flowgrade_types::workflow::{WorkflowResult, WorkflowStatus};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn record(attempt: u32, passed: bool) -> RunLogRecord {
        let result = WorkflowResult {
            run_id: Uuid::now_v7(),
            workflow_id: "fix".to_string(),
            workflow_version: "1".to_string(),
            overall_status: WorkflowStatus::Success,
            final_output: Default::default(),
            step_results: vec![],
            unresolved_required_outputs: vec![],
            incomplete_steps: vec![],
            cancelled: false,
            timed_out: false,
            duration_ms: 12,
        };
        let report = ScoreReport {
            rubric_id: "fix".to_string(),
            rubric_version: "1.0.0".to_string(),
            profile_id: Some("A".to_string()),
            hard_gates: HardGateResult {
                required_outputs_present: true,
                overall_status_success: true,
                no_critical_step_failures: true,
                schema_contract_valid: true,
                dataset_workflow_compatible: true,
                extra: Default::default(),
                failure_reasons: vec![],
            },
            criteria: vec![],
            weighted_score: if passed { 91.0 } else { 40.0 },
            grade: if passed { Grade::A } else { Grade::F },
            passed,
            pass_threshold: 70.0,
            floor_violations: vec![],
            flags: vec![],
            judge: None,
        };
        build_run_log(&result, &report, Some("s-1"), Some(attempt))
    }

    #[tokio::test]
    async fn test_appends_one_line_per_record() {
        let tmp = TempDir::new().unwrap();
        let sink = JsonlRunLog::new(tmp.path().join("logs").join("runs.jsonl"));

        sink.append(&record(1, false)).await.unwrap();
        sink.append(&record(2, true)).await.unwrap();

        let content = tokio::fs::read_to_string(sink.path()).await.unwrap();
        assert_eq!(content.lines().count(), 2);

        let records = sink.read_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].attempt, Some(1));
        assert!(!records[0].passed);
        assert_eq!(records[1].grade, Grade::A);
        assert_eq!(records[1].sample_id.as_deref(), Some("s-1"));
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let tmp = TempDir::new().unwrap();
        let sink = JsonlRunLog::new(tmp.path().join("none.jsonl"));
        assert!(sink.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unwritable_path_is_an_io_error() {
        let tmp = TempDir::new().unwrap();
        // A directory where the log file should be.
        let path = tmp.path().join("runs.jsonl");
        tokio::fs::create_dir(&path).await.unwrap();

        let err = JsonlRunLog::new(&path)
            .append(&record(1, true))
            .await
            .unwrap_err();
        assert!(matches!(err, RunLogError::Io(_)));
    }

    #[tokio::test]
    async fn test_corrupt_line_is_reported() {
        let tmp = TempDir::new().unwrap();
        let sink = JsonlRunLog::new(tmp.path().join("runs.jsonl"));
        sink.append(&record(1, true)).await.unwrap();
        tokio::fs::write(sink.path(), "{not json}\n").await.unwrap();

        let err = sink.read_all().await.unwrap_err();
        assert!(format!("{err:#}").contains("line 1"));
    }
}
