//! Error types shared across crate boundaries.

/// A dataset sample cannot drive a workflow.
///
/// Raised before any execution starts and never coerced away.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error(
    "sample '{sample_id}' is incompatible with workflow '{workflow_id}': {}",
    .reasons.join("; ")
)]
pub struct CompatibilityError {
    pub workflow_id: String,
    pub sample_id: String,
    pub reasons: Vec<String>,
}

/// Failures of a run-log sink.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RunLogError {
    #[error("run log I/O error: {0}")]
    Io(String),

    #[error("run log serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compatibility_error_lists_every_reason() {
        let err = CompatibilityError {
            workflow_id: "repair".to_string(),
            sample_id: "s-9".to_string(),
            reasons: vec![
                "missing required input 'repo'".to_string(),
                "dataset capability mismatch".to_string(),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("s-9"));
        assert!(msg.contains("repair"));
        assert!(msg.contains("missing required input 'repo'; dataset capability mismatch"));
    }

    #[test]
    fn test_run_log_error_display() {
        let err = RunLogError::Io("disk full".to_string());
        assert_eq!(err.to_string(), "run log I/O error: disk full");
    }
}
