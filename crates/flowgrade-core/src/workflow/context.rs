//! Run-scoped execution context with step result tracking and template resolution.
//!
//! `ExecutionContext` is the mutable state of one executor invocation:
//! global variables, the results recorded so far, and iteration metadata
//! when the run is one attempt of an iterative-repair loop. It is owned by a
//! single run and written only by the executor's coordinator.

use std::collections::HashMap;

use flowgrade_types::workflow::StepResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::expression::resolve_path;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum serialized size of a single step's outputs (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

// ---------------------------------------------------------------------------
// ContextError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContextError {
    #[error("result for step '{0}' already recorded")]
    AlreadyRecorded(String),

    #[error("failed to serialize outputs of step '{step}': {message}")]
    Serialize { step: String, message: String },
}

// ---------------------------------------------------------------------------
// IterationMeta
// ---------------------------------------------------------------------------

/// Where this run sits inside an iterative-repair loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationMeta {
    /// 1-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Feedback from the previous attempt's evaluation.
    pub feedback: Option<String>,
}

impl Default for IterationMeta {
    fn default() -> Self {
        Self {
            attempt: 1,
            max_attempts: 1,
            feedback: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub workflow_id: String,
    /// Global variables visible as `${variables.*}`.
    pub variables: Map<String, Value>,
    pub iteration: IterationMeta,
    step_results: Vec<StepResult>,
    index: HashMap<String, usize>,
}

impl ExecutionContext {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            workflow_id: workflow_id.into(),
            variables: Map::new(),
            iteration: IterationMeta::default(),
            step_results: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    /// A new context for another attempt: new run id, same variables, no results.
    pub fn fresh_attempt(&self, iteration: IterationMeta) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            workflow_id: self.workflow_id.clone(),
            variables: self.variables.clone(),
            iteration,
            step_results: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Record a step's terminal result. Each step is recorded exactly once.
    ///
    /// Outputs larger than `MAX_STEP_OUTPUT_SIZE` once serialized are
    /// replaced with a truncation marker.
    pub fn record(&mut self, mut result: StepResult) -> Result<(), ContextError> {
        if self.index.contains_key(&result.step) {
            return Err(ContextError::AlreadyRecorded(result.step));
        }

        let size = serde_json::to_string(&result.outputs)
            .map_err(|e| ContextError::Serialize {
                step: result.step.clone(),
                message: e.to_string(),
            })?
            .len();
        if size > MAX_STEP_OUTPUT_SIZE {
            tracing::warn!(
                step = %result.step,
                size,
                max = MAX_STEP_OUTPUT_SIZE,
                "step output exceeds size limit, truncating"
            );
            let mut truncated = Map::new();
            truncated.insert("_truncated".to_string(), Value::Bool(true));
            truncated.insert("_original_size".to_string(), json!(size));
            result.outputs = truncated;
        }

        self.index.insert(result.step.clone(), self.step_results.len());
        self.step_results.push(result);
        Ok(())
    }

    pub fn step_result(&self, step: &str) -> Option<&StepResult> {
        self.index.get(step).map(|i| &self.step_results[*i])
    }

    /// Results in the order they were recorded.
    pub fn step_results(&self) -> &[StepResult] {
        &self.step_results
    }

    /// JSON scope used by the expression language.
    pub fn to_expression_scope(&self) -> Value {
        let mut steps = Map::new();
        for result in &self.step_results {
            steps.insert(
                result.step.clone(),
                json!({
                    "state": result.state,
                    "outputs": result.outputs,
                    "error": result.error,
                    "retry_count": result.retry_count,
                }),
            );
        }

        json!({
            "variables": self.variables,
            "steps": steps,
            "iteration": {
                "attempt": self.iteration.attempt,
                "max_attempts": self.iteration.max_attempts,
                "feedback": self.iteration.feedback,
            },
            "run": {
                "id": self.run_id.to_string(),
                "workflow_id": self.workflow_id,
            },
        })
    }

    /// Interpolate every `${path}` in `template`.
    ///
    /// Missing references render as empty strings.
    pub fn resolve_template(&self, template: &str) -> String {
        let scope = self.to_expression_scope();
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start..];
            let Some(end) = after.find('}') else {
                out.push_str(after);
                return out;
            };
            let reference = &after[..=end];
            if let Some(value) = resolve_path(reference, &scope) {
                out.push_str(&value_to_string(&value));
            }
            rest = &after[end + 1..];
        }

        out.push_str(rest);
        out
    }
}

/// Strings render without quotes, null renders empty, the rest as JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use flowgrade_types::workflow::StepState;

    fn success(step: &str, outputs: Value) -> StepResult {
        StepResult {
            step: step.to_string(),
            state: StepState::Success,
            outputs: outputs.as_object().cloned().unwrap_or_default(),
            error: None,
            duration_ms: 10,
            retry_count: 0,
            skip_reason: None,
            target: None,
            model_tier: None,
        }
    }

    #[test]
    fn test_record_is_write_once() {
        let mut ctx = ExecutionContext::new("wf");
        ctx.record(success("a", json!({"x": 1}))).unwrap();
        let err = ctx.record(success("a", json!({"x": 2}))).unwrap_err();
        assert_eq!(err, ContextError::AlreadyRecorded("a".to_string()));
        assert_eq!(ctx.step_result("a").unwrap().outputs["x"], json!(1));
    }

    #[test]
    fn test_oversized_output_truncated() {
        let mut ctx = ExecutionContext::new("wf");
        let big = "x".repeat(MAX_STEP_OUTPUT_SIZE + 10);
        ctx.record(success("big", json!({ "blob": big }))).unwrap();
        let outputs = &ctx.step_result("big").unwrap().outputs;
        assert_eq!(outputs["_truncated"], json!(true));
        assert!(outputs.get("blob").is_none());
    }

    #[test]
    fn test_scope_exposes_steps_variables_iteration() {
        let mut ctx = ExecutionContext::new("wf");
        ctx.variables.insert("lang".to_string(), json!("rust"));
        ctx.iteration = IterationMeta {
            attempt: 2,
            max_attempts: 3,
            feedback: Some("fix tests".to_string()),
        };
        ctx.record(success("build", json!({"artifact": "bin"}))).unwrap();

        let scope = ctx.to_expression_scope();
        assert_eq!(scope["variables"]["lang"], json!("rust"));
        assert_eq!(scope["steps"]["build"]["outputs"]["artifact"], json!("bin"));
        assert_eq!(scope["steps"]["build"]["state"], json!("success"));
        assert_eq!(scope["iteration"]["attempt"], json!(2));
        assert_eq!(scope["iteration"]["feedback"], json!("fix tests"));
    }

    #[test]
    fn test_resolve_template_interpolates_and_blanks_missing() {
        let mut ctx = ExecutionContext::new("wf");
        ctx.variables.insert("name".to_string(), json!("parser"));
        ctx.record(success("count", json!({"n": 3, "list": [1, 2]})))
            .unwrap();

        assert_eq!(
            ctx.resolve_template("fix ${variables.name}: ${steps.count.outputs.n} issues"),
            "fix parser: 3 issues"
        );
        assert_eq!(
            ctx.resolve_template("[${steps.count.outputs.list}]"),
            "[[1,2]]"
        );
        assert_eq!(ctx.resolve_template("x=${steps.nope.outputs.y};"), "x=;");
        assert_eq!(ctx.resolve_template("unterminated ${oops"), "unterminated ${oops");
    }

    #[test]
    fn test_fresh_attempt_keeps_variables_drops_results() {
        let mut ctx = ExecutionContext::new("wf");
        ctx.variables.insert("k".to_string(), json!(1));
        ctx.record(success("a", json!({}))).unwrap();

        let next = ctx.fresh_attempt(IterationMeta {
            attempt: 2,
            max_attempts: 3,
            feedback: None,
        });
        assert_ne!(next.run_id, ctx.run_id);
        assert_eq!(next.variables["k"], json!(1));
        assert!(next.step_results().is_empty());
        assert_eq!(next.iteration.attempt, 2);
    }
}
