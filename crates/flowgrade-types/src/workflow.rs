//! Workflow domain types for flowgrade.
//!
//! A workflow is a set of `StepDefinition`s wired together by `depends_on`
//! edges. These types are produced by an external loader, handed to the
//! engine as an in-memory graph, and never mutated once the graph is built.
//! Execution tracking types (`StepState`, `StepResult`, `WorkflowResult`)
//! live here too so that reports and logs can be serialized without pulling
//! in the engine.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in the workflow DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique step name within a workflow.
    pub name: String,
    /// Names of steps this step depends on (DAG edges).
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Run only when this expression is truthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Skip when this expression is truthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unless: Option<String>,
    /// Named inputs, each an expression resolved against the run context
    /// right before the step is dispatched.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_mapping: BTreeMap<String, String>,
    /// Retry policy. `None` falls back to the engine's configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Per-attempt timeout in seconds (default 300).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Opaque handle to the external agent/tool call.
    pub action: ActionRef,
}

impl StepDefinition {
    /// Create a step with no dependencies that invokes `route`.
    pub fn new(name: impl Into<String>, route: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depends_on: BTreeSet::new(),
            when: None,
            unless: None,
            input_mapping: BTreeMap::new(),
            retry_policy: None,
            timeout_secs: None,
            action: ActionRef::new(route),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn when(mut self, expr: impl Into<String>) -> Self {
        self.when = Some(expr.into());
        self
    }

    pub fn unless(mut self, expr: impl Into<String>) -> Self {
        self.unless = Some(expr.into());
        self
    }

    pub fn input(mut self, name: impl Into<String>, expr: impl Into<String>) -> Self {
        self.input_mapping.insert(name.into(), expr.into());
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn params(mut self, params: Value) -> Self {
        self.action.params = params;
        self
    }
}

/// Opaque reference to the capability a step invokes.
///
/// `route` names an entry in the action routing table; `params` is passed
/// through to the action untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRef {
    pub route: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl ActionRef {
    pub fn new(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            params: Value::Null,
        }
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Retry configuration for a workflow step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt (0 = run once).
    #[serde(default)]
    pub max_retries: u32,
    /// Delay schedule between attempts.
    #[serde(default)]
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::None,
        }
    }

    pub fn fixed(max_retries: u32, delay_ms: u64) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed { delay_ms },
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Delay schedule between retry attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately.
    #[default]
    None,
    /// Constant delay between attempts.
    Fixed { delay_ms: u64 },
    /// `initial_ms * multiplier^(n-1)`, capped at `max_ms`.
    Exponential {
        initial_ms: u64,
        max_ms: u64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },
}

fn default_multiplier() -> f64 {
    2.0
}

// ---------------------------------------------------------------------------
// Output declarations
// ---------------------------------------------------------------------------

/// A named workflow output resolved from step results once the run drains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDeclaration {
    pub name: String,
    /// Expression resolved against the finished run, e.g. `${steps.write.outputs.code}`.
    pub source: String,
    /// Required outputs gate the run; optional ones may be absent.
    #[serde(default = "default_true")]
    pub required: bool,
    /// Expected JSON type, checked by the schema contract gate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<ValueKind>,
}

impl OutputDeclaration {
    pub fn required(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            required: true,
            schema: None,
        }
    }

    pub fn optional(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name, source)
        }
    }

    pub fn with_schema(mut self, kind: ValueKind) -> Self {
        self.schema = Some(kind);
        self
    }
}

fn default_true() -> bool {
    true
}

/// JSON value kinds usable in output schema declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ValueKind {
    /// Whether `value` is of this kind. Integers also satisfy `Number`.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ValueKind::String => value.is_string(),
            ValueKind::Number => value.is_number(),
            ValueKind::Integer => value.is_i64() || value.is_u64(),
            ValueKind::Boolean => value.is_boolean(),
            ValueKind::Array => value.is_array(),
            ValueKind::Object => value.is_object(),
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueKind::String => "string",
            ValueKind::Number => "number",
            ValueKind::Integer => "integer",
            ValueKind::Boolean => "boolean",
            ValueKind::Array => "array",
            ValueKind::Object => "object",
        };
        f.write_str(s)
    }
}

/// How a run with failed steps is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputPolicy {
    /// Any failed step fails the run.
    #[default]
    Strict,
    /// A run with failures is PARTIAL when every required output still resolved.
    AllowPartial,
}

// ---------------------------------------------------------------------------
// Step state and results
// ---------------------------------------------------------------------------

/// Lifecycle state of a single step within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Ready,
    Running,
    Retrying,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl StepState {
    /// Terminal states admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Success | StepState::Failed | StepState::Skipped | StepState::Cancelled
        )
    }

    /// FAILED and CANCELLED both disqualify a run.
    pub fn is_disqualifying(&self) -> bool {
        matches!(self, StepState::Failed | StepState::Cancelled)
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepState::Pending => "PENDING",
            StepState::Ready => "READY",
            StepState::Running => "RUNNING",
            StepState::Retrying => "RETRYING",
            StepState::Success => "SUCCESS",
            StepState::Failed => "FAILED",
            StepState::Skipped => "SKIPPED",
            StepState::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Why a step was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SkipReason {
    /// `when` evaluated false or `unless` evaluated true.
    Condition,
    /// A dependency terminated FAILED or CANCELLED.
    UpstreamFailed { dependency: String },
}

/// Terminal record of one step in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step: String,
    pub state: StepState,
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// Routing target that produced the outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Model/agent tier of that target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_tier: Option<String>,
}

impl StepResult {
    pub fn skipped(step: impl Into<String>, reason: SkipReason) -> Self {
        Self {
            step: step.into(),
            state: StepState::Skipped,
            outputs: Map::new(),
            error: None,
            duration_ms: 0,
            retry_count: 0,
            skip_reason: Some(reason),
            target: None,
            model_tier: None,
        }
    }
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Success,
    Failed,
    Partial,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowStatus::Success => "SUCCESS",
            WorkflowStatus::Failed => "FAILED",
            WorkflowStatus::Partial => "PARTIAL",
        };
        f.write_str(s)
    }
}

/// Everything a finished (or stopped) run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub workflow_version: String,
    pub overall_status: WorkflowStatus,
    /// Declared outputs that resolved to a non-null value.
    pub final_output: BTreeMap<String, Value>,
    /// Step results in the order they were recorded.
    pub step_results: Vec<StepResult>,
    /// Required outputs that could not be resolved.
    pub unresolved_required_outputs: Vec<String>,
    /// Steps that never reached a terminal state (run cancelled or timed out).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub incomplete_steps: Vec<String>,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl WorkflowResult {
    /// Result for the named step, if it reached a terminal state.
    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.step == name)
    }

    /// Number of steps that terminated in `state`.
    pub fn count(&self, state: StepState) -> usize {
        self.step_results.iter().filter(|r| r.state == state).count()
    }

    pub fn is_success(&self) -> bool {
        self.overall_status == WorkflowStatus::Success
    }
}

// ---------------------------------------------------------------------------
// Dataset samples
// ---------------------------------------------------------------------------

/// A normalized dataset sample fed to a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSample {
    pub sample_id: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// Baseline answer for pairwise comparison.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<Value>,
    /// Capability-compatibility verdict from the dataset layer.
    #[serde(default = "default_true")]
    pub compatible: bool,
}

impl DatasetSample {
    pub fn new(sample_id: impl Into<String>) -> Self {
        Self {
            sample_id: sample_id.into(),
            inputs: Map::new(),
            reference: None,
            compatible: true,
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn with_reference(mut self, reference: Value) -> Self {
        self.reference = Some(reference);
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
