//! Attribute keys on the spans the engine emits.
//!
//! Keys are dotted under `flowgrade.` so OpenTelemetry backends group them.
//! The engine opens these spans:
//!
//! - `workflow_run`: run id, workflow id, iteration, and the run status once
//!   the run ends
//! - `workflow_step`: step name, then attempt, target and state as the step
//!   finishes
//! - `evaluation`: run, rubric, profile and sample ids, then the weighted
//!   score, grade and pass flag
//! - `judge_call`: judge model, model version and prompt version
//!
//! Use these constants to look fields up in exporters and tests.

// --- Run ---

pub const RUN_ID: &str = "flowgrade.run.id";
pub const WORKFLOW_ID: &str = "flowgrade.workflow.id";
/// 1-based iterative-repair attempt.
pub const ITERATION: &str = "flowgrade.iteration";
pub const RUN_STATUS: &str = "flowgrade.run.status";

// --- Step ---

pub const STEP_NAME: &str = "flowgrade.step.name";
pub const STEP_ATTEMPT: &str = "flowgrade.step.attempt";
/// Route target the step ran on.
pub const STEP_TARGET: &str = "flowgrade.step.target";
pub const STEP_STATE: &str = "flowgrade.step.state";

// --- Evaluation ---

pub const SAMPLE_ID: &str = "flowgrade.sample.id";
pub const RUBRIC_ID: &str = "flowgrade.rubric.id";
pub const PROFILE_ID: &str = "flowgrade.profile.id";
pub const SCORE_WEIGHTED: &str = "flowgrade.score.weighted";
pub const GRADE: &str = "flowgrade.grade";
pub const PASSED: &str = "flowgrade.passed";

// --- Judge ---

pub const JUDGE_MODEL: &str = "flowgrade.judge.model";
pub const JUDGE_MODEL_VERSION: &str = "flowgrade.judge.model_version";
pub const JUDGE_PROMPT_VERSION: &str = "flowgrade.judge.prompt_version";

/// Every key, for exporters that filter on the `flowgrade.` namespace.
pub const ALL: &[&str] = &[
    RUN_ID,
    WORKFLOW_ID,
    ITERATION,
    RUN_STATUS,
    STEP_NAME,
    STEP_ATTEMPT,
    STEP_TARGET,
    STEP_STATE,
    SAMPLE_ID,
    RUBRIC_ID,
    PROFILE_ID,
    SCORE_WEIGHTED,
    GRADE,
    PASSED,
    JUDGE_MODEL,
    JUDGE_MODEL_VERSION,
    JUDGE_PROMPT_VERSION,
];
