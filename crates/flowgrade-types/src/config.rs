//! Engine configuration types for flowgrade.
//!
//! `EngineConfig` mirrors `flowgrade.toml`. Every section and field has a
//! default so that an empty file (or no file) yields a working engine.

use serde::{Deserialize, Serialize};

use crate::evaluation::ScoringProfile;
use crate::workflow::{Backoff, OutputPolicy, RetryPolicy};

/// Top-level configuration for the execution and evaluation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub retry: RetryDefaults,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub judge: JudgeConfig,
    #[serde(default)]
    pub repair: RepairConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub strategy: ExecutionStrategy,
    /// Custom scoring profiles registered next to the built-in A-D.
    #[serde(default)]
    pub profiles: Vec<ScoringProfile>,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Run-level timeout (30 minutes).
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    /// Per-attempt step timeout (5 minutes).
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    #[serde(default)]
    pub output_policy: OutputPolicy,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_run_timeout_secs() -> u64 {
    1800
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            run_timeout_secs: default_run_timeout_secs(),
            step_timeout_secs: default_step_timeout_secs(),
            output_policy: OutputPolicy::default(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Retry policy applied to steps that declare none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryDefaults {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl RetryDefaults {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: Backoff::Exponential {
                initial_ms: self.initial_backoff_ms,
                max_ms: self.max_backoff_ms,
                multiplier: self.multiplier,
            },
        }
    }
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Minimum weighted score (0-100) to pass.
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: f64,
    #[serde(default = "default_reliability_prior")]
    pub reliability_prior: f64,
    #[serde(default = "default_reliability_k")]
    pub reliability_k: f64,
    /// Allowed deviation of a rubric's weight sum from 1.0.
    #[serde(default = "default_weight_tolerance")]
    pub weight_tolerance: f64,
    /// Criterion used to break ties between equally scored attempts.
    #[serde(default = "default_tiebreak_criterion")]
    pub tiebreak_criterion: String,
}

fn default_pass_threshold() -> f64 {
    70.0
}

fn default_reliability_prior() -> f64 {
    0.5
}

fn default_reliability_k() -> f64 {
    20.0
}

fn default_weight_tolerance() -> f64 {
    0.01
}

fn default_tiebreak_criterion() -> String {
    "correctness".to_string()
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            pass_threshold: default_pass_threshold(),
            reliability_prior: default_reliability_prior(),
            reliability_k: default_reliability_k(),
            weight_tolerance: default_weight_tolerance(),
            tiebreak_criterion: default_tiebreak_criterion(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeConfig {
    #[serde(default)]
    pub temperature: f32,
    /// Reruns allowed after a malformed or inconsistent verdict.
    #[serde(default = "default_max_reruns")]
    pub max_reruns: u32,
    /// Largest disagreement, in scale points, between swapped-order calls.
    #[serde(default = "default_scale_tolerance")]
    pub scale_tolerance: f64,
    #[serde(default = "default_prompt_version")]
    pub prompt_version: String,
}

fn default_max_reruns() -> u32 {
    1
}

fn default_scale_tolerance() -> f64 {
    1.0
}

fn default_prompt_version() -> String {
    "judge-v1".to_string()
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_reruns: default_max_reruns(),
            scale_tolerance: default_scale_tolerance(),
            prompt_version: default_prompt_version(),
        }
    }
}

// ---------------------------------------------------------------------------
// Strategy, repair, router
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_duration_secs() -> u64 {
    3600
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_duration_secs: default_max_duration_secs(),
        }
    }
}

/// Closed set of execution strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// One executor run, output returned unchanged.
    #[default]
    DagOnce,
    /// Run, evaluate, feed failures back, rerun.
    IterativeRepair {
        max_attempts: u32,
        max_duration_secs: u64,
    },
}

impl ExecutionStrategy {
    pub fn iterative(repair: &RepairConfig) -> Self {
        ExecutionStrategy::IterativeRepair {
            max_attempts: repair.max_attempts,
            max_duration_secs: repair.max_duration_secs,
        }
    }
}

/// Adaptive cooldown settings for routed action targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Consecutive failures before a target cools down.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_base_cooldown_ms")]
    pub base_cooldown_ms: u64,
    #[serde(default = "default_max_cooldown_ms")]
    pub max_cooldown_ms: u64,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_base_cooldown_ms() -> u64 {
    1_000
}

fn default_max_cooldown_ms() -> u64 {
    60_000
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            base_cooldown_ms: default_base_cooldown_ms(),
            max_cooldown_ms: default_max_cooldown_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.executor.max_concurrency, 4);
        assert_eq!(config.executor.run_timeout_secs, 1800);
        assert_eq!(config.evaluation.pass_threshold, 70.0);
        assert_eq!(config.evaluation.reliability_k, 20.0);
        assert_eq!(config.judge.max_reruns, 1);
        assert_eq!(config.strategy, ExecutionStrategy::DagOnce);
        assert!(config.profiles.is_empty());
    }

    #[test]
    fn test_engine_config_deserialize_empty() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
[executor]
max_concurrency = 8
output_policy = "allow_partial"

[evaluation]
pass_threshold = 75.0

[strategy]
kind = "iterative_repair"
max_attempts = 5
max_duration_secs = 600

[[profiles]]
profile_id = "latency"
criteria = [
  { name = "p95", weight = 1.0, formula_id = "lower_is_better", source = { type = "objective", path = "${outputs.p95_ms}" }, slo = { good = 100.0, bad = 900.0 } },
]
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.executor.max_concurrency, 8);
        assert_eq!(config.executor.step_timeout_secs, 300);
        assert_eq!(config.executor.output_policy, OutputPolicy::AllowPartial);
        assert_eq!(config.evaluation.pass_threshold, 75.0);
        assert_eq!(config.evaluation.tiebreak_criterion, "correctness");
        assert_eq!(
            config.strategy,
            ExecutionStrategy::IterativeRepair {
                max_attempts: 5,
                max_duration_secs: 600
            }
        );
        assert_eq!(config.profiles.len(), 1);
        assert_eq!(config.profiles[0].criteria[0].formula_id, "lower_is_better");
    }

    #[test]
    fn test_retry_defaults_build_exponential_policy() {
        let policy = RetryDefaults::default().to_policy();
        assert_eq!(policy.max_retries, 0);
        assert!(matches!(
            policy.backoff,
            Backoff::Exponential {
                initial_ms: 200,
                ..
            }
        ));
    }
}
