//! Execution strategies wrapping the executor.
//!
//! `DagOnceStrategy` is a plain pass-through to [`DagExecutor::execute_with`].
//! `IterativeRepairStrategy` runs, evaluates, and reruns with feedback until
//! an attempt passes, its attempt/duration budget is spent, or the caller
//! cancels. Attempts are strictly sequential: each one needs the previous
//! attempt's evaluation.

use std::time::Duration;

use flowgrade_types::config::{EvaluationConfig, ExecutionStrategy};
use flowgrade_types::evaluation::AttemptRecord;
use flowgrade_types::event::FlowEvent;
use flowgrade_types::workflow::WorkflowResult;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::eval::engine::{EvaluationEngine, EvaluationError, EvaluationTarget};
use crate::eval::feedback::build_feedback;

use super::context::{ExecutionContext, IterationMeta};
use super::executor::{DagExecutor, ExecutorError, RunOptions};
use super::graph::WorkflowGraph;

#[derive(Debug, thiserror::Error)]
pub enum StrategyError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
}

/// A single executor run with the configured concurrency.
pub struct DagOnceStrategy;

impl DagOnceStrategy {
    pub async fn run(
        executor: &DagExecutor,
        graph: &WorkflowGraph,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<WorkflowResult, ExecutorError> {
        let options = RunOptions {
            run_timeout: None,
            cancel: Some(cancel.clone()),
        };
        executor
            .execute_with(graph, ctx, executor.config().max_concurrency, options)
            .await
    }
}

/// Why the repair loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStop {
    Passed,
    AttemptsExhausted,
    DurationExceeded,
    /// The caller's token fired or an attempt's run was cancelled.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct RepairOutcome {
    /// One record per attempt, in order. Never empty.
    pub attempts: Vec<AttemptRecord>,
    /// Index of the returned attempt: the passing one, else the best scored.
    pub best_index: usize,
    pub stop: RepairStop,
}

impl RepairOutcome {
    pub fn best(&self) -> &AttemptRecord {
        &self.attempts[self.best_index]
    }

    pub fn passed(&self) -> bool {
        self.stop == RepairStop::Passed
    }
}

#[derive(Debug, Clone)]
pub struct IterativeRepairStrategy {
    max_attempts: u32,
    max_duration: Duration,
    tiebreak_criterion: String,
}

impl IterativeRepairStrategy {
    pub fn new(max_attempts: u32, max_duration: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            max_duration,
            tiebreak_criterion: "correctness".to_string(),
        }
    }

    pub fn with_tiebreak(mut self, criterion: impl Into<String>) -> Self {
        self.tiebreak_criterion = criterion.into();
        self
    }

    /// `None` for `ExecutionStrategy::DagOnce`.
    pub fn from_strategy(strategy: &ExecutionStrategy, evaluation: &EvaluationConfig) -> Option<Self> {
        match strategy {
            ExecutionStrategy::DagOnce => None,
            ExecutionStrategy::IterativeRepair {
                max_attempts,
                max_duration_secs,
            } => Some(
                Self::new(*max_attempts, Duration::from_secs(*max_duration_secs))
                    .with_tiebreak(evaluation.tiebreak_criterion.clone()),
            ),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    /// Run the repair loop. `base` supplies the variables every attempt
    /// starts from; each attempt gets a fresh context and run id.
    ///
    /// Cancelling `cancel` stops the in-flight attempt and ends the loop
    /// after it is evaluated. So does [`DagExecutor::cancel`] on the
    /// attempt's run id.
    pub async fn run(
        &self,
        executor: &DagExecutor,
        engine: &EvaluationEngine,
        graph: &WorkflowGraph,
        base: &ExecutionContext,
        target: EvaluationTarget<'_>,
        cancel: &CancellationToken,
    ) -> Result<RepairOutcome, StrategyError> {
        let started = Instant::now();
        let bus = executor.event_bus();
        let config_timeout = Duration::from_secs(executor.config().run_timeout_secs);
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut feedback: Option<String> = None;

        let stop = loop {
            let attempt = attempts.len() as u32 + 1;
            bus.publish(FlowEvent::IterationStart {
                attempt,
                max_attempts: self.max_attempts,
            });
            tracing::info!(
                workflow = graph.workflow_id(),
                attempt,
                max_attempts = self.max_attempts,
                "starting repair attempt"
            );

            let mut ctx = base.fresh_attempt(IterationMeta {
                attempt,
                max_attempts: self.max_attempts,
                feedback: feedback.take(),
            });
            let remaining = self.max_duration.saturating_sub(started.elapsed());
            let attempt_start = Instant::now();
            let result = executor
                .execute_with(
                    graph,
                    &mut ctx,
                    executor.config().max_concurrency,
                    RunOptions {
                        run_timeout: Some(remaining.min(config_timeout)),
                        cancel: Some(cancel.child_token()),
                    },
                )
                .await?;
            let report = engine.evaluate(graph, &result, target).await?;

            bus.publish(FlowEvent::IterationEnd {
                attempt,
                passed: report.passed,
                weighted_score: report.weighted_score,
            });

            let stop = if report.passed {
                Some(RepairStop::Passed)
            } else if result.cancelled || cancel.is_cancelled() {
                Some(RepairStop::Cancelled)
            } else if attempt >= self.max_attempts {
                Some(RepairStop::AttemptsExhausted)
            } else if started.elapsed() >= self.max_duration {
                Some(RepairStop::DurationExceeded)
            } else {
                None
            };
            let next_feedback = stop
                .is_none()
                .then(|| build_feedback(&report, &result, attempt));

            tracing::info!(
                workflow = graph.workflow_id(),
                attempt,
                passed = report.passed,
                weighted_score = report.weighted_score,
                "repair attempt evaluated"
            );
            attempts.push(AttemptRecord {
                attempt,
                result,
                report,
                feedback: next_feedback.clone(),
                duration_ms: attempt_start.elapsed().as_millis() as u64,
            });

            if let Some(stop) = stop {
                break stop;
            }
            feedback = next_feedback;
        };

        let best_index = match stop {
            RepairStop::Passed => attempts.len() - 1,
            _ => select_best(&attempts, &self.tiebreak_criterion),
        };
        if stop != RepairStop::Passed {
            tracing::warn!(
                workflow = graph.workflow_id(),
                attempts = attempts.len(),
                best = best_index + 1,
                ?stop,
                "repair loop ended without a passing attempt"
            );
        }

        Ok(RepairOutcome {
            attempts,
            best_index,
            stop,
        })
    }
}

/// Highest weighted score, then fewest gate failures, then the higher
/// tiebreak criterion. The earliest attempt wins a full tie.
fn select_best(attempts: &[AttemptRecord], tiebreak: &str) -> usize {
    let key = |a: &AttemptRecord| {
        (
            a.report.weighted_score,
            a.report.hard_gates.failed_count(),
            a.report
                .criterion(tiebreak)
                .map_or(0.0, |c| c.normalized_score),
        )
    };

    let mut best = 0;
    for (i, candidate) in attempts.iter().enumerate().skip(1) {
        let (score, gates, tie) = key(candidate);
        let (best_score, best_gates, best_tie) = key(&attempts[best]);
        let better = score > best_score
            || (score == best_score && gates < best_gates)
            || (score == best_score && gates == best_gates && tie > best_tie);
        if better {
            best = i;
        }
    }
    best
}
