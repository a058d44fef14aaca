//! WorkflowRunner -- compatibility check, strategy, evaluation and run log.
//!
//! The runner is the engine's front door: it rejects a dataset sample that
//! cannot drive the workflow before anything executes, runs the configured
//! strategy, and appends one run-log record per evaluated attempt. Its
//! cancellation token reaches every run it starts.

use flowgrade_types::config::{EvaluationConfig, ExecutionStrategy};
use flowgrade_types::error::{CompatibilityError, RunLogError};
use flowgrade_types::evaluation::{AttemptRecord, RubricDefinition};
use flowgrade_types::workflow::DatasetSample;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::eval::engine::{EvaluationEngine, EvaluationTarget};
use crate::eval::gates::check_compatibility;
use crate::eval::reliability::AggregateReport;
use crate::run_log::{RunLogSink, build_run_log};
use crate::workflow::context::ExecutionContext;
use crate::workflow::executor::DagExecutor;
use crate::workflow::graph::WorkflowGraph;
use crate::workflow::strategy::{
    DagOnceStrategy, IterativeRepairStrategy, RepairOutcome, RepairStop, StrategyError,
};

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Compatibility(#[from] CompatibilityError),

    #[error(transparent)]
    Strategy(#[from] StrategyError),

    #[error(transparent)]
    RunLog(#[from] RunLogError),
}

/// Results of running a whole dataset through one workflow.
#[derive(Debug, Clone)]
pub struct DatasetReport {
    /// `(sample_id, outcome)` for every compatible sample, in input order.
    pub outcomes: Vec<(String, RepairOutcome)>,
    /// Samples rejected before execution.
    pub rejected: Vec<CompatibilityError>,
    /// Aggregate over the returned attempt of each outcome.
    pub aggregate: AggregateReport,
}

pub struct WorkflowRunner<S: RunLogSink> {
    executor: DagExecutor,
    engine: EvaluationEngine,
    sink: S,
    strategy: ExecutionStrategy,
    evaluation: EvaluationConfig,
    cancel: CancellationToken,
}

impl<S: RunLogSink> WorkflowRunner<S> {
    pub fn new(executor: DagExecutor, engine: EvaluationEngine, sink: S) -> Self {
        let evaluation = engine.config().clone();
        Self {
            executor,
            engine,
            sink,
            strategy: ExecutionStrategy::DagOnce,
            evaluation,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Tie every run to `token`: cancelling it stops the current run and
    /// any dataset run in progress.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn executor(&self) -> &DagExecutor {
        &self.executor
    }

    pub fn engine(&self) -> &EvaluationEngine {
        &self.engine
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Run `graph` once (or as a repair loop) and evaluate it.
    ///
    /// Sample inputs are merged over `variables` and visible to steps as
    /// `${variables.<input>}`.
    pub async fn run(
        &self,
        graph: &WorkflowGraph,
        variables: Map<String, Value>,
        target: EvaluationTarget<'_>,
    ) -> Result<RepairOutcome, RunnerError> {
        if let Some(sample) = target.sample {
            check_compatibility(graph, sample).inspect_err(|e| {
                tracing::warn!(
                    workflow = graph.workflow_id(),
                    sample = %sample.sample_id,
                    error = %e,
                    "sample rejected before execution"
                );
            })?;
        }

        let mut variables = variables;
        if let Some(sample) = target.sample {
            variables.extend(sample.inputs.clone());
        }
        let base = ExecutionContext::new(graph.workflow_id()).with_variables(variables);
        let sample_id = target.sample.map(|s| s.sample_id.as_str());

        let outcome = match IterativeRepairStrategy::from_strategy(&self.strategy, &self.evaluation)
        {
            Some(repair) => {
                let outcome = repair
                    .run(&self.executor, &self.engine, graph, &base, target, &self.cancel)
                    .await?;
                for record in &outcome.attempts {
                    self.sink
                        .append(&build_run_log(
                            &record.result,
                            &record.report,
                            sample_id,
                            Some(record.attempt),
                        ))
                        .await?;
                }
                outcome
            }
            None => {
                let started = Instant::now();
                let mut ctx = base;
                let result = DagOnceStrategy::run(&self.executor, graph, &mut ctx, &self.cancel)
                    .await
                    .map_err(StrategyError::from)?;
                let report = self
                    .engine
                    .evaluate(graph, &result, target)
                    .await
                    .map_err(StrategyError::from)?;
                self.sink
                    .append(&build_run_log(&result, &report, sample_id, None))
                    .await?;

                let stop = if report.passed {
                    RepairStop::Passed
                } else if result.cancelled {
                    RepairStop::Cancelled
                } else {
                    RepairStop::AttemptsExhausted
                };
                RepairOutcome {
                    attempts: vec![AttemptRecord {
                        attempt: 1,
                        result,
                        report,
                        feedback: None,
                        duration_ms: started.elapsed().as_millis() as u64,
                    }],
                    best_index: 0,
                    stop,
                }
            }
        };

        Ok(outcome)
    }

    /// Run every sample sequentially. Incompatible samples are collected in
    /// `rejected`; any other error aborts the dataset run. Samples not yet
    /// started when the runner is cancelled are left out.
    pub async fn run_dataset(
        &self,
        graph: &WorkflowGraph,
        samples: &[DatasetSample],
        rubric: Option<&RubricDefinition>,
        profile_id: Option<&str>,
    ) -> Result<DatasetReport, RunnerError> {
        let mut outcomes = Vec::with_capacity(samples.len());
        let mut rejected = Vec::new();

        for sample in samples {
            if self.cancel.is_cancelled() {
                tracing::info!(
                    workflow = graph.workflow_id(),
                    remaining = samples.len() - outcomes.len() - rejected.len(),
                    "dataset run cancelled"
                );
                break;
            }
            let target = EvaluationTarget {
                sample: Some(sample),
                rubric,
                profile_id,
            };
            match self.run(graph, Map::new(), target).await {
                Ok(outcome) => outcomes.push((sample.sample_id.clone(), outcome)),
                Err(RunnerError::Compatibility(e)) => rejected.push(e),
                Err(e) => return Err(e),
            }
        }

        let reports: Vec<_> = outcomes
            .iter()
            .map(|(_, o)| o.best().report.clone())
            .collect();
        let aggregate = AggregateReport::from_reports(&reports, &self.engine.reliability());
        tracing::info!(
            workflow = graph.workflow_id(),
            samples = samples.len(),
            rejected = rejected.len(),
            pass_rate = aggregate.pass_rate,
            "dataset run finished"
        );

        Ok(DatasetReport {
            outcomes,
            rejected,
            aggregate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use crate::run_log::MemoryRunLog;
    use crate::workflow::action::{ActionError, ActionInvocation, ActionOutput, FnAction};
    use crate::workflow::router::{ActionRouter, RouterState};
    use flowgrade_types::config::RepairConfig;
    use flowgrade_types::evaluation::{CriterionDefinition, ScoreSource};
    use flowgrade_types::workflow::{OutputDeclaration, StepDefinition};
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn graph() -> WorkflowGraph {
        WorkflowGraph::new("solve")
            .add(StepDefinition::new("answer", "agent").input("n", "${variables.n}"))
            .unwrap()
            .declare_output(OutputDeclaration::required(
                "score",
                "${steps.answer.outputs.score}",
            ))
            .unwrap()
            .require_input("n")
    }

    fn rubric() -> RubricDefinition {
        RubricDefinition {
            rubric_id: "solve".to_string(),
            version: semver::Version::new(1, 0, 0),
            criteria: vec![CriterionDefinition::new(
                "correctness",
                1.0,
                "zero_one",
                ScoreSource::objective("${outputs.score}"),
            )],
            pass_threshold: None,
        }
    }

    /// Scores `n / 10`, counting calls.
    fn runner(calls: Arc<AtomicU32>) -> WorkflowRunner<MemoryRunLog> {
        let action = FnAction::new(move |inv: ActionInvocation| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                let n = inv
                    .inputs
                    .get("n")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| ActionError::Permanent("n missing".to_string()))?;
                let out: ActionOutput = [("score".to_string(), json!(n / 10.0))]
                    .into_iter()
                    .collect();
                Ok(out)
            }
        });
        let executor = DagExecutor::new(
            ActionRouter::new().single("agent", action),
            RouterState::default(),
            EventBus::new(256),
        );
        WorkflowRunner::new(executor, EvaluationEngine::default(), MemoryRunLog::new())
    }

    #[tokio::test]
    async fn test_incompatible_sample_never_executes() {
        let calls = Arc::new(AtomicU32::new(0));
        let runner = runner(Arc::clone(&calls));
        let rubric = rubric();
        let sample = DatasetSample::new("empty");

        let err = runner
            .run(
                &graph(),
                Map::new(),
                EvaluationTarget::rubric(&rubric).with_sample(&sample),
            )
            .await
            .unwrap_err();

        match err {
            RunnerError::Compatibility(e) => {
                assert_eq!(e.sample_id, "empty");
                assert_eq!(e.reasons, vec!["missing required input 'n'"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(runner.sink().records().is_empty());
    }

    #[tokio::test]
    async fn test_single_run_is_evaluated_and_logged() {
        let calls = Arc::new(AtomicU32::new(0));
        let runner = runner(Arc::clone(&calls));
        let rubric = rubric();
        let sample = DatasetSample::new("s-9").with_input("n", json!(9));

        let outcome = runner
            .run(
                &graph(),
                Map::new(),
                EvaluationTarget::rubric(&rubric).with_sample(&sample),
            )
            .await
            .unwrap();

        assert!(outcome.passed());
        assert_eq!(outcome.attempts.len(), 1);
        assert!((outcome.best().report.weighted_score - 90.0).abs() < 1e-9);

        let records = runner.sink().records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sample_id.as_deref(), Some("s-9"));
        assert_eq!(records[0].attempt, None);
        assert!(records[0].hard_gates.dataset_workflow_compatible);
    }

    #[tokio::test]
    async fn test_repair_strategy_logs_every_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let runner = runner(Arc::clone(&calls)).with_strategy(ExecutionStrategy::iterative(
            &RepairConfig {
                max_attempts: 3,
                max_duration_secs: 600,
            },
        ));
        let rubric = rubric();
        let sample = DatasetSample::new("low").with_input("n", json!(2));

        let outcome = runner
            .run(
                &graph(),
                Map::new(),
                EvaluationTarget::rubric(&rubric).with_sample(&sample),
            )
            .await
            .unwrap();

        assert_eq!(outcome.stop, RepairStop::AttemptsExhausted);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let attempts: Vec<_> = runner
            .sink()
            .records()
            .iter()
            .map(|r| r.attempt)
            .collect();
        assert_eq!(attempts, vec![Some(1), Some(2), Some(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelling_the_runner_stops_the_repair_loop() {
        let action = FnAction::new(|_inv: ActionInvocation| async move {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok([("score".to_string(), json!(1.0))].into_iter().collect())
        });
        let executor = DagExecutor::new(
            ActionRouter::new().single("agent", action),
            RouterState::default(),
            EventBus::new(64),
        );
        let token = CancellationToken::new();
        let runner = WorkflowRunner::new(executor, EvaluationEngine::default(), MemoryRunLog::new())
            .with_strategy(ExecutionStrategy::iterative(&RepairConfig {
                max_attempts: 3,
                max_duration_secs: 600,
            }))
            .with_cancellation(token.clone());
        let rubric = rubric();
        let sample = DatasetSample::new("slow").with_input("n", json!(1));
        let graph = graph();

        let (outcome, _) = tokio::join!(
            runner.run(
                &graph,
                Map::new(),
                EvaluationTarget::rubric(&rubric).with_sample(&sample),
            ),
            async {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                token.cancel();
            }
        );
        let outcome = outcome.unwrap();

        assert_eq!(outcome.stop, RepairStop::Cancelled);
        assert_eq!(outcome.attempts.len(), 1);
        assert!(outcome.best().result.cancelled);
        assert_eq!(runner.sink().records().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_runner_skips_remaining_samples() {
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        token.cancel();
        let runner = runner(Arc::clone(&calls)).with_cancellation(token);
        let rubric = rubric();
        let samples = vec![DatasetSample::new("a").with_input("n", json!(10))];

        let report = runner
            .run_dataset(&graph(), &samples, Some(&rubric), None)
            .await
            .unwrap();

        assert!(report.outcomes.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(runner.sink().records().is_empty());
    }

    #[tokio::test]
    async fn test_dataset_run_aggregates_and_rejects() {
        let calls = Arc::new(AtomicU32::new(0));
        let runner = runner(Arc::clone(&calls));
        let rubric = rubric();
        let samples = vec![
            DatasetSample::new("a").with_input("n", json!(10)),
            DatasetSample::new("b").with_input("n", json!(5)),
            DatasetSample::new("c"),
        ];

        let report = runner
            .run_dataset(&graph(), &samples, Some(&rubric), None)
            .await
            .unwrap();

        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].sample_id, "c");
        assert_eq!(report.aggregate.sample_count, 2);
        assert_eq!(report.aggregate.passed_count, 1);
        assert!((report.aggregate.mean_weighted_score - 75.0).abs() < 1e-9);
        let correctness = report.aggregate.criterion("correctness").unwrap();
        assert!((correctness.mean_normalized - 0.75).abs() < 1e-9);
    }
}
