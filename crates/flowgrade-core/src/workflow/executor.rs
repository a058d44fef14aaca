//! Workflow executor: dynamic Kahn-driven concurrent DAG execution.
//!
//! The `DagExecutor` does not layer the graph into waves. Every step starts
//! with `in_degree = |depends_on|`; a step becomes READY the moment its last
//! dependency settles, and a bounded pool of tokio tasks picks READY steps up
//! as slots free. There is no barrier between independent branches.
//!
//! # Execution flow
//!
//! 1. Validate the graph, bind every step to its route, precompile every
//!    condition, input mapping and output source.
//! 2. Release root steps: a false `when` (or true `unless`) skips the step and
//!    settles it immediately, otherwise it becomes READY.
//! 3. Dispatch READY steps into a `JoinSet` while fewer than
//!    `max_concurrency` are in flight. Each task runs the step's action with
//!    per-attempt timeout and retry/backoff.
//! 4. The coordinator (this task, the only writer of `ExecutionContext`)
//!    records each finished step, then walks its dependents: a FAILED or
//!    CANCELLED dependency skips them transitively, anything else decrements
//!    their in-degree and releases those that reach zero.
//! 5. The run stops when nothing is in flight, or when the run deadline or
//!    the cancellation token fires. In the latter case in-flight steps end
//!    CANCELLED and never-started steps are reported as incomplete.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use flowgrade_types::config::{ExecutorConfig, RetryDefaults};
use flowgrade_types::event::FlowEvent;
use flowgrade_types::workflow::{
    OutputDeclaration, OutputPolicy, RetryPolicy, SkipReason, StepResult, StepState,
    WorkflowResult, WorkflowStatus,
};
use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing::field::{Empty, display};
use uuid::Uuid;

use crate::event::EventBus;

use super::action::{ActionError, ActionInvocation};
use super::context::{ContextError, ExecutionContext};
use super::expression::Expression;
use super::graph::{GraphValidationError, WorkflowGraph};
use super::retry::RetryHandler;
use super::router::{
    ActionRouter, BoundRoutes, RouteTarget, RoutedOutput, RouterError, RouterState, invoke_routed,
};
use super::state::{StepStateMachine, TransitionError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a single step attempt did not produce outputs.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepExecutionError {
    #[error("{0}")]
    Action(ActionError),

    #[error("step timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("step cancelled")]
    Cancelled,

    #[error("step task panicked: {0}")]
    Panicked(String),
}

impl StepExecutionError {
    /// Transient action failures and timeouts may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StepExecutionError::Action(ActionError::Failed(_)) | StepExecutionError::Timeout { .. }
        )
    }
}

impl From<ActionError> for StepExecutionError {
    fn from(err: ActionError) -> Self {
        match err {
            ActionError::Cancelled => StepExecutionError::Cancelled,
            other => StepExecutionError::Action(other),
        }
    }
}

/// Problems that prevent a run from starting (or indicate an engine defect).
///
/// Step failures, cancellation and timeouts are not errors: they are
/// reported in the returned `WorkflowResult`.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("invalid workflow graph: {0}")]
    InvalidGraph(#[from] GraphValidationError),

    #[error("routing error: {0}")]
    Routing(#[from] RouterError),

    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),

    #[error("context error: {0}")]
    Context(#[from] ContextError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

// ---------------------------------------------------------------------------
// RunOptions
// ---------------------------------------------------------------------------

/// Per-run overrides.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Overrides `ExecutorConfig::run_timeout_secs`.
    pub run_timeout: Option<Duration>,
    /// Caller-owned cancellation. Cancelling it cancels the run.
    pub cancel: Option<CancellationToken>,
}

// ---------------------------------------------------------------------------
// DagExecutor
// ---------------------------------------------------------------------------

pub struct DagExecutor {
    router: Arc<ActionRouter>,
    router_state: RouterState,
    event_bus: EventBus,
    config: ExecutorConfig,
    retry_defaults: RetryDefaults,
    /// Cancellation tokens keyed by run_id.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

impl DagExecutor {
    pub fn new(router: ActionRouter, router_state: RouterState, event_bus: EventBus) -> Self {
        Self {
            router: Arc::new(router),
            router_state,
            event_bus,
            config: ExecutorConfig::default(),
            retry_defaults: RetryDefaults::default(),
            cancellation_tokens: DashMap::new(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig, retry_defaults: RetryDefaults) -> Self {
        self.config = config;
        self.retry_defaults = retry_defaults;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn router_state(&self) -> &RouterState {
        &self.router_state
    }

    /// Cancel an in-flight run. In-flight steps end CANCELLED.
    pub fn cancel(&self, run_id: Uuid) -> Result<(), ExecutorError> {
        match self.cancellation_tokens.get(&run_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(run_id = %run_id, "workflow run cancelled");
                Ok(())
            }
            None => Err(ExecutorError::RunNotFound(run_id)),
        }
    }

    pub fn is_running(&self, run_id: Uuid) -> bool {
        self.cancellation_tokens.contains_key(&run_id)
    }

    /// Run `graph` to completion (or until the run timeout) with at most
    /// `max_concurrency` steps in flight.
    pub async fn execute(
        &self,
        graph: &WorkflowGraph,
        ctx: &mut ExecutionContext,
        max_concurrency: usize,
    ) -> Result<WorkflowResult, ExecutorError> {
        self.execute_with(graph, ctx, max_concurrency, RunOptions::default())
            .await
    }

    pub async fn execute_with(
        &self,
        graph: &WorkflowGraph,
        ctx: &mut ExecutionContext,
        max_concurrency: usize,
        options: RunOptions,
    ) -> Result<WorkflowResult, ExecutorError> {
        graph.validate()?;
        let routes = self.router.bind(graph)?;
        let plans = self.compile(graph, &routes)?;
        let outputs = compile_outputs(graph.outputs())?;

        let run_id = ctx.run_id;
        let run_token = options
            .cancel
            .unwrap_or_else(CancellationToken::new)
            .child_token();
        self.cancellation_tokens.insert(run_id, run_token.clone());

        let run_timeout = options
            .run_timeout
            .unwrap_or(Duration::from_secs(self.config.run_timeout_secs));
        let deadline = run_deadline(Instant::now(), run_timeout);
        let limit = max_concurrency.max(1);
        let run_start = Instant::now();

        tracing::info!(
            run_id = %run_id,
            workflow = graph.workflow_id(),
            steps = graph.len(),
            max_concurrency = limit,
            "starting workflow run"
        );
        self.event_bus.publish(FlowEvent::RunStart {
            run_id,
            workflow_id: graph.workflow_id().to_string(),
            step_count: graph.len(),
        });

        let span = tracing::info_span!(
            "workflow_run",
            flowgrade.run.id = %run_id,
            flowgrade.workflow.id = graph.workflow_id(),
            flowgrade.iteration = ctx.iteration.attempt,
            flowgrade.run.status = Empty,
        );
        let mut coordinator = Coordinator::new(graph, plans, ctx, &self.event_bus);
        let outcome = self
            .drive(&mut coordinator, &run_token, deadline, limit)
            .instrument(span.clone())
            .await;
        self.cancellation_tokens.remove(&run_id);
        let stop = outcome?;

        let result = coordinator.finish(
            &outputs,
            self.config.output_policy,
            stop,
            run_start.elapsed().as_millis() as u64,
        );
        span.record("flowgrade.run.status", display(&result.overall_status));

        tracing::info!(
            run_id = %run_id,
            workflow = graph.workflow_id(),
            status = %result.overall_status,
            duration_ms = result.duration_ms,
            cancelled = result.cancelled,
            timed_out = result.timed_out,
            "workflow run finished"
        );
        self.event_bus.publish(FlowEvent::RunEnd {
            run_id,
            status: result.overall_status,
            duration_ms: result.duration_ms,
        });

        Ok(result)
    }

    fn compile(
        &self,
        graph: &WorkflowGraph,
        routes: &BoundRoutes,
    ) -> Result<HashMap<String, StepPlan>, ExecutorError> {
        let mut plans = HashMap::with_capacity(graph.len());
        for step in graph.steps() {
            let parse = |expr: &String| compile_expression(&step.name, expr);
            let targets = routes.targets(&step.name).ok_or_else(|| RouterError::UnknownRoute {
                step: step.name.clone(),
                route: step.action.route.clone(),
            })?;
            let inputs = step
                .input_mapping
                .iter()
                .map(|(name, expr)| Ok((name.clone(), parse(expr)?)))
                .collect::<Result<Vec<_>, ExecutorError>>()?;

            plans.insert(
                step.name.clone(),
                StepPlan {
                    when: step.when.as_ref().map(parse).transpose()?,
                    unless: step.unless.as_ref().map(parse).transpose()?,
                    inputs,
                    targets,
                    policy: step
                        .retry_policy
                        .clone()
                        .unwrap_or_else(|| self.retry_defaults.to_policy()),
                    timeout_secs: step.timeout_secs.unwrap_or(self.config.step_timeout_secs),
                    params: step.action.params.clone(),
                },
            );
        }
        Ok(plans)
    }

    /// The scheduling loop. Returns how the run stopped.
    async fn drive(
        &self,
        coordinator: &mut Coordinator<'_>,
        run_token: &CancellationToken,
        deadline: Instant,
        limit: usize,
    ) -> Result<StopReason, ExecutorError> {
        let mut join_set: JoinSet<StepOutcome> = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, String> = HashMap::new();
        let mut stop = StopReason::Drained;

        if run_token.is_cancelled() {
            stop = StopReason::Cancelled;
        }

        coordinator.seed()?;

        loop {
            if stop == StopReason::Drained {
                while join_set.len() < limit {
                    let Some(job) =
                        coordinator.next_job(run_token, &self.router_state, &self.event_bus)?
                    else {
                        break;
                    };
                    let step = job.step.clone();
                    let span = tracing::info_span!(
                        "workflow_step",
                        flowgrade.step.name = %step,
                        flowgrade.step.attempt = Empty,
                        flowgrade.step.target = Empty,
                        flowgrade.step.state = Empty,
                    );
                    let handle = join_set.spawn(run_step(job).instrument(span));
                    in_flight.insert(handle.id(), step);
                }
            }

            if join_set.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = run_token.cancelled(), if stop == StopReason::Drained => {
                    tracing::info!(run_id = %coordinator.run_id(), "run cancellation requested");
                    stop = StopReason::Cancelled;
                }
                _ = tokio::time::sleep_until(deadline), if stop == StopReason::Drained => {
                    tracing::warn!(run_id = %coordinator.run_id(), "run timeout reached, cancelling in-flight steps");
                    stop = StopReason::TimedOut;
                    run_token.cancel();
                }
                joined = join_set.join_next_with_id() => {
                    let outcome = match joined {
                        Some(Ok((id, outcome))) => {
                            in_flight.remove(&id);
                            outcome
                        }
                        Some(Err(join_err)) => {
                            let step = in_flight.remove(&join_err.id()).unwrap_or_default();
                            tracing::error!(step = %step, error = %join_err, "step task failed to join");
                            StepOutcome {
                                step,
                                retries: 0,
                                duration_ms: 0,
                                result: Err(StepExecutionError::Panicked(join_err.to_string())),
                            }
                        }
                        None => continue,
                    };
                    coordinator.complete(outcome)?;
                }
            }
        }

        Ok(stop)
    }
}

// ---------------------------------------------------------------------------
// Compiled plans
// ---------------------------------------------------------------------------

struct StepPlan {
    when: Option<Expression>,
    unless: Option<Expression>,
    inputs: Vec<(String, Expression)>,
    targets: Arc<[RouteTarget]>,
    policy: RetryPolicy,
    timeout_secs: u64,
    params: Value,
}

/// Far enough out to never fire, near enough to stay representable.
const FAR_DEADLINE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn run_deadline(now: Instant, run_timeout: Duration) -> Instant {
    now.checked_add(run_timeout)
        .unwrap_or_else(|| now + FAR_DEADLINE)
}

fn compile_expression(owner: &str, expr: &str) -> Result<Expression, ExecutorError> {
    Expression::parse(expr).map_err(|e| {
        ExecutorError::InvalidGraph(GraphValidationError::InvalidExpression {
            owner: owner.to_string(),
            expression: expr.to_string(),
            message: e.to_string(),
        })
    })
}

fn compile_outputs(
    outputs: &[OutputDeclaration],
) -> Result<Vec<(OutputDeclaration, Expression)>, ExecutorError> {
    outputs
        .iter()
        .map(|decl| {
            let expr = compile_expression(&format!("output {}", decl.name), &decl.source)?;
            Ok((decl.clone(), expr))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Drained,
    Cancelled,
    TimedOut,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// The serialized completion-handling region. Owns the per-step state
/// machines and is the only writer of the run's `ExecutionContext`.
struct Coordinator<'a> {
    graph: &'a WorkflowGraph,
    plans: HashMap<String, StepPlan>,
    machines: HashMap<String, StepStateMachine>,
    in_degree: HashMap<String, usize>,
    ready: VecDeque<String>,
    ctx: &'a mut ExecutionContext,
    events: &'a EventBus,
    // Expression scope of `ctx`, dropped whenever a result is recorded.
    scope: Option<Value>,
}

impl<'a> Coordinator<'a> {
    fn new(
        graph: &'a WorkflowGraph,
        plans: HashMap<String, StepPlan>,
        ctx: &'a mut ExecutionContext,
        events: &'a EventBus,
    ) -> Self {
        let machines = graph
            .steps()
            .iter()
            .map(|s| (s.name.clone(), StepStateMachine::new(&s.name)))
            .collect();
        let in_degree = graph
            .steps()
            .iter()
            .map(|s| (s.name.clone(), s.depends_on.len()))
            .collect();
        Self {
            graph,
            plans,
            machines,
            in_degree,
            ready: VecDeque::new(),
            ctx,
            events,
            scope: None,
        }
    }

    fn run_id(&self) -> Uuid {
        self.ctx.run_id
    }

    fn state_of(&self, step: &str) -> Option<StepState> {
        self.machines.get(step).map(|m| m.state())
    }

    fn transition(&mut self, step: &str, to: StepState) -> Result<(), ExecutorError> {
        if let Some(machine) = self.machines.get_mut(step) {
            machine.transition(to)?;
        }
        Ok(())
    }

    /// Release every step without dependencies.
    fn seed(&mut self) -> Result<(), ExecutorError> {
        let roots: Vec<String> = self
            .graph
            .steps()
            .iter()
            .filter(|s| s.depends_on.is_empty())
            .map(|s| s.name.clone())
            .collect();

        let mut settled = VecDeque::new();
        for root in roots {
            self.release(&root, &mut settled)?;
        }
        self.propagate(settled)
    }

    /// All dependencies of `step` are settled: evaluate its condition.
    fn release(&mut self, step: &str, settled: &mut VecDeque<String>) -> Result<(), ExecutorError> {
        let Some(plan) = self.plans.get(step) else {
            return Ok(());
        };
        let scope = self
            .scope
            .get_or_insert_with(|| self.ctx.to_expression_scope());
        let when_false = plan.when.as_ref().is_some_and(|e| !e.is_true(scope));
        let unless_true = plan.unless.as_ref().is_some_and(|e| e.is_true(scope));

        if when_false || unless_true {
            tracing::debug!(run_id = %self.ctx.run_id, step, "condition not met, skipping step");
            self.skip(step, SkipReason::Condition)?;
            settled.push_back(step.to_string());
        } else {
            self.transition(step, StepState::Ready)?;
            self.ready.push_back(step.to_string());
        }
        Ok(())
    }

    fn skip(&mut self, step: &str, reason: SkipReason) -> Result<(), ExecutorError> {
        self.transition(step, StepState::Skipped)?;
        self.ctx.record(StepResult::skipped(step, reason))?;
        self.scope = None;
        self.events.publish(FlowEvent::StepEnd {
            run_id: self.ctx.run_id,
            step: step.to_string(),
            state: StepState::Skipped,
            duration_ms: 0,
            retry_count: 0,
        });
        Ok(())
    }

    /// Walk dependents of every settled step, cascading skips and releasing
    /// steps whose in-degree reaches zero.
    fn propagate(&mut self, mut settled: VecDeque<String>) -> Result<(), ExecutorError> {
        while let Some(done) = settled.pop_front() {
            let upstream_failed = self.state_of(&done).is_some_and(|s| s.is_disqualifying())
                || self.skipped_for_upstream(&done);
            let dependents: Vec<String> = self
                .graph
                .dependents(&done)
                .into_iter()
                .map(str::to_string)
                .collect();

            for dependent in dependents {
                if self.state_of(&dependent) != Some(StepState::Pending) {
                    continue;
                }
                if upstream_failed {
                    tracing::debug!(
                        run_id = %self.ctx.run_id,
                        step = %dependent,
                        dependency = %done,
                        "upstream failed, skipping step"
                    );
                    self.skip(
                        &dependent,
                        SkipReason::UpstreamFailed {
                            dependency: done.clone(),
                        },
                    )?;
                    settled.push_back(dependent);
                    continue;
                }

                let released = match self.in_degree.get_mut(&dependent) {
                    Some(remaining) => {
                        *remaining = remaining.saturating_sub(1);
                        *remaining == 0
                    }
                    None => false,
                };
                if released {
                    self.release(&dependent, &mut settled)?;
                }
            }
        }
        Ok(())
    }

    /// A step skipped because of a failed dependency fails its own
    /// dependents in turn, however deep the chain.
    fn skipped_for_upstream(&self, step: &str) -> bool {
        matches!(
            self.ctx.step_result(step).and_then(|r| r.skip_reason.as_ref()),
            Some(SkipReason::UpstreamFailed { .. })
        )
    }

    /// Take the next READY step, move it to RUNNING and package its job.
    fn next_job(
        &mut self,
        run_token: &CancellationToken,
        router_state: &RouterState,
        events: &EventBus,
    ) -> Result<Option<StepJob>, ExecutorError> {
        let Some(step) = self.ready.pop_front() else {
            return Ok(None);
        };
        self.transition(&step, StepState::Running)?;

        let Some(plan) = self.plans.get(&step) else {
            return Ok(None);
        };
        let scope = self
            .scope
            .get_or_insert_with(|| self.ctx.to_expression_scope());
        let inputs: Map<String, Value> = plan
            .inputs
            .iter()
            .map(|(name, expr)| (name.clone(), expr.evaluate(scope)))
            .collect();

        tracing::debug!(run_id = %self.ctx.run_id, step = %step, "dispatching step");
        self.events.publish(FlowEvent::StepStart {
            run_id: self.ctx.run_id,
            step: step.clone(),
        });

        Ok(Some(StepJob {
            step: step.clone(),
            targets: Arc::clone(&plan.targets),
            policy: plan.policy.clone(),
            timeout_secs: plan.timeout_secs,
            router_state: router_state.clone(),
            events: events.clone(),
            invocation: ActionInvocation {
                run_id: self.ctx.run_id,
                step,
                params: plan.params.clone(),
                inputs,
                attempt: 1,
                cancel: run_token.clone(),
            },
        }))
    }

    /// Apply a finished step: replay its retries, reach the terminal state,
    /// record the result and settle dependents.
    fn complete(&mut self, outcome: StepOutcome) -> Result<(), ExecutorError> {
        let step = outcome.step;
        for _ in 0..outcome.retries {
            self.transition(&step, StepState::Retrying)?;
            self.transition(&step, StepState::Running)?;
        }

        let (state, outputs, error, target, model_tier) = match outcome.result {
            Ok(RoutedOutput {
                outputs,
                target,
                tier,
            }) => (StepState::Success, outputs, None, Some(target), Some(tier)),
            Err(StepExecutionError::Cancelled) => (
                StepState::Cancelled,
                Map::new(),
                Some(StepExecutionError::Cancelled.to_string()),
                None,
                None,
            ),
            Err(err) => (StepState::Failed, Map::new(), Some(err.to_string()), None, None),
        };
        self.transition(&step, state)?;

        let retry_count = self
            .machines
            .get(&step)
            .map(|m| m.retry_count())
            .unwrap_or(outcome.retries);

        if let Some(error) = &error {
            tracing::warn!(
                run_id = %self.ctx.run_id,
                step = %step,
                state = %state,
                retries = retry_count,
                error = %error,
                "step did not succeed"
            );
        }

        self.ctx.record(StepResult {
            step: step.clone(),
            state,
            outputs,
            error,
            duration_ms: outcome.duration_ms,
            retry_count,
            skip_reason: None,
            target,
            model_tier,
        })?;
        self.scope = None;
        self.events.publish(FlowEvent::StepEnd {
            run_id: self.ctx.run_id,
            step: step.clone(),
            state,
            duration_ms: outcome.duration_ms,
            retry_count,
        });

        self.propagate(VecDeque::from([step]))
    }

    fn finish(
        self,
        outputs: &[(OutputDeclaration, Expression)],
        policy: OutputPolicy,
        stop: StopReason,
        duration_ms: u64,
    ) -> WorkflowResult {
        let incomplete_steps: Vec<String> = self
            .graph
            .steps()
            .iter()
            .filter(|s| self.state_of(&s.name).is_some_and(|st| !st.is_terminal()))
            .map(|s| s.name.clone())
            .collect();

        let scope = self.ctx.to_expression_scope();
        let mut final_output = std::collections::BTreeMap::new();
        let mut unresolved_required_outputs = Vec::new();
        for (decl, expr) in outputs {
            match expr.evaluate(&scope) {
                Value::Null => {
                    if decl.required {
                        unresolved_required_outputs.push(decl.name.clone());
                    }
                }
                value => {
                    final_output.insert(decl.name.clone(), value);
                }
            }
        }

        let step_results = self.ctx.step_results().to_vec();
        let any_disqualified = step_results.iter().any(|r| r.state.is_disqualifying());
        let overall_status = if !any_disqualified && incomplete_steps.is_empty() {
            WorkflowStatus::Success
        } else if policy == OutputPolicy::AllowPartial && unresolved_required_outputs.is_empty() {
            WorkflowStatus::Partial
        } else {
            WorkflowStatus::Failed
        };

        WorkflowResult {
            run_id: self.ctx.run_id,
            workflow_id: self.graph.workflow_id().to_string(),
            workflow_version: self.graph.version().to_string(),
            overall_status,
            final_output,
            step_results,
            unresolved_required_outputs,
            incomplete_steps,
            cancelled: stop == StopReason::Cancelled,
            timed_out: stop == StopReason::TimedOut,
            duration_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct StepJob {
    step: String,
    targets: Arc<[RouteTarget]>,
    policy: RetryPolicy,
    timeout_secs: u64,
    router_state: RouterState,
    events: EventBus,
    invocation: ActionInvocation,
}

struct StepOutcome {
    step: String,
    retries: u32,
    duration_ms: u64,
    result: Result<RoutedOutput, StepExecutionError>,
}

/// Run one step to a terminal outcome: attempts, timeouts, backoff.
async fn run_step(job: StepJob) -> StepOutcome {
    let StepJob {
        step,
        targets,
        policy,
        timeout_secs,
        router_state,
        events,
        mut invocation,
    } = job;
    let token = invocation.cancel.clone();
    let timeout = Duration::from_secs(timeout_secs);
    let start = Instant::now();
    let mut retries = 0u32;

    let result = loop {
        invocation.attempt = retries + 1;

        let attempt = tokio::select! {
            biased;
            _ = token.cancelled() => Err(StepExecutionError::Cancelled),
            res = tokio::time::timeout(timeout, invoke_routed(&targets, &router_state, &invocation)) => {
                match res {
                    Ok(res) => res.map_err(StepExecutionError::from),
                    Err(_) => Err(StepExecutionError::Timeout { secs: timeout_secs }),
                }
            }
        };

        let err = match attempt {
            Ok(routed) => break Ok(routed),
            Err(err) => err,
        };
        if !RetryHandler::should_retry(&policy, retries, &err) {
            break Err(err);
        }

        retries += 1;
        let delay = RetryHandler::backoff_delay(&policy, retries);
        tracing::warn!(
            run_id = %invocation.run_id,
            step = %step,
            attempt = invocation.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "step attempt failed, retrying"
        );
        events.publish(FlowEvent::StepRetry {
            run_id: invocation.run_id,
            step: step.clone(),
            attempt: invocation.attempt,
            error: err.to_string(),
            delay_ms: delay.as_millis() as u64,
        });

        tokio::select! {
            biased;
            _ = token.cancelled() => break Err(StepExecutionError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    };

    let span = tracing::Span::current();
    span.record("flowgrade.step.attempt", invocation.attempt);
    let state = match &result {
        Ok(routed) => {
            span.record("flowgrade.step.target", routed.target.as_str());
            StepState::Success
        }
        Err(StepExecutionError::Cancelled) => StepState::Cancelled,
        Err(_) => StepState::Failed,
    };
    span.record("flowgrade.step.state", display(state));

    StepOutcome {
        step,
        retries,
        duration_ms: start.elapsed().as_millis() as u64,
        result,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::action::{ActionOutput, FnAction, StepAction};
    use flowgrade_types::workflow::StepDefinition;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use tokio::sync::broadcast;

    fn output(pairs: &[(&str, Value)]) -> ActionOutput {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    /// Action that returns its resolved inputs under "inputs" and logs the step.
    fn echo(log: Arc<Mutex<Vec<String>>>) -> impl StepAction {
        FnAction::new(move |inv: ActionInvocation| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(inv.step.clone());
                Ok(output(&[
                    ("inputs", Value::Object(inv.inputs.clone())),
                    ("step", json!(inv.step)),
                ]))
            }
        })
    }

    fn sleeper(ms: u64) -> impl StepAction {
        FnAction::new(move |inv: ActionInvocation| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(output(&[("step", json!(inv.step))]))
        })
    }

    fn failing() -> impl StepAction {
        FnAction::new(|_inv: ActionInvocation| async move {
            Err(ActionError::Failed("tool crashed".to_string()))
        })
    }

    fn executor(router: ActionRouter) -> DagExecutor {
        DagExecutor::new(router, RouterState::default(), EventBus::new(256))
    }

    fn drain(rx: &mut broadcast::Receiver<FlowEvent>) -> Vec<FlowEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn position(events: &[FlowEvent], pred: impl Fn(&FlowEvent) -> bool) -> Option<usize> {
        events.iter().position(pred)
    }

    fn is_start(event: &FlowEvent, name: &str) -> bool {
        matches!(event, FlowEvent::StepStart { step, .. } if step == name)
    }

    fn is_end(event: &FlowEvent, name: &str) -> bool {
        matches!(event, FlowEvent::StepEnd { step, .. } if step == name)
    }

    #[tokio::test]
    async fn test_linear_run_flows_data_between_steps() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = WorkflowGraph::new("wf")
            .add(StepDefinition::new("fetch", "echo").input("q", "${variables.query}"))
            .unwrap()
            .add(
                StepDefinition::new("summarize", "echo")
                    .depends_on(["fetch"])
                    .input("source", "${steps.fetch.outputs.inputs.q}"),
            )
            .unwrap()
            .declare_output(OutputDeclaration::required(
                "summary_source",
                "${steps.summarize.outputs.inputs.source}",
            ))
            .unwrap();

        let exec = executor(ActionRouter::new().single("echo", echo(Arc::clone(&log))));
        let mut ctx = ExecutionContext::new("wf");
        ctx.variables.insert("query".to_string(), json!("rust dag"));

        let result = exec.execute(&graph, &mut ctx, 4).await.unwrap();

        assert_eq!(result.overall_status, WorkflowStatus::Success);
        assert_eq!(result.final_output["summary_source"], json!("rust dag"));
        assert!(result.unresolved_required_outputs.is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["fetch", "summarize"]);
        assert_eq!(result.step("fetch").unwrap().target.as_deref(), Some("echo"));
        assert_eq!(result.step("fetch").unwrap().model_tier.as_deref(), Some("default"));
        assert!(!exec.is_running(ctx.run_id));
    }

    async fn run_diamond(b_ms: u64, c_ms: u64) {
        let d_calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&d_calls);
        let join = FnAction::new(move |inv: ActionInvocation| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(output(&[("seen", Value::Object(inv.inputs.clone()))]))
            }
        });

        let graph = WorkflowGraph::new("diamond")
            .add(StepDefinition::new("a", "fast"))
            .unwrap()
            .add(StepDefinition::new("b", "b").depends_on(["a"]))
            .unwrap()
            .add(StepDefinition::new("c", "c").depends_on(["a"]))
            .unwrap()
            .add(
                StepDefinition::new("d", "join")
                    .depends_on(["b", "c"])
                    .input("b", "${steps.b.outputs.step}")
                    .input("c", "${steps.c.outputs.step}"),
            )
            .unwrap();

        let exec = executor(
            ActionRouter::new()
                .single("fast", sleeper(1))
                .single("b", sleeper(b_ms))
                .single("c", sleeper(c_ms))
                .single("join", join),
        );
        let mut rx = exec.event_bus().subscribe();
        let mut ctx = ExecutionContext::new("diamond");

        let result = exec.execute(&graph, &mut ctx, 4).await.unwrap();
        let events = drain(&mut rx);

        assert!(result.is_success());
        assert_eq!(d_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            result.step("d").unwrap().outputs["seen"],
            json!({"b": "b", "c": "c"})
        );
        let d_start = position(&events, |e| is_start(e, "d")).unwrap();
        assert!(position(&events, |e| is_end(e, "b")).unwrap() < d_start);
        assert!(position(&events, |e| is_end(e, "c")).unwrap() < d_start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_diamond_joins_once_when_b_finishes_first() {
        run_diamond(5, 50).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_diamond_joins_once_when_c_finishes_first() {
        run_diamond(50, 5).await;
    }

    #[tokio::test]
    async fn test_failure_cascades_skip_without_running() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = WorkflowGraph::new("wf")
            .add(StepDefinition::new("a", "echo"))
            .unwrap()
            .add(StepDefinition::new("b", "fail").depends_on(["a"]))
            .unwrap()
            .add(StepDefinition::new("c", "echo").depends_on(["a"]))
            .unwrap()
            .add(StepDefinition::new("d", "echo").depends_on(["b", "c"]))
            .unwrap()
            .add(StepDefinition::new("e", "echo").depends_on(["d"]))
            .unwrap();

        let exec = executor(
            ActionRouter::new()
                .single("echo", echo(Arc::clone(&log)))
                .single("fail", failing()),
        );
        let mut rx = exec.event_bus().subscribe();
        let mut ctx = ExecutionContext::new("wf");
        let result = exec.execute(&graph, &mut ctx, 2).await.unwrap();
        let events = drain(&mut rx);

        assert_eq!(result.overall_status, WorkflowStatus::Failed);
        assert_eq!(result.step("b").unwrap().state, StepState::Failed);
        assert_eq!(result.step("c").unwrap().state, StepState::Success);

        let d = result.step("d").unwrap();
        assert_eq!(d.state, StepState::Skipped);
        assert_eq!(
            d.skip_reason,
            Some(SkipReason::UpstreamFailed {
                dependency: "b".to_string()
            })
        );
        let e = result.step("e").unwrap();
        assert_eq!(
            e.skip_reason,
            Some(SkipReason::UpstreamFailed {
                dependency: "d".to_string()
            })
        );

        assert!(position(&events, |ev| is_start(ev, "d")).is_none());
        assert!(!log.lock().unwrap().contains(&"d".to_string()));
        assert!(result.incomplete_steps.is_empty());
    }

    #[tokio::test]
    async fn test_upstream_failure_skips_every_level_of_a_long_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = ["b", "c", "d", "e", "f"];
        let mut graph = WorkflowGraph::new("chain")
            .add(StepDefinition::new("a", "fail"))
            .unwrap();
        let mut previous = "a";
        for name in chain {
            graph = graph
                .add(StepDefinition::new(name, "echo").depends_on([previous]))
                .unwrap();
            previous = name;
        }

        let exec = executor(
            ActionRouter::new()
                .single("echo", echo(Arc::clone(&log)))
                .single("fail", failing()),
        );
        let mut ctx = ExecutionContext::new("chain");
        let result = exec.execute(&graph, &mut ctx, 4).await.unwrap();

        assert_eq!(result.overall_status, WorkflowStatus::Failed);
        assert_eq!(result.step("a").unwrap().state, StepState::Failed);
        let mut previous = "a";
        for name in chain {
            let step = result.step(name).unwrap();
            assert_eq!(step.state, StepState::Skipped, "step {name}");
            assert_eq!(
                step.skip_reason,
                Some(SkipReason::UpstreamFailed {
                    dependency: previous.to_string()
                })
            );
            previous = name;
        }
        assert!(log.lock().unwrap().is_empty());
        assert!(result.incomplete_steps.is_empty());
    }

    #[tokio::test]
    async fn test_condition_sees_sibling_skipped_in_same_release() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = WorkflowGraph::new("wf")
            .add(StepDefinition::new("a", "echo"))
            .unwrap()
            .add(
                StepDefinition::new("b", "echo")
                    .depends_on(["a"])
                    .when("${variables.full}"),
            )
            .unwrap()
            .add(
                StepDefinition::new("c", "echo")
                    .depends_on(["a"])
                    .when("${steps.b.state} == 'skipped'")
                    .input("from_a", "${steps.a.outputs.step}"),
            )
            .unwrap();

        let exec = executor(ActionRouter::new().single("echo", echo(Arc::clone(&log))));
        let mut ctx = ExecutionContext::new("wf");
        ctx.variables.insert("full".to_string(), json!(false));

        let result = exec.execute(&graph, &mut ctx, 4).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.step("b").unwrap().skip_reason, Some(SkipReason::Condition));
        let c = result.step("c").unwrap();
        assert_eq!(c.state, StepState::Success);
        assert_eq!(c.outputs["inputs"], json!({"from_a": "a"}));
        assert_eq!(*log.lock().unwrap(), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_steps_run_inside_a_step_span() {
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let action = FnAction::new(move |_inv: ActionInvocation| {
            let span = tracing::Span::current();
            let fields = span
                .metadata()
                .map(|m| {
                    let mut names = vec![m.name().to_string()];
                    names.extend(m.fields().iter().map(|f| f.name().to_string()));
                    names
                })
                .unwrap_or_default();
            log.lock().unwrap().extend(fields);
            async move { Ok(ActionOutput::new()) }
        });
        let graph = WorkflowGraph::new("wf")
            .add(StepDefinition::new("only", "traced"))
            .unwrap();
        let exec = executor(ActionRouter::new().single("traced", action));
        let mut ctx = ExecutionContext::new("wf");

        assert!(exec.execute(&graph, &mut ctx, 1).await.unwrap().is_success());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.first().map(String::as_str), Some("workflow_step"));
        for key in [
            "flowgrade.step.name",
            "flowgrade.step.attempt",
            "flowgrade.step.target",
            "flowgrade.step.state",
        ] {
            assert!(seen.iter().any(|f| f == key), "missing {key}");
        }
    }

    #[tokio::test]
    async fn test_condition_skip_releases_dependents() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = WorkflowGraph::new("wf")
            .add(StepDefinition::new("lint", "echo").when("${variables.strict} == true"))
            .unwrap()
            .add(StepDefinition::new("docs", "echo").unless("${variables.skip_docs}"))
            .unwrap()
            .add(StepDefinition::new("build", "echo").depends_on(["lint", "docs"]))
            .unwrap();

        let exec = executor(ActionRouter::new().single("echo", echo(Arc::clone(&log))));
        let mut ctx = ExecutionContext::new("wf");
        ctx.variables.insert("strict".to_string(), json!(false));
        ctx.variables.insert("skip_docs".to_string(), json!(true));

        let result = exec.execute(&graph, &mut ctx, 4).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.step("lint").unwrap().skip_reason, Some(SkipReason::Condition));
        assert_eq!(result.step("docs").unwrap().skip_reason, Some(SkipReason::Condition));
        assert_eq!(result.step("build").unwrap().state, StepState::Success);
        assert_eq!(*log.lock().unwrap(), vec!["build"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let flaky = FnAction::new(move |inv: ActionInvocation| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if inv.attempt < 3 {
                    Err(ActionError::Failed("rate limited".to_string()))
                } else {
                    Ok(output(&[("attempt", json!(inv.attempt))]))
                }
            }
        });

        let graph = WorkflowGraph::new("wf")
            .add(StepDefinition::new("call", "flaky").retry(RetryPolicy::fixed(3, 100)))
            .unwrap();
        let exec = executor(ActionRouter::new().single("flaky", flaky));
        let mut rx = exec.event_bus().subscribe();
        let mut ctx = ExecutionContext::new("wf");

        let result = exec.execute(&graph, &mut ctx, 1).await.unwrap();
        let events = drain(&mut rx);

        let call = result.step("call").unwrap();
        assert_eq!(call.state, StepState::Success);
        assert_eq!(call.retry_count, 2);
        assert_eq!(call.outputs["attempt"], json!(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(call.duration_ms >= 200);

        let retries: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                FlowEvent::StepRetry { attempt, delay_ms, .. } => {
                    assert_eq!(*delay_ms, 100);
                    Some(*attempt)
                }
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail() {
        let graph = WorkflowGraph::new("wf")
            .add(StepDefinition::new("call", "fail").retry(RetryPolicy::fixed(2, 0)))
            .unwrap();
        let exec = executor(ActionRouter::new().single("fail", failing()));
        let mut ctx = ExecutionContext::new("wf");
        let result = exec.execute(&graph, &mut ctx, 1).await.unwrap();

        let call = result.step("call").unwrap();
        assert_eq!(call.state, StepState::Failed);
        assert_eq!(call.retry_count, 2);
        assert_eq!(call.error.as_deref(), Some("tool crashed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_pool_is_bounded() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (cur, pk) = (Arc::clone(&current), Arc::clone(&peak));
        let tracked = FnAction::new(move |_inv: ActionInvocation| {
            let (cur, pk) = (Arc::clone(&cur), Arc::clone(&pk));
            async move {
                let now = cur.fetch_add(1, Ordering::SeqCst) + 1;
                pk.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                cur.fetch_sub(1, Ordering::SeqCst);
                Ok(ActionOutput::new())
            }
        });

        let mut graph = WorkflowGraph::new("wide");
        for i in 0..6 {
            graph = graph
                .add(StepDefinition::new(format!("s{i}"), "tracked"))
                .unwrap();
        }
        let exec = executor(ActionRouter::new().single("tracked", tracked));
        let mut ctx = ExecutionContext::new("wide");
        let result = exec.execute(&graph, &mut ctx, 2).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.count(StepState::Success), 6);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_fails_step() {
        let graph = WorkflowGraph::new("wf")
            .add(StepDefinition::new("slow", "slow").timeout_secs(1))
            .unwrap();
        let exec = executor(ActionRouter::new().single("slow", sleeper(5_000)));
        let mut ctx = ExecutionContext::new("wf");
        let result = exec.execute(&graph, &mut ctx, 1).await.unwrap();

        let slow = result.step("slow").unwrap();
        assert_eq!(slow.state, StepState::Failed);
        assert_eq!(slow.error.as_deref(), Some("step timed out after 1s"));
        assert!(!result.timed_out);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout_cancels_in_flight_and_reports_incomplete() {
        let graph = WorkflowGraph::new("wf")
            .add(StepDefinition::new("slow", "slow"))
            .unwrap()
            .add(StepDefinition::new("other", "slow"))
            .unwrap()
            .add(StepDefinition::new("after", "slow").depends_on(["slow"]))
            .unwrap();
        let exec = executor(ActionRouter::new().single("slow", sleeper(10_000)));
        let mut ctx = ExecutionContext::new("wf");

        let options = RunOptions {
            run_timeout: Some(Duration::from_secs(1)),
            cancel: None,
        };
        let result = exec.execute_with(&graph, &mut ctx, 1, options).await.unwrap();

        assert!(result.timed_out);
        assert!(!result.cancelled);
        assert_eq!(result.overall_status, WorkflowStatus::Failed);
        assert_eq!(result.step("slow").unwrap().state, StepState::Cancelled);
        assert_eq!(result.step("after").unwrap().state, StepState::Skipped);
        assert_eq!(result.incomplete_steps, vec!["other".to_string()]);
    }

    #[tokio::test]
    async fn test_unbounded_run_timeout_does_not_overflow() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = WorkflowGraph::new("wf")
            .add(StepDefinition::new("only", "echo"))
            .unwrap();
        let exec = executor(ActionRouter::new().single("echo", echo(Arc::clone(&log))));
        let mut ctx = ExecutionContext::new("wf");

        let options = RunOptions {
            run_timeout: Some(Duration::MAX),
            cancel: None,
        };
        let result = exec.execute_with(&graph, &mut ctx, 1, options).await.unwrap();

        assert!(result.is_success());
        assert!(!result.timed_out);
    }

    #[test]
    fn test_run_deadline_saturates_to_far_future() {
        let now = Instant::now();
        assert_eq!(run_deadline(now, Duration::MAX), now + FAR_DEADLINE);
        assert_eq!(
            run_deadline(now, Duration::from_secs(5)),
            now + Duration::from_secs(5)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_by_run_id_stops_run() {
        let graph = WorkflowGraph::new("wf")
            .add(StepDefinition::new("slow", "slow"))
            .unwrap();
        let exec = executor(ActionRouter::new().single("slow", sleeper(60_000)));
        let mut ctx = ExecutionContext::new("wf");
        let run_id = ctx.run_id;

        let (result, cancelled) = tokio::join!(exec.execute(&graph, &mut ctx, 1), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            exec.cancel(run_id)
        });

        assert!(cancelled.is_ok());
        let result = result.unwrap();
        assert!(result.cancelled);
        assert_eq!(result.step("slow").unwrap().state, StepState::Cancelled);
        assert_eq!(result.overall_status, WorkflowStatus::Failed);
        assert!(matches!(exec.cancel(run_id), Err(ExecutorError::RunNotFound(_))));
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_runs_nothing() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let graph = WorkflowGraph::new("wf")
            .add(StepDefinition::new("a", "echo"))
            .unwrap();
        let exec = executor(ActionRouter::new().single("echo", echo(Arc::clone(&log))));
        let token = CancellationToken::new();
        token.cancel();

        let mut ctx = ExecutionContext::new("wf");
        let options = RunOptions {
            run_timeout: None,
            cancel: Some(token),
        };
        let result = exec.execute_with(&graph, &mut ctx, 1, options).await.unwrap();

        assert!(result.cancelled);
        assert_eq!(result.incomplete_steps, vec!["a".to_string()]);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_allow_partial_policy_yields_partial() {
        let graph = WorkflowGraph::new("wf")
            .add(StepDefinition::new("main", "ok"))
            .unwrap()
            .add(StepDefinition::new("extra", "fail"))
            .unwrap()
            .declare_output(OutputDeclaration::required("answer", "steps.main.outputs.step"))
            .unwrap()
            .declare_output(OutputDeclaration::optional("bonus", "steps.extra.outputs.step"))
            .unwrap();

        let config = ExecutorConfig {
            output_policy: OutputPolicy::AllowPartial,
            ..ExecutorConfig::default()
        };
        let exec = executor(
            ActionRouter::new()
                .single("ok", sleeper(0))
                .single("fail", failing()),
        )
        .with_config(config, RetryDefaults::default());
        let mut ctx = ExecutionContext::new("wf");
        let result = exec.execute(&graph, &mut ctx, 2).await.unwrap();

        assert_eq!(result.overall_status, WorkflowStatus::Partial);
        assert_eq!(result.final_output["answer"], json!("main"));
        assert!(!result.final_output.contains_key("bonus"));
        assert!(result.unresolved_required_outputs.is_empty());
    }

    #[tokio::test]
    async fn test_unresolved_required_output_is_reported() {
        let graph = WorkflowGraph::new("wf")
            .add(StepDefinition::new("main", "ok"))
            .unwrap()
            .declare_output(OutputDeclaration::required("report", "steps.main.outputs.report"))
            .unwrap();
        let exec = executor(ActionRouter::new().single("ok", sleeper(0)));
        let mut ctx = ExecutionContext::new("wf");
        let result = exec.execute(&graph, &mut ctx, 1).await.unwrap();

        assert_eq!(result.overall_status, WorkflowStatus::Success);
        assert_eq!(result.unresolved_required_outputs, vec!["report".to_string()]);
    }

    #[tokio::test]
    async fn test_tier_fallthrough_records_model_tier() {
        let graph = WorkflowGraph::new("wf")
            .add(StepDefinition::new("draft", "writer"))
            .unwrap();
        let router = ActionRouter::new().route(
            "writer",
            vec![
                RouteTarget::new("opus", "tier-1", failing()),
                RouteTarget::new("haiku", "tier-2", sleeper(0)),
            ],
        );
        let exec = executor(router);
        let mut ctx = ExecutionContext::new("wf");
        let result = exec.execute(&graph, &mut ctx, 1).await.unwrap();

        let draft = result.step("draft").unwrap();
        assert_eq!(draft.state, StepState::Success);
        assert_eq!(draft.target.as_deref(), Some("haiku"));
        assert_eq!(draft.model_tier.as_deref(), Some("tier-2"));
        assert_eq!(exec.router_state().snapshot("opus").unwrap().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_panicking_action_fails_step() {
        let graph = WorkflowGraph::new("wf")
            .add(StepDefinition::new("boom", "boom"))
            .unwrap()
            .add(StepDefinition::new("next", "ok").depends_on(["boom"]))
            .unwrap();
        let boom = FnAction::new(|_inv: ActionInvocation| async move {
            if true {
                panic!("action bug");
            }
            Ok(ActionOutput::new())
        });
        let exec = executor(ActionRouter::new().single("boom", boom).single("ok", sleeper(0)));
        let mut ctx = ExecutionContext::new("wf");
        let result = exec.execute(&graph, &mut ctx, 1).await.unwrap();

        assert_eq!(result.step("boom").unwrap().state, StepState::Failed);
        assert_eq!(result.step("next").unwrap().state, StepState::Skipped);
    }

    #[tokio::test]
    async fn test_unknown_route_is_rejected_before_running() {
        let graph = WorkflowGraph::new("wf")
            .add(StepDefinition::new("a", "nowhere"))
            .unwrap();
        let exec = executor(ActionRouter::new());
        let mut ctx = ExecutionContext::new("wf");
        let err = exec.execute(&graph, &mut ctx, 1).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Routing(RouterError::UnknownRoute { .. })));
        assert!(ctx.step_results().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_graph_is_rejected() {
        let graph = WorkflowGraph::new("wf")
            .add(StepDefinition::new("a", "ok").depends_on(["ghost"]))
            .unwrap();
        let exec = executor(ActionRouter::new().single("ok", sleeper(0)));
        let mut ctx = ExecutionContext::new("wf");
        let err = exec.execute(&graph, &mut ctx, 1).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutorError::InvalidGraph(GraphValidationError::MissingDependency { .. })
        ));
    }

    #[test]
    fn test_step_error_display() {
        assert_eq!(
            StepExecutionError::Timeout { secs: 3 }.to_string(),
            "step timed out after 3s"
        );
        assert_eq!(
            StepExecutionError::from(ActionError::Cancelled),
            StepExecutionError::Cancelled
        );
        let err = ExecutorError::RunNotFound(Uuid::nil());
        assert!(err.to_string().contains("not found"));
    }
}
