//! Action routing table and adaptive cooldown state.
//!
//! A route name (the step's `ActionRef::route`) maps to an ordered list of
//! targets, one per model/agent tier. Routes are bound to steps once, when a
//! graph is admitted for execution; an unknown route is an error then, not
//! at dispatch time.
//!
//! Per-target health lives in a `RouterState` the caller owns and hands to
//! the executor. Targets cool down after `failure_threshold` consecutive
//! failures; each further trip without an intervening success doubles the
//! cooldown up to `max_cooldown_ms`. A success resets the target.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use flowgrade_types::config::RouterConfig;
use tokio::time::Instant;

use super::action::{ActionError, ActionInvocation, ActionOutput, BoxStepAction, StepAction};
use super::graph::WorkflowGraph;

// ---------------------------------------------------------------------------
// Routing table
// ---------------------------------------------------------------------------

/// One concrete implementation behind a route.
#[derive(Debug, Clone)]
pub struct RouteTarget {
    pub id: String,
    pub tier: String,
    pub action: Arc<BoxStepAction>,
}

impl RouteTarget {
    pub fn new<T: StepAction + 'static>(
        id: impl Into<String>,
        tier: impl Into<String>,
        action: T,
    ) -> Self {
        Self {
            id: id.into(),
            tier: tier.into(),
            action: Arc::new(BoxStepAction::new(action)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RouterError {
    #[error("step '{step}' uses unknown route '{route}'")]
    UnknownRoute { step: String, route: String },

    #[error("route '{0}' has no targets")]
    EmptyRoute(String),
}

/// Route name -> ordered targets.
#[derive(Debug, Clone, Default)]
pub struct ActionRouter {
    routes: HashMap<String, Arc<[RouteTarget]>>,
}

impl ActionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `targets` under `name`, most preferred first.
    pub fn route(mut self, name: impl Into<String>, targets: Vec<RouteTarget>) -> Self {
        self.routes.insert(name.into(), targets.into());
        self
    }

    /// Register a route with a single target named after the route.
    pub fn single<T: StepAction + 'static>(self, name: impl Into<String>, action: T) -> Self {
        let name = name.into();
        let target = RouteTarget::new(name.clone(), "default", action);
        self.route(name, vec![target])
    }

    /// Resolve every step's route.
    pub fn bind(&self, graph: &WorkflowGraph) -> Result<BoundRoutes, RouterError> {
        let mut by_step = HashMap::with_capacity(graph.len());
        for step in graph.steps() {
            let targets = self.routes.get(&step.action.route).ok_or_else(|| {
                RouterError::UnknownRoute {
                    step: step.name.clone(),
                    route: step.action.route.clone(),
                }
            })?;
            if targets.is_empty() {
                return Err(RouterError::EmptyRoute(step.action.route.clone()));
            }
            by_step.insert(step.name.clone(), Arc::clone(targets));
        }
        Ok(BoundRoutes { by_step })
    }
}

/// Routes resolved for one graph.
#[derive(Debug, Clone)]
pub struct BoundRoutes {
    by_step: HashMap<String, Arc<[RouteTarget]>>,
}

impl BoundRoutes {
    pub fn targets(&self, step: &str) -> Option<Arc<[RouteTarget]>> {
        self.by_step.get(step).cloned()
    }
}

// ---------------------------------------------------------------------------
// RouterState
// ---------------------------------------------------------------------------

/// Health of a single target.
#[derive(Debug, Clone, Default)]
pub struct TargetHealth {
    pub consecutive_failures: u32,
    /// Length of the current (or last) cooldown.
    pub cooldown: Duration,
    pub cooling_until: Option<Instant>,
    pub total_calls: u64,
    pub total_failures: u64,
}

/// Caller-owned, cloneable handle to per-target health.
#[derive(Debug, Clone)]
pub struct RouterState {
    health: Arc<DashMap<String, TargetHealth>>,
    config: RouterConfig,
}

impl RouterState {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            health: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn is_available(&self, target: &str) -> bool {
        self.cooldown_remaining(target).is_none()
    }

    pub fn cooldown_remaining(&self, target: &str) -> Option<Duration> {
        let entry = self.health.get(target)?;
        let until = entry.cooling_until?;
        let now = Instant::now();
        (until > now).then(|| until - now)
    }

    pub fn snapshot(&self, target: &str) -> Option<TargetHealth> {
        self.health.get(target).map(|h| h.clone())
    }

    pub fn record_success(&self, target: &str) {
        let mut entry = self.health.entry(target.to_string()).or_default();
        entry.total_calls += 1;
        entry.consecutive_failures = 0;
        entry.cooldown = Duration::ZERO;
        entry.cooling_until = None;
    }

    pub fn record_failure(&self, target: &str) {
        let base = Duration::from_millis(self.config.base_cooldown_ms);
        let max = Duration::from_millis(self.config.max_cooldown_ms);

        let mut entry = self.health.entry(target.to_string()).or_default();
        entry.total_calls += 1;
        entry.total_failures += 1;
        entry.consecutive_failures += 1;

        if entry.consecutive_failures >= self.config.failure_threshold.max(1) {
            let next = if entry.cooldown.is_zero() {
                base
            } else {
                (entry.cooldown * 2).min(max)
            };
            entry.cooldown = next.min(max);
            entry.cooling_until = Some(Instant::now() + entry.cooldown);
            tracing::debug!(
                target_id = target,
                cooldown_ms = entry.cooldown.as_millis() as u64,
                "action target cooling down"
            );
        }
    }

    /// Targets to try, in order: available ones by tier, then, only if none
    /// is available, the one whose cooldown ends first.
    fn candidates<'t>(&self, targets: &'t [RouteTarget]) -> Vec<&'t RouteTarget> {
        let available: Vec<&RouteTarget> = targets
            .iter()
            .filter(|t| self.is_available(&t.id))
            .collect();
        if !available.is_empty() {
            return available;
        }
        targets
            .iter()
            .min_by_key(|t| self.cooldown_remaining(&t.id).unwrap_or(Duration::ZERO))
            .into_iter()
            .collect()
    }
}

impl Default for RouterState {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Routed invocation
// ---------------------------------------------------------------------------

/// Outputs plus the target that produced them.
#[derive(Debug, Clone)]
pub struct RoutedOutput {
    pub outputs: ActionOutput,
    pub target: String,
    pub tier: String,
}

/// Invoke the first target that succeeds, falling through tiers on
/// retryable failures. Cancellation and permanent failures stop the walk.
pub async fn invoke_routed(
    targets: &[RouteTarget],
    state: &RouterState,
    invocation: &ActionInvocation,
) -> Result<RoutedOutput, ActionError> {
    let mut last_error = ActionError::Failed("no route target available".to_string());

    for target in state.candidates(targets) {
        match target.action.invoke(invocation).await {
            Ok(outputs) => {
                state.record_success(&target.id);
                return Ok(RoutedOutput {
                    outputs,
                    target: target.id.clone(),
                    tier: target.tier.clone(),
                });
            }
            Err(ActionError::Cancelled) => return Err(ActionError::Cancelled),
            Err(err) => {
                state.record_failure(&target.id);
                tracing::debug!(
                    step = %invocation.step,
                    target_id = %target.id,
                    tier = %target.tier,
                    error = %err,
                    "route target failed"
                );
                if matches!(err, ActionError::Permanent(_)) {
                    return Err(err);
                }
                last_error = err;
            }
        }
    }

    Err(last_error)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
