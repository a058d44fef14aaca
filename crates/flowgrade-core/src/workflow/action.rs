//! The capability interface a step invokes, plus its object-safe wrapper.
//!
//! Agents, tools and model calls live outside the engine. The executor only
//! knows `StepAction::invoke(invocation) -> outputs | error`.
//!
//! Follows the blanket-impl pattern used for dynamic dispatch over RPITIT
//! traits:
//! 1. `StepAction` uses `impl Future` returns
//! 2. `StepActionDyn` is the object-safe mirror with boxed futures
//! 3. `BoxStepAction` wraps `Box<dyn StepActionDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Outputs produced by a successful action call.
pub type ActionOutput = Map<String, Value>;

/// Everything an action needs to perform one attempt of a step.
#[derive(Debug, Clone)]
pub struct ActionInvocation {
    pub run_id: Uuid,
    pub step: String,
    /// `ActionRef::params`, untouched.
    pub params: Value,
    /// `input_mapping` resolved against the run context at dispatch.
    pub inputs: Map<String, Value>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Fired when the run is cancelled or times out. Actions should stop
    /// promptly when it fires.
    pub cancel: CancellationToken,
}

/// Failure reported by an action.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ActionError {
    /// The call failed and may succeed if retried.
    #[error("{0}")]
    Failed(String),

    /// The call failed in a way retrying cannot fix.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The action observed cancellation and stopped.
    #[error("cancelled")]
    Cancelled,
}

/// An external capability (agent, tool, model call) a step invokes.
pub trait StepAction: Send + Sync {
    fn invoke(
        &self,
        invocation: &ActionInvocation,
    ) -> impl Future<Output = Result<ActionOutput, ActionError>> + Send;
}

/// Object-safe version of [`StepAction`] with boxed futures.
pub trait StepActionDyn: Send + Sync {
    fn invoke_boxed<'a>(
        &'a self,
        invocation: &'a ActionInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<ActionOutput, ActionError>> + Send + 'a>>;
}

impl<T: StepAction> StepActionDyn for T {
    fn invoke_boxed<'a>(
        &'a self,
        invocation: &'a ActionInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<ActionOutput, ActionError>> + Send + 'a>> {
        Box::pin(self.invoke(invocation))
    }
}

/// Type-erased action for routing tables.
pub struct BoxStepAction {
    inner: Box<dyn StepActionDyn>,
}

impl BoxStepAction {
    pub fn new<T: StepAction + 'static>(action: T) -> Self {
        Self {
            inner: Box::new(action),
        }
    }

    pub async fn invoke(&self, invocation: &ActionInvocation) -> Result<ActionOutput, ActionError> {
        self.inner.invoke_boxed(invocation).await
    }
}

impl std::fmt::Debug for BoxStepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStepAction").finish_non_exhaustive()
    }
}

/// Adapter turning an async closure into a [`StepAction`].
pub struct FnAction<F> {
    f: F,
}

impl<F, Fut> FnAction<F>
where
    F: Fn(ActionInvocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ActionOutput, ActionError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, Fut> StepAction for FnAction<F>
where
    F: Fn(ActionInvocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ActionOutput, ActionError>> + Send,
{
    fn invoke(
        &self,
        invocation: &ActionInvocation,
    ) -> impl Future<Output = Result<ActionOutput, ActionError>> + Send {
        (self.f)(invocation.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    impl StepAction for Echo {
        async fn invoke(&self, invocation: &ActionInvocation) -> Result<ActionOutput, ActionError> {
            let mut out = Map::new();
            out.insert("echo".to_string(), Value::Object(invocation.inputs.clone()));
            Ok(out)
        }
    }

    fn invocation() -> ActionInvocation {
        let mut inputs = Map::new();
        inputs.insert("q".to_string(), json!("hi"));
        ActionInvocation {
            run_id: Uuid::nil(),
            step: "s".to_string(),
            params: Value::Null,
            inputs,
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_boxed_action_delegates() {
        let action = BoxStepAction::new(Echo);
        let out = action.invoke(&invocation()).await.unwrap();
        assert_eq!(out["echo"], json!({"q": "hi"}));
    }

    #[tokio::test]
    async fn test_fn_action_adapts_closure() {
        let action = BoxStepAction::new(FnAction::new(|inv: ActionInvocation| async move {
            if inv.attempt > 1 {
                Ok(Map::new())
            } else {
                Err(ActionError::Failed("first attempt".to_string()))
            }
        }));
        let err = action.invoke(&invocation()).await.unwrap_err();
        assert_eq!(err, ActionError::Failed("first attempt".to_string()));
    }
}
