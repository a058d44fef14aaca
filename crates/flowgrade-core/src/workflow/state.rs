//! Per-step lifecycle state machine.
//!
//! Legal transitions:
//!
//! ```text
//! PENDING -> READY      dependencies satisfied
//! PENDING -> SKIPPED    condition false, or an upstream step failed
//! READY   -> RUNNING    dispatched to the worker pool
//! RUNNING -> SUCCESS
//! RUNNING -> FAILED     no retries left
//! RUNNING -> RETRYING   retries remain
//! RETRYING -> RUNNING
//! RUNNING -> CANCELLED  run cancelled or timed out
//! ```
//!
//! Anything else is rejected with [`TransitionError`].

use flowgrade_types::workflow::StepState;

/// An attempted transition that the lifecycle does not allow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition for step '{step}': {from} -> {to}")]
pub struct TransitionError {
    pub step: String,
    pub from: StepState,
    pub to: StepState,
}

/// Whether `from -> to` is a legal lifecycle transition.
pub const fn is_legal(from: StepState, to: StepState) -> bool {
    use StepState::*;
    matches!(
        (from, to),
        (Pending, Ready)
            | (Pending, Skipped)
            | (Ready, Running)
            | (Running, Success)
            | (Running, Failed)
            | (Running, Retrying)
            | (Retrying, Running)
            | (Running, Cancelled)
    )
}

/// Lifecycle of one step within one run.
#[derive(Debug, Clone)]
pub struct StepStateMachine {
    step: String,
    state: StepState,
    retry_count: u32,
    history: Vec<StepState>,
}

impl StepStateMachine {
    /// A fresh machine in PENDING.
    pub fn new(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            state: StepState::Pending,
            retry_count: 0,
            history: vec![StepState::Pending],
        }
    }

    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    /// Times the step went RUNNING -> RETRYING.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Every state visited, starting with PENDING.
    pub fn history(&self) -> &[StepState] {
        &self.history
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move to `to`, or fail without changing state.
    pub fn transition(&mut self, to: StepState) -> Result<(), TransitionError> {
        if !is_legal(self.state, to) {
            return Err(TransitionError {
                step: self.step.clone(),
                from: self.state,
                to,
            });
        }
        if to == StepState::Retrying {
            self.retry_count += 1;
        }
        tracing::trace!(step = %self.step, from = %self.state, to = %to, "step transition");
        self.state = to;
        self.history.push(to);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use StepState::*;

    const ALL: [StepState; 8] = [
        Pending, Ready, Running, Retrying, Success, Failed, Skipped, Cancelled,
    ];

    #[test]
    fn test_happy_path_with_retry() {
        let mut sm = StepStateMachine::new("build");
        for to in [Ready, Running, Retrying, Running, Success] {
            sm.transition(to).unwrap();
        }
        assert_eq!(sm.state(), Success);
        assert_eq!(sm.retry_count(), 1);
        assert_eq!(
            sm.history(),
            &[Pending, Ready, Running, Retrying, Running, Success]
        );
        assert!(sm.is_terminal());
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        for terminal in [Success, Failed, Skipped, Cancelled] {
            for to in ALL {
                assert!(!is_legal(terminal, to), "{terminal} -> {to} must be illegal");
            }
        }
    }

    #[test]
    fn test_exactly_eight_legal_transitions() {
        let legal = ALL
            .iter()
            .flat_map(|from| ALL.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| is_legal(*from, *to))
            .count();
        assert_eq!(legal, 8);
    }

    #[test]
    fn test_illegal_transition_is_rejected_and_state_unchanged() {
        let mut sm = StepStateMachine::new("deploy");
        let err = sm.transition(Running).unwrap_err();
        assert_eq!(err.from, Pending);
        assert_eq!(err.to, Running);
        assert_eq!(sm.state(), Pending);
        assert!(err.to_string().contains("PENDING -> RUNNING"));
    }

    #[test]
    fn test_pending_cannot_fail_or_cancel() {
        let mut sm = StepStateMachine::new("x");
        assert!(sm.transition(Failed).is_err());
        assert!(sm.transition(Cancelled).is_err());
        sm.transition(Skipped).unwrap();
        assert!(sm.is_terminal());
    }

    #[test]
    fn test_retrying_cannot_be_cancelled_directly() {
        let mut sm = StepStateMachine::new("x");
        sm.transition(Ready).unwrap();
        sm.transition(Running).unwrap();
        sm.transition(Retrying).unwrap();
        assert!(sm.transition(Cancelled).is_err());
        assert!(sm.transition(Success).is_err());
    }
}
