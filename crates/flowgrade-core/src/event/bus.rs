//! `EventBus` -- tokio broadcast fan-out of [`FlowEvent`]s.
//!
//! Producers never wait on consumers: with no subscriber an event is dropped,
//! and a subscriber that falls more than `capacity` events behind loses the
//! oldest ones. [`RunSubscription`] narrows the stream to a single run.

use flowgrade_types::event::FlowEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<FlowEvent>,
}

impl EventBus {
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.sender.subscribe()
    }

    /// Receive the events of `run_id` only.
    pub fn subscribe_run(&self, run_id: Uuid) -> RunSubscription {
        RunSubscription {
            run_id,
            rx: self.sender.subscribe(),
            missed: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn publish(&self, event: FlowEvent) {
        // Err only means nobody is listening.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Events of a single run, in publish order.
///
/// Iteration events carry no run id and are not delivered here.
#[derive(Debug)]
pub struct RunSubscription {
    run_id: Uuid,
    rx: broadcast::Receiver<FlowEvent>,
    missed: u64,
}

impl RunSubscription {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Events skipped because this subscriber lagged.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    /// Next event for this run, or `None` once every bus handle is dropped.
    pub async fn next(&mut self) -> Option<FlowEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.run_id() == Some(self.run_id) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => {
                    self.missed += n;
                    tracing::warn!(run_id = %self.run_id, skipped = n, "run subscription lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
