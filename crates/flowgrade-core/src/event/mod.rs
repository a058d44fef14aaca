//! Lifecycle event fan-out for runs, repair iterations and evaluations.

pub mod bus;

pub use bus::{EventBus, RunSubscription};
