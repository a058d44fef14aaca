//! Observability for flowgrade: subscriber setup and span attribute keys.

pub mod attrs;
pub mod tracing_setup;
