//! Evaluation engine: gates, normalization, grading and profiles.
//!
//! - `gates` -- hard gates, evaluation scope and the dataset compatibility check
//! - `normalize` -- formula_id -> normalization function registry
//! - `reliability` -- small-sample adjustment and multi-sample aggregates
//! - `grading` -- the deterministic grading algorithm
//! - `profile` -- scoring profiles and rubric overrides
//! - `judge` -- judge client port and the rerun/swap protocol around it
//! - `feedback` -- repair feedback for the next iterative attempt
//! - `engine` -- `EvaluationEngine`, tying the above together

pub mod engine;
pub mod feedback;
pub mod gates;
pub mod grading;
pub mod judge;
pub mod normalize;
pub mod profile;
pub mod reliability;

pub use engine::{EvaluationEngine, EvaluationError, EvaluationTarget};
pub use gates::{check_compatibility, compute_hard_gates};
pub use judge::{BoxJudgeClient, JudgeClient, JudgeProtocol, JudgeProtocolError};
pub use normalize::{NormalizationError, NormalizationRegistry};
pub use profile::{ProfileError, ProfileRegistry};
pub use reliability::{AggregateReport, ReliabilityAdjuster};
