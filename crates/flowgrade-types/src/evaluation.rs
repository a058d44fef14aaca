//! Evaluation domain types: rubrics, scoring profiles, gate results and
//! score reports.
//!
//! Everything here is plain serializable data. The scoring logic lives in
//! `flowgrade-core::eval`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::workflow::WorkflowResult;

// ---------------------------------------------------------------------------
// Rubric
// ---------------------------------------------------------------------------

/// Named, versioned set of scored criteria.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricDefinition {
    pub rubric_id: String,
    pub version: semver::Version,
    pub criteria: Vec<CriterionDefinition>,
    /// Overrides the profile/engine pass threshold (0-100).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass_threshold: Option<f64>,
}

/// One scored criterion of a rubric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionDefinition {
    pub name: String,
    /// What the criterion measures, passed verbatim to judges.
    #[serde(default)]
    pub definition: String,
    #[serde(default)]
    pub scale: Scale,
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical_floor: Option<f64>,
    /// Key into the normalization formula registry.
    pub formula_id: String,
    /// Where the raw score comes from.
    pub source: ScoreSource,
    /// Good/bad bounds for `lower_is_better`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slo: Option<SloBounds>,
}

impl CriterionDefinition {
    pub fn new(
        name: impl Into<String>,
        weight: f64,
        formula_id: impl Into<String>,
        source: ScoreSource,
    ) -> Self {
        Self {
            name: name.into(),
            definition: String::new(),
            scale: Scale::default(),
            weight,
            critical_floor: None,
            formula_id: formula_id.into(),
            source,
            slo: None,
        }
    }

    pub fn with_definition(mut self, definition: impl Into<String>) -> Self {
        self.definition = definition.into();
        self
    }

    pub fn with_scale(mut self, min: f64, max: f64) -> Self {
        self.scale = Scale { min, max };
        self
    }

    pub fn with_floor(mut self, floor: f64) -> Self {
        self.critical_floor = Some(floor);
        self
    }

    pub fn with_slo(mut self, good: f64, bad: f64) -> Self {
        self.slo = Some(SloBounds { good, bad });
        self
    }
}

/// Raw score range a judge is asked to use.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scale {
    pub min: f64,
    pub max: f64,
}

impl Scale {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

impl Default for Scale {
    fn default() -> Self {
        Self { min: 1.0, max: 5.0 }
    }
}

/// Service-level bounds for `lower_is_better` (e.g. latency in ms).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SloBounds {
    pub good: f64,
    pub bad: f64,
}

/// Origin of a criterion's raw score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScoreSource {
    /// A value read from the run, e.g. `${outputs.test_pass_rate}`.
    Objective { path: String },
    /// Scored by the judge against the criterion definition.
    Judge {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fallback_path: Option<String>,
    },
    /// Candidate compared against the sample's reference by the judge,
    /// once in each presentation order.
    Pairwise {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fallback_path: Option<String>,
    },
}

impl ScoreSource {
    pub fn objective(path: impl Into<String>) -> Self {
        ScoreSource::Objective { path: path.into() }
    }

    pub fn judge() -> Self {
        ScoreSource::Judge {
            fallback_path: None,
        }
    }

    pub fn pairwise() -> Self {
        ScoreSource::Pairwise {
            fallback_path: None,
        }
    }

    /// Objective path used when the judge cannot produce a score.
    pub fn fallback_path(&self) -> Option<&str> {
        match self {
            ScoreSource::Objective { path } => Some(path),
            ScoreSource::Judge { fallback_path } | ScoreSource::Pairwise { fallback_path } => {
                fallback_path.as_deref()
            }
        }
    }
}

/// A raw, pre-normalization score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawScore {
    Number(f64),
    Pairwise { wins: u32, ties: u32, total: u32 },
}

impl fmt::Display for RawScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawScore::Number(n) => write!(f, "{n}"),
            RawScore::Pairwise { wins, ties, total } => {
                write!(f, "{wins}W/{ties}T of {total}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scoring profiles
// ---------------------------------------------------------------------------

/// Named default weight/gate template for a workflow family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringProfile {
    pub profile_id: String,
    #[serde(default)]
    pub description: String,
    /// Default criteria (weights, formulas, sources).
    pub criteria: Vec<CriterionDefinition>,
    /// Gates specific to this workflow family.
    #[serde(default)]
    pub extra_gates: Vec<ExtraGate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass_threshold: Option<f64>,
}

/// A profile-specific hard gate: a boolean expression over the finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraGate {
    pub name: String,
    pub expression: String,
}

impl ExtraGate {
    pub fn new(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expression: expression.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Gate and criterion results
// ---------------------------------------------------------------------------

/// Binary pre-conditions that override any weighted score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardGateResult {
    pub required_outputs_present: bool,
    pub overall_status_success: bool,
    pub no_critical_step_failures: bool,
    pub schema_contract_valid: bool,
    pub dataset_workflow_compatible: bool,
    /// Profile-specific gates by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, bool>,
    pub failure_reasons: Vec<String>,
}

impl HardGateResult {
    /// Whether every gate, built-in and extra, passed.
    pub fn all_passed(&self) -> bool {
        self.failed_count() == 0
    }

    /// Number of false gates.
    pub fn failed_count(&self) -> usize {
        let builtin = [
            self.required_outputs_present,
            self.overall_status_success,
            self.no_critical_step_failures,
            self.schema_contract_valid,
            self.dataset_workflow_compatible,
        ];
        builtin.iter().filter(|g| !**g).count() + self.extra.values().filter(|g| !**g).count()
    }
}

/// Scored and normalized result of one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionResult {
    pub name: String,
    pub raw_score: RawScore,
    pub formula_id: String,
    pub normalized_score: f64,
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical_floor: Option<f64>,
    /// True when no floor is set.
    pub floor_passed: bool,
    /// Judge evidence, when the judge produced the score.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<String>,
}

/// A criterion that fell below its critical floor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloorViolation {
    pub criterion: String,
    pub normalized_score: f64,
    pub critical_floor: f64,
}

/// Letter grade from the weighted score bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    /// Band for a 0-100 weighted score: A>=90, B>=80, C>=70, D>=60, else F.
    pub fn from_score(weighted_100: f64) -> Self {
        if weighted_100 >= 90.0 {
            Grade::A
        } else if weighted_100 >= 80.0 {
            Grade::B
        } else if weighted_100 >= 70.0 {
            Grade::C
        } else if weighted_100 >= 60.0 {
            Grade::D
        } else {
            Grade::F
        }
    }

    /// The worse of `self` and `cap`.
    pub fn capped_at(self, cap: Grade) -> Self {
        self.max(cap)
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        };
        f.write_str(s)
    }
}

/// Something the report reader must know about how a score was obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReportFlag {
    /// The judge failed twice; the criterion was scored objectively.
    JudgeFallback { criterion: String, reason: String },
    /// Swapped-order judge calls disagreed; a tie was forced.
    PairwiseInconsistent {
        criterion: String,
        first: f64,
        second: f64,
    },
    /// The objective source path did not resolve; scored as 0.
    ObjectiveMissing { criterion: String, path: String },
}

/// Identity of the judge that produced subjective scores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeMetadata {
    pub model_id: String,
    pub model_version: String,
    pub prompt_version: String,
}

/// Final verdict for one evaluated run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreReport {
    pub rubric_id: String,
    pub rubric_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    pub hard_gates: HardGateResult,
    pub criteria: Vec<CriterionResult>,
    /// 0-100, rounded to two decimals.
    pub weighted_score: f64,
    pub grade: Grade,
    pub passed: bool,
    pub pass_threshold: f64,
    pub floor_violations: Vec<FloorViolation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<ReportFlag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge: Option<JudgeMetadata>,
}

impl ScoreReport {
    pub fn criterion(&self, name: &str) -> Option<&CriterionResult> {
        self.criteria.iter().find(|c| c.name == name)
    }
}

/// One iteration of an iterative-repair run, retained for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based.
    pub attempt: u32,
    pub result: WorkflowResult,
    pub report: ScoreReport,
    /// Feedback injected into the next attempt's context, if one followed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    pub duration_ms: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
