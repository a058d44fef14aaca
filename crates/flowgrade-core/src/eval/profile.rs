//! Scoring profiles and the effective rubric.
//!
//! A profile is the default criteria/gate template for a workflow family.
//! A rubric layered on top overrides profile criteria by name and may add
//! new ones; the merged result is validated before any grading happens.

use std::collections::{BTreeMap, HashSet};

use flowgrade_types::evaluation::{
    CriterionDefinition, ExtraGate, RubricDefinition, ScoreSource, ScoringProfile,
};

use crate::workflow::expression::Expression;

use super::normalize::{
    BINARY, LIKERT_1_5, LIKERT_NEG2_2, LOWER_IS_BETTER, NormalizationRegistry, PAIRWISE, ZERO_ONE,
};

pub const PROFILE_REPAIR: &str = "A";
pub const PROFILE_GENERATION: &str = "B";
pub const PROFILE_COMPARISON: &str = "C";
pub const PROFILE_ANALYSIS: &str = "D";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProfileError {
    #[error("unknown scoring profile '{0}'")]
    UnknownProfile(String),

    #[error("weights of '{owner}' sum to {sum:.4}, expected 1.0 (tolerance {tolerance})")]
    WeightSum {
        owner: String,
        sum: f64,
        tolerance: f64,
    },

    #[error("criterion '{criterion}' of '{owner}' uses unregistered formula '{formula_id}'")]
    UnknownFormula {
        owner: String,
        criterion: String,
        formula_id: String,
    },

    #[error("criterion '{criterion}' of '{owner}' uses lower_is_better without SLO bounds")]
    MissingSlo { owner: String, criterion: String },

    #[error("criterion '{criterion}' is defined twice in '{owner}'")]
    DuplicateCriterion { owner: String, criterion: String },

    #[error("'{0}' has no criteria")]
    Empty(String),

    #[error("gate '{gate}' of '{owner}' is not a valid expression: {message}")]
    InvalidGate {
        owner: String,
        gate: String,
        message: String,
    },

    #[error("criterion '{criterion}' of '{owner}' has floor {floor} outside [0, 1]")]
    InvalidFloor {
        owner: String,
        criterion: String,
        floor: f64,
    },

    #[error("neither a rubric nor a profile was given")]
    NothingSelected,
}

/// Profile criteria merged with rubric overrides, ready for grading.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveRubric {
    pub rubric_id: String,
    pub version: semver::Version,
    pub profile_id: Option<String>,
    pub criteria: Vec<CriterionDefinition>,
    pub extra_gates: Vec<ExtraGate>,
    /// Rubric threshold, else the profile's; `None` defers to the engine config.
    pub pass_threshold: Option<f64>,
}

/// Built-in and configured scoring profiles, indexed by id.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: BTreeMap<String, ScoringProfile>,
}

impl ProfileRegistry {
    /// The four built-in profiles.
    pub fn builtin() -> Self {
        let profiles = [repair(), generation(), comparison(), analysis()]
            .into_iter()
            .map(|p| (p.profile_id.clone(), p))
            .collect();
        Self { profiles }
    }

    /// Built-ins plus `custom`; a custom profile replaces a built-in with the same id.
    pub fn with_profiles(custom: impl IntoIterator<Item = ScoringProfile>) -> Self {
        let mut registry = Self::builtin();
        for profile in custom {
            registry.profiles.insert(profile.profile_id.clone(), profile);
        }
        registry
    }

    pub fn get(&self, profile_id: &str) -> Option<&ScoringProfile> {
        self.profiles.get(profile_id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }

    /// Validate every registered profile against `formulas`.
    pub fn validate_all(
        &self,
        formulas: &NormalizationRegistry,
        tolerance: f64,
    ) -> Result<(), ProfileError> {
        for profile in self.profiles.values() {
            validate_criteria(&profile.profile_id, &profile.criteria, formulas, tolerance)?;
            validate_gates(&profile.profile_id, &profile.extra_gates)?;
        }
        Ok(())
    }

    /// Merge `rubric` over the profile `profile_id` and validate the result.
    pub fn effective_rubric(
        &self,
        profile_id: Option<&str>,
        rubric: Option<&RubricDefinition>,
        formulas: &NormalizationRegistry,
        tolerance: f64,
    ) -> Result<EffectiveRubric, ProfileError> {
        let profile = profile_id
            .map(|id| {
                self.get(id)
                    .ok_or_else(|| ProfileError::UnknownProfile(id.to_string()))
            })
            .transpose()?;

        let effective = match (profile, rubric) {
            (None, None) => return Err(ProfileError::NothingSelected),
            (Some(profile), None) => EffectiveRubric {
                rubric_id: profile.profile_id.clone(),
                version: semver::Version::new(1, 0, 0),
                profile_id: Some(profile.profile_id.clone()),
                criteria: profile.criteria.clone(),
                extra_gates: profile.extra_gates.clone(),
                pass_threshold: profile.pass_threshold,
            },
            (profile, Some(rubric)) => {
                let mut criteria = profile.map(|p| p.criteria.clone()).unwrap_or_default();
                for criterion in &rubric.criteria {
                    match criteria.iter_mut().find(|c| c.name == criterion.name) {
                        Some(existing) => *existing = criterion.clone(),
                        None => criteria.push(criterion.clone()),
                    }
                }
                EffectiveRubric {
                    rubric_id: rubric.rubric_id.clone(),
                    version: rubric.version.clone(),
                    profile_id: profile.map(|p| p.profile_id.clone()),
                    criteria,
                    extra_gates: profile.map(|p| p.extra_gates.clone()).unwrap_or_default(),
                    pass_threshold: rubric
                        .pass_threshold
                        .or_else(|| profile.and_then(|p| p.pass_threshold)),
                }
            }
        };

        validate_criteria(&effective.rubric_id, &effective.criteria, formulas, tolerance)?;
        validate_gates(&effective.rubric_id, &effective.extra_gates)?;
        Ok(effective)
    }
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Reject criteria sets that cannot be graded.
pub fn validate_criteria(
    owner: &str,
    criteria: &[CriterionDefinition],
    formulas: &NormalizationRegistry,
    tolerance: f64,
) -> Result<(), ProfileError> {
    if criteria.is_empty() {
        return Err(ProfileError::Empty(owner.to_string()));
    }

    let mut seen = HashSet::new();
    for c in criteria {
        if !seen.insert(c.name.as_str()) {
            return Err(ProfileError::DuplicateCriterion {
                owner: owner.to_string(),
                criterion: c.name.clone(),
            });
        }
        if !formulas.contains(&c.formula_id) {
            return Err(ProfileError::UnknownFormula {
                owner: owner.to_string(),
                criterion: c.name.clone(),
                formula_id: c.formula_id.clone(),
            });
        }
        if c.formula_id == LOWER_IS_BETTER && c.slo.is_none() {
            return Err(ProfileError::MissingSlo {
                owner: owner.to_string(),
                criterion: c.name.clone(),
            });
        }
        if let Some(floor) = c.critical_floor
            && !(0.0..=1.0).contains(&floor)
        {
            return Err(ProfileError::InvalidFloor {
                owner: owner.to_string(),
                criterion: c.name.clone(),
                floor,
            });
        }
    }

    let sum: f64 = criteria.iter().map(|c| c.weight).sum();
    if (sum - 1.0).abs() > tolerance {
        return Err(ProfileError::WeightSum {
            owner: owner.to_string(),
            sum,
            tolerance,
        });
    }
    Ok(())
}

fn validate_gates(owner: &str, gates: &[ExtraGate]) -> Result<(), ProfileError> {
    for gate in gates {
        Expression::parse(&gate.expression).map_err(|e| ProfileError::InvalidGate {
            owner: owner.to_string(),
            gate: gate.name.clone(),
            message: e.to_string(),
        })?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Built-in profiles
// ---------------------------------------------------------------------------

/// Test-dominant repair workflows.
fn repair() -> ScoringProfile {
    ScoringProfile {
        profile_id: PROFILE_REPAIR.to_string(),
        description: "Repair workflows, scored mainly on test results".to_string(),
        criteria: vec![
            CriterionDefinition::new(
                "correctness",
                0.5,
                ZERO_ONE,
                ScoreSource::objective("${outputs.test_pass_rate}"),
            )
            .with_definition("Fraction of the test suite that passes after the repair")
            .with_floor(0.7),
            CriterionDefinition::new("code_quality", 0.2, LIKERT_1_5, ScoreSource::judge())
                .with_definition("Readability and idiomatic style of the change"),
            CriterionDefinition::new("docs", 0.15, LIKERT_1_5, ScoreSource::judge())
                .with_definition("Comments and documentation accompanying the change"),
            CriterionDefinition::new(
                "efficiency",
                0.15,
                LOWER_IS_BETTER,
                ScoreSource::objective("${run.duration_ms}"),
            )
            .with_definition("Wall-clock time of the run")
            .with_slo(60_000.0, 600_000.0),
        ],
        extra_gates: vec![ExtraGate::new("tests_executed", "${outputs.tests_run} > 0")],
        pass_threshold: None,
    }
}

/// Rubric-dominant generation workflows.
fn generation() -> ScoringProfile {
    let judged = |name: &str, weight: f64, definition: &str| {
        CriterionDefinition::new(name, weight, LIKERT_1_5, ScoreSource::judge())
            .with_definition(definition)
    };
    ScoringProfile {
        profile_id: PROFILE_GENERATION.to_string(),
        description: "Generation workflows, scored by rubric".to_string(),
        criteria: vec![
            judged("correctness", 0.35, "Does the output do what was asked"),
            judged("code_quality", 0.30, "Structure, naming and idiom"),
            judged("efficiency", 0.20, "Avoids needless work and allocations"),
            judged("docs", 0.15, "Usage is explained where it is not obvious"),
        ],
        extra_gates: vec![],
        pass_threshold: None,
    }
}

/// Pairwise comparison against a reference answer.
fn comparison() -> ScoringProfile {
    ScoringProfile {
        profile_id: PROFILE_COMPARISON.to_string(),
        description: "Candidate compared against a reference answer".to_string(),
        criteria: vec![
            CriterionDefinition::new("preference", 0.6, PAIRWISE, ScoreSource::pairwise())
                .with_definition("Which answer better solves the task")
                .with_scale(-2.0, 2.0),
            CriterionDefinition::new(
                "correctness",
                0.4,
                BINARY,
                ScoreSource::objective("${outputs.correct}"),
            )
            .with_definition("The answer matches the expected result"),
        ],
        extra_gates: vec![],
        pass_threshold: None,
    }
}

/// Analysis and report workflows.
fn analysis() -> ScoringProfile {
    ScoringProfile {
        profile_id: PROFILE_ANALYSIS.to_string(),
        description: "Analysis workflows, scored on accuracy and coverage".to_string(),
        criteria: vec![
            CriterionDefinition::new("correctness", 0.4, LIKERT_1_5, ScoreSource::judge())
                .with_definition("Claims are accurate and supported")
                .with_floor(0.5),
            CriterionDefinition::new("completeness", 0.3, LIKERT_NEG2_2, ScoreSource::judge())
                .with_definition("Covers the question, from -2 (misses it) to 2 (fully)")
                .with_scale(-2.0, 2.0),
            CriterionDefinition::new("clarity", 0.3, LIKERT_1_5, ScoreSource::judge())
                .with_definition("Easy to follow"),
        ],
        extra_gates: vec![],
        pass_threshold: None,
    }
}
