//! Deterministic grading.
//!
//! The order is fixed:
//! 1. any false hard gate fails the verdict with grade F;
//! 2. every criterion is normalized and checked against its floor;
//! 3. the weighted score is `round(100 * Σ(w·norm) / Σw, 2)`;
//! 4. the provisional grade comes from the score bands;
//! 5. a floor violation caps the grade at D;
//! 6. `passed` requires the threshold and no floor violation.
//!
//! Criteria are still normalized and reported when a gate has failed so the
//! report explains what the run would have scored.

use flowgrade_types::evaluation::{
    CriterionDefinition, CriterionResult, FloorViolation, Grade, HardGateResult, RawScore,
};

use super::normalize::{NormalizationError, NormalizationRegistry};

/// A criterion with the raw score collected for it.
///
/// `raw == None` means no score could be obtained; it normalizes to 0.0.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCriterion {
    pub definition: CriterionDefinition,
    pub raw: Option<RawScore>,
    pub evidence: Vec<String>,
}

impl ScoredCriterion {
    pub fn new(definition: CriterionDefinition, raw: Option<RawScore>) -> Self {
        Self {
            definition,
            raw,
            evidence: Vec::new(),
        }
    }

    pub fn with_evidence(mut self, evidence: Vec<String>) -> Self {
        self.evidence = evidence;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradeOutcome {
    pub criteria: Vec<CriterionResult>,
    pub weighted_score: f64,
    pub grade: Grade,
    pub passed: bool,
    pub floor_violations: Vec<FloorViolation>,
}

/// Round to two decimals.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn grade(
    gates: &HardGateResult,
    scored: &[ScoredCriterion],
    registry: &NormalizationRegistry,
    pass_threshold: f64,
) -> Result<GradeOutcome, NormalizationError> {
    let gates_passed = gates.all_passed();

    let mut criteria = Vec::with_capacity(scored.len());
    let mut floor_violations = Vec::new();
    for item in scored {
        let def = &item.definition;
        let (raw_score, normalized) = match item.raw {
            Some(raw) => (raw, registry.normalize(&def.formula_id, raw, def.slo)?),
            None => {
                // Still reject an unknown formula even when there is nothing to score.
                if !registry.contains(&def.formula_id) {
                    return Err(NormalizationError::UnknownFormula(def.formula_id.clone()));
                }
                (RawScore::Number(0.0), 0.0)
            }
        };

        let floor_passed = def.critical_floor.is_none_or(|floor| normalized >= floor);
        if let (false, Some(floor)) = (floor_passed, def.critical_floor) {
            floor_violations.push(FloorViolation {
                criterion: def.name.clone(),
                normalized_score: normalized,
                critical_floor: floor,
            });
        }

        criteria.push(CriterionResult {
            name: def.name.clone(),
            raw_score,
            formula_id: def.formula_id.clone(),
            normalized_score: normalized,
            weight: def.weight,
            critical_floor: def.critical_floor,
            floor_passed,
            evidence: item.evidence.clone(),
        });
    }

    let weight_sum: f64 = criteria.iter().map(|c| c.weight).sum();
    let weighted_0_1 = if weight_sum > 0.0 {
        criteria
            .iter()
            .map(|c| c.weight * c.normalized_score)
            .sum::<f64>()
            / weight_sum
    } else {
        0.0
    };
    let weighted_score = round2(weighted_0_1 * 100.0);

    let mut grade = Grade::from_score(weighted_score);
    if !floor_violations.is_empty() {
        grade = grade.capped_at(Grade::D);
    }
    let mut passed = weighted_score >= pass_threshold && floor_violations.is_empty();

    if !gates_passed {
        grade = Grade::F;
        passed = false;
    }

    Ok(GradeOutcome {
        criteria,
        weighted_score,
        grade,
        passed,
        floor_violations,
    })
}
