//! Normalization formula registry.
//!
//! Every criterion names a `formula_id`; the registry maps it to a pure
//! function from a raw score to `[0, 1]`. Looking up an unregistered id is a
//! configuration error, never a silent fallback.

use std::collections::HashMap;

use flowgrade_types::evaluation::{RawScore, SloBounds};

pub const BINARY: &str = "binary";
pub const LIKERT_1_5: &str = "likert_1_5";
pub const LIKERT_NEG2_2: &str = "likert_neg2_2";
pub const LOWER_IS_BETTER: &str = "lower_is_better";
pub const ZERO_ONE: &str = "zero_one";
pub const PAIRWISE: &str = "pairwise";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NormalizationError {
    #[error("unknown normalization formula '{0}'")]
    UnknownFormula(String),

    #[error("formula '{0}' requires SLO good/bad bounds")]
    MissingSlo(String),

    #[error("SLO bounds must differ (good = bad = {0})")]
    DegenerateSlo(f64),

    #[error("formula '{formula}' expects a {expected} score, got {got}")]
    ShapeMismatch {
        formula: String,
        expected: &'static str,
        got: String,
    },

    #[error("pairwise score has zero comparisons")]
    EmptyPairwise,
}

/// A normalization formula. Receives the criterion's SLO bounds when set.
pub type NormalizeFn = fn(RawScore, Option<SloBounds>) -> Result<f64, NormalizationError>;

/// Clamp to `[0, 1]`; NaN maps to 0.
pub fn clamp01(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn number(formula: &str, raw: RawScore) -> Result<f64, NormalizationError> {
    match raw {
        RawScore::Number(n) => Ok(n),
        other => Err(NormalizationError::ShapeMismatch {
            formula: formula.to_string(),
            expected: "numeric",
            got: other.to_string(),
        }),
    }
}

fn binary(raw: RawScore, _: Option<SloBounds>) -> Result<f64, NormalizationError> {
    Ok(clamp01(number(BINARY, raw)?))
}

fn likert_1_5(raw: RawScore, _: Option<SloBounds>) -> Result<f64, NormalizationError> {
    Ok(clamp01((number(LIKERT_1_5, raw)? - 1.0) / 4.0))
}

fn likert_neg2_2(raw: RawScore, _: Option<SloBounds>) -> Result<f64, NormalizationError> {
    Ok(clamp01((number(LIKERT_NEG2_2, raw)? + 2.0) / 4.0))
}

fn lower_is_better(raw: RawScore, slo: Option<SloBounds>) -> Result<f64, NormalizationError> {
    let value = number(LOWER_IS_BETTER, raw)?;
    let SloBounds { good, bad } =
        slo.ok_or_else(|| NormalizationError::MissingSlo(LOWER_IS_BETTER.to_string()))?;
    if bad == good {
        return Err(NormalizationError::DegenerateSlo(good));
    }
    Ok(clamp01((bad - value) / (bad - good)))
}

fn zero_one(raw: RawScore, _: Option<SloBounds>) -> Result<f64, NormalizationError> {
    Ok(clamp01(number(ZERO_ONE, raw)?))
}

fn pairwise(raw: RawScore, _: Option<SloBounds>) -> Result<f64, NormalizationError> {
    match raw {
        RawScore::Pairwise { wins, ties, total } => {
            if total == 0 {
                return Err(NormalizationError::EmptyPairwise);
            }
            Ok(clamp01(
                (f64::from(wins) + 0.5 * f64::from(ties)) / f64::from(total),
            ))
        }
        other => Err(NormalizationError::ShapeMismatch {
            formula: PAIRWISE.to_string(),
            expected: "pairwise",
            got: other.to_string(),
        }),
    }
}

/// formula_id -> pure normalization function.
#[derive(Debug, Clone)]
pub struct NormalizationRegistry {
    formulas: HashMap<String, NormalizeFn>,
}

impl NormalizationRegistry {
    /// A registry with no formulas.
    pub fn empty() -> Self {
        Self {
            formulas: HashMap::new(),
        }
    }

    /// A registry with the six built-in formulas.
    pub fn with_builtins() -> Self {
        Self::empty()
            .register(BINARY, binary)
            .register(LIKERT_1_5, likert_1_5)
            .register(LIKERT_NEG2_2, likert_neg2_2)
            .register(LOWER_IS_BETTER, lower_is_better)
            .register(ZERO_ONE, zero_one)
            .register(PAIRWISE, pairwise)
    }

    /// Add (or replace) a formula.
    pub fn register(mut self, formula_id: impl Into<String>, formula: NormalizeFn) -> Self {
        self.formulas.insert(formula_id.into(), formula);
        self
    }

    pub fn contains(&self, formula_id: &str) -> bool {
        self.formulas.contains_key(formula_id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.formulas.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Normalize `raw` with `formula_id`. The result is always in `[0, 1]`.
    pub fn normalize(
        &self,
        formula_id: &str,
        raw: RawScore,
        slo: Option<SloBounds>,
    ) -> Result<f64, NormalizationError> {
        let formula = self
            .formulas
            .get(formula_id)
            .ok_or_else(|| NormalizationError::UnknownFormula(formula_id.to_string()))?;
        formula(raw, slo).map(clamp01)
    }
}

impl Default for NormalizationRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
