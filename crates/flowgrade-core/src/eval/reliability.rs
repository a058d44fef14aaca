//! Small-sample reliability adjustment and multi-sample aggregation.
//!
//! A criterion scored on a handful of samples is shrunk toward a prior:
//! `adjusted = (n * norm + k * prior) / (n + k)`. Both values are kept; the
//! adjusted one drives promotion and aggregate decisions.

use flowgrade_types::config::EvaluationConfig;
use flowgrade_types::evaluation::ScoreReport;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReliabilityAdjuster {
    prior: f64,
    k: f64,
}

impl ReliabilityAdjuster {
    pub fn new(prior: f64, k: f64) -> Self {
        Self {
            prior,
            k: k.max(0.0),
        }
    }

    pub fn from_config(config: &EvaluationConfig) -> Self {
        Self::new(config.reliability_prior, config.reliability_k)
    }

    pub fn prior(&self) -> f64 {
        self.prior
    }

    pub fn k(&self) -> f64 {
        self.k
    }

    /// Shrink `norm`, observed over `n` samples, toward the prior.
    pub fn adjust(&self, norm: f64, n: usize) -> f64 {
        let n = n as f64;
        if n + self.k == 0.0 {
            return self.prior;
        }
        (n * norm + self.k * self.prior) / (n + self.k)
    }
}

impl Default for ReliabilityAdjuster {
    fn default() -> Self {
        Self::new(0.5, 20.0)
    }
}

/// Per-criterion aggregate over many samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionAggregate {
    pub name: String,
    pub samples: usize,
    pub mean_normalized: f64,
    pub adjusted: f64,
}

/// Aggregate over the reports of many dataset samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub sample_count: usize,
    pub passed_count: usize,
    pub pass_rate: f64,
    pub mean_weighted_score: f64,
    /// In first-seen criterion order.
    pub criteria: Vec<CriterionAggregate>,
}

impl AggregateReport {
    pub fn from_reports(reports: &[ScoreReport], adjuster: &ReliabilityAdjuster) -> Self {
        let sample_count = reports.len();
        let passed_count = reports.iter().filter(|r| r.passed).count();
        let (pass_rate, mean_weighted_score) = if sample_count == 0 {
            (0.0, 0.0)
        } else {
            let total: f64 = reports.iter().map(|r| r.weighted_score).sum();
            (
                passed_count as f64 / sample_count as f64,
                total / sample_count as f64,
            )
        };

        let mut sums: Vec<(String, f64, usize)> = Vec::new();
        for criterion in reports.iter().flat_map(|r| r.criteria.iter()) {
            match sums.iter_mut().find(|(name, _, _)| *name == criterion.name) {
                Some((_, sum, count)) => {
                    *sum += criterion.normalized_score;
                    *count += 1;
                }
                None => sums.push((criterion.name.clone(), criterion.normalized_score, 1)),
            }
        }

        let criteria = sums
            .into_iter()
            .map(|(name, sum, samples)| {
                let mean = sum / samples as f64;
                CriterionAggregate {
                    name,
                    samples,
                    mean_normalized: mean,
                    adjusted: adjuster.adjust(mean, samples),
                }
            })
            .collect();

        Self {
            sample_count,
            passed_count,
            pass_rate,
            mean_weighted_score,
            criteria,
        }
    }

    pub fn criterion(&self, name: &str) -> Option<&CriterionAggregate> {
        self.criteria.iter().find(|c| c.name == name)
    }
}
