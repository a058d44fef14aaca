//! EvaluationEngine -- turns a finished run into a `ScoreReport`.
//!
//! Steps: resolve the effective rubric (profile + overrides), compute hard
//! gates, collect a raw score per criterion (objective paths, judge calls,
//! pairwise comparisons), then grade. Judge trouble never fails an
//! evaluation; the affected criteria fall back to their objective path and
//! are flagged in the report.

use flowgrade_types::config::EvaluationConfig;
use flowgrade_types::evaluation::{
    CriterionDefinition, JudgeMetadata, RawScore, ReportFlag, RubricDefinition, ScoreReport,
    ScoreSource,
};
use flowgrade_types::event::FlowEvent;
use flowgrade_types::workflow::{DatasetSample, WorkflowResult};
use serde_json::Value;
use tracing::field::{Empty, display};
use tracing::{Instrument, info, warn};

use crate::event::EventBus;
use crate::workflow::expression::resolve_path;
use crate::workflow::graph::WorkflowGraph;

use super::gates::{GatePayload, compute_hard_gates, evaluation_scope};
use super::grading::{ScoredCriterion, grade};
use super::judge::{JudgeCriterion, JudgeProtocol};
use super::normalize::{NormalizationError, NormalizationRegistry};
use super::profile::{ProfileError, ProfileRegistry};
use super::reliability::ReliabilityAdjuster;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvaluationError {
    #[error(transparent)]
    Profile(#[from] ProfileError),

    #[error(transparent)]
    Normalization(#[from] NormalizationError),
}

/// What to score a run against.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvaluationTarget<'a> {
    pub sample: Option<&'a DatasetSample>,
    pub rubric: Option<&'a RubricDefinition>,
    pub profile_id: Option<&'a str>,
}

impl<'a> EvaluationTarget<'a> {
    pub fn profile(profile_id: &'a str) -> Self {
        Self {
            profile_id: Some(profile_id),
            ..Self::default()
        }
    }

    pub fn rubric(rubric: &'a RubricDefinition) -> Self {
        Self {
            rubric: Some(rubric),
            ..Self::default()
        }
    }

    pub fn with_sample(mut self, sample: &'a DatasetSample) -> Self {
        self.sample = Some(sample);
        self
    }

    pub fn with_profile(mut self, profile_id: &'a str) -> Self {
        self.profile_id = Some(profile_id);
        self
    }
}

#[derive(Debug)]
pub struct EvaluationEngine {
    normalization: NormalizationRegistry,
    profiles: ProfileRegistry,
    judge: Option<JudgeProtocol>,
    config: EvaluationConfig,
    event_bus: Option<EventBus>,
}

impl EvaluationEngine {
    pub fn new(config: EvaluationConfig) -> Self {
        Self {
            normalization: NormalizationRegistry::with_builtins(),
            profiles: ProfileRegistry::builtin(),
            judge: None,
            config,
            event_bus: None,
        }
    }

    pub fn with_normalization(mut self, normalization: NormalizationRegistry) -> Self {
        self.normalization = normalization;
        self
    }

    pub fn with_profiles(mut self, profiles: ProfileRegistry) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn with_judge(mut self, judge: JudgeProtocol) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn config(&self) -> &EvaluationConfig {
        &self.config
    }

    pub fn normalization(&self) -> &NormalizationRegistry {
        &self.normalization
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.profiles
    }

    pub fn reliability(&self) -> ReliabilityAdjuster {
        ReliabilityAdjuster::from_config(&self.config)
    }

    /// Score `result`, produced by running `graph`, against `target`.
    pub async fn evaluate(
        &self,
        graph: &WorkflowGraph,
        result: &WorkflowResult,
        target: EvaluationTarget<'_>,
    ) -> Result<ScoreReport, EvaluationError> {
        let span = tracing::info_span!(
            "evaluation",
            flowgrade.run.id = %result.run_id,
            flowgrade.rubric.id = Empty,
            flowgrade.profile.id = target.profile_id,
            flowgrade.sample.id = target.sample.map(|s| s.sample_id.as_str()),
            flowgrade.score.weighted = Empty,
            flowgrade.grade = Empty,
            flowgrade.passed = Empty,
        );
        let report = self
            .score(graph, result, target)
            .instrument(span.clone())
            .await?;
        span.record("flowgrade.rubric.id", report.rubric_id.as_str());
        span.record("flowgrade.score.weighted", report.weighted_score);
        span.record("flowgrade.grade", display(&report.grade));
        span.record("flowgrade.passed", report.passed);
        Ok(report)
    }

    async fn score(
        &self,
        graph: &WorkflowGraph,
        result: &WorkflowResult,
        target: EvaluationTarget<'_>,
    ) -> Result<ScoreReport, EvaluationError> {
        let effective = self.profiles.effective_rubric(
            target.profile_id,
            target.rubric,
            &self.normalization,
            self.config.weight_tolerance,
        )?;

        let hard_gates = compute_hard_gates(
            result,
            graph.outputs(),
            &GatePayload {
                sample: target.sample,
                required_inputs: graph.required_inputs(),
                extra_gates: &effective.extra_gates,
            },
        );

        let scope = evaluation_scope(result, target.sample);
        let mut collector = Collector {
            scope: &scope,
            scored: effective
                .criteria
                .iter()
                .map(|c| ScoredCriterion::new(c.clone(), None))
                .collect(),
            flags: Vec::new(),
            judge: None,
        };

        collector.objective();
        let candidate = Value::Object(
            result
                .final_output
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        self.judge_direct(&mut collector, &candidate).await;
        self.judge_pairwise(&mut collector, &candidate, target.sample)
            .await;

        let pass_threshold = effective
            .pass_threshold
            .unwrap_or(self.config.pass_threshold);
        let outcome = grade(
            &hard_gates,
            &collector.scored,
            &self.normalization,
            pass_threshold,
        )?;

        let report = ScoreReport {
            rubric_id: effective.rubric_id,
            rubric_version: effective.version.to_string(),
            profile_id: effective.profile_id,
            hard_gates,
            criteria: outcome.criteria,
            weighted_score: outcome.weighted_score,
            grade: outcome.grade,
            passed: outcome.passed,
            pass_threshold,
            floor_violations: outcome.floor_violations,
            flags: collector.flags,
            judge: collector.judge,
        };

        info!(
            run_id = %result.run_id,
            workflow = %result.workflow_id,
            rubric = %report.rubric_id,
            weighted_score = report.weighted_score,
            grade = %report.grade,
            passed = report.passed,
            "run evaluated"
        );

        if let Some(bus) = &self.event_bus {
            bus.publish(FlowEvent::EvaluationComplete {
                run_id: result.run_id,
                sample_id: target.sample.map(|s| s.sample_id.clone()),
                passed: report.passed,
                grade: report.grade,
                weighted_score: report.weighted_score,
            });
        }

        Ok(report)
    }

    async fn judge_direct(&self, collector: &mut Collector<'_>, candidate: &Value) {
        let indices = collector.indices(|s| matches!(s, ScoreSource::Judge { .. }));
        if indices.is_empty() {
            return;
        }
        let Some(judge) = &self.judge else {
            collector.fall_back(&indices, "no judge configured");
            return;
        };

        let criteria = collector.judge_criteria(&indices);
        match judge.score(candidate, &criteria).await {
            Ok(verdict) => {
                for (&i, score) in indices.iter().zip(verdict.scores) {
                    collector.scored[i].raw = Some(RawScore::Number(score.score));
                    collector.scored[i].evidence = score.evidence;
                }
                collector.judge = Some(verdict.metadata);
            }
            Err(e) => collector.fall_back(&indices, &e.to_string()),
        }
    }

    async fn judge_pairwise(
        &self,
        collector: &mut Collector<'_>,
        candidate: &Value,
        sample: Option<&DatasetSample>,
    ) {
        let indices = collector.indices(|s| matches!(s, ScoreSource::Pairwise { .. }));
        if indices.is_empty() {
            return;
        }
        let Some(judge) = &self.judge else {
            collector.fall_back(&indices, "no judge configured");
            return;
        };
        let Some(reference) = sample.and_then(|s| s.reference.as_ref()) else {
            collector.fall_back(&indices, "no reference answer to compare against");
            return;
        };

        let criteria = collector.judge_criteria(&indices);
        match judge.score_pairwise(candidate, reference, &criteria).await {
            Ok(verdict) => {
                for (&i, score) in indices.iter().zip(verdict.scores) {
                    if let Some((first, second)) = score.inconsistent {
                        collector.flags.push(ReportFlag::PairwiseInconsistent {
                            criterion: score.name.clone(),
                            first,
                            second,
                        });
                    }
                    collector.scored[i].raw = Some(score.raw);
                    collector.scored[i].evidence = score.evidence;
                }
                collector.judge = Some(verdict.metadata);
            }
            Err(e) => collector.fall_back(&indices, &e.to_string()),
        }
    }
}

impl Default for EvaluationEngine {
    fn default() -> Self {
        Self::new(EvaluationConfig::default())
    }
}

/// Per-evaluation scratch state: scores, flags and judge identity.
struct Collector<'a> {
    scope: &'a Value,
    scored: Vec<ScoredCriterion>,
    flags: Vec<ReportFlag>,
    judge: Option<JudgeMetadata>,
}

impl Collector<'_> {
    fn indices(&self, pick: impl Fn(&ScoreSource) -> bool) -> Vec<usize> {
        self.scored
            .iter()
            .enumerate()
            .filter(|(_, s)| pick(&s.definition.source))
            .map(|(i, _)| i)
            .collect()
    }

    fn judge_criteria(&self, indices: &[usize]) -> Vec<JudgeCriterion> {
        indices
            .iter()
            .map(|&i| JudgeCriterion::from(&self.scored[i].definition))
            .collect()
    }

    fn objective(&mut self) {
        for item in &mut self.scored {
            let ScoreSource::Objective { path } = &item.definition.source else {
                continue;
            };
            item.raw = resolve_number(path, self.scope);
            if item.raw.is_none() {
                self.flags.push(ReportFlag::ObjectiveMissing {
                    criterion: item.definition.name.clone(),
                    path: path.clone(),
                });
            }
        }
    }

    fn fall_back(&mut self, indices: &[usize], reason: &str) {
        for &i in indices {
            let def: &CriterionDefinition = &self.scored[i].definition;
            warn!(criterion = %def.name, reason, "judge unavailable; scoring objectively");
            let raw = def
                .source
                .fallback_path()
                .and_then(|path| resolve_number(path, self.scope));
            self.flags.push(ReportFlag::JudgeFallback {
                criterion: def.name.clone(),
                reason: reason.to_string(),
            });
            self.scored[i].raw = raw;
        }
    }
}

/// Resolve `path` to a number. Booleans count as 0/1; numeric strings parse.
fn resolve_number(path: &str, scope: &Value) -> Option<RawScore> {
    let n = match resolve_path(path, scope)? {
        Value::Number(n) => n.as_f64()?,
        Value::Bool(b) => f64::from(u8::from(b)),
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    Some(RawScore::Number(n))
}
