//! Judge protocol for subjective criteria.
//!
//! The engine talks to an external scorer (usually an LLM) through
//! [`JudgeClient`], which returns raw text. [`JudgeProtocol`] owns the rest:
//! prompt rendering, structured-output parsing, bounded reruns on malformed
//! replies, and swapped-order reconciliation for pairwise criteria.
//!
//! Follows the blanket-impl pattern used for dynamic dispatch over RPITIT
//! traits:
//! 1. `JudgeClient` uses `impl Future` returns
//! 2. `JudgeClientDyn` is the object-safe mirror with boxed futures
//! 3. `BoxJudgeClient` wraps `Box<dyn JudgeClientDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use flowgrade_types::config::JudgeConfig;
use flowgrade_types::evaluation::{CriterionDefinition, JudgeMetadata, RawScore, Scale};
use serde::Deserialize;
use serde_json::Value;
use tracing::{Instrument, info, warn};

// ---------------------------------------------------------------------------
// Request / error
// ---------------------------------------------------------------------------

/// One criterion as presented to the judge.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeCriterion {
    pub name: String,
    pub definition: String,
    pub scale: Scale,
}

impl From<&CriterionDefinition> for JudgeCriterion {
    fn from(def: &CriterionDefinition) -> Self {
        Self {
            name: def.name.clone(),
            definition: def.definition.clone(),
            scale: def.scale,
        }
    }
}

/// A single judge call.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeRequest {
    pub candidate: Value,
    /// Present for pairwise calls.
    pub baseline: Option<Value>,
    pub criteria: Vec<JudgeCriterion>,
    pub temperature: f32,
    pub prompt_version: String,
    /// Pairwise only: the baseline is shown first.
    pub swapped: bool,
}

impl JudgeRequest {
    /// Render the request as a prompt demanding JSON-only output.
    pub fn render_prompt(&self) -> String {
        let criteria = self
            .criteria
            .iter()
            .map(|c| {
                format!(
                    "- {} (score {} to {}): {}",
                    c.name, c.scale.min, c.scale.max, c.definition
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let body = match &self.baseline {
            None => format!(
                "Score the response below on each criterion.\n\nResponse:\n{}",
                self.candidate
            ),
            Some(baseline) => {
                let (first, second) = if self.swapped {
                    (baseline, &self.candidate)
                } else {
                    (&self.candidate, baseline)
                };
                format!(
                    "Compare Response A with Response B on each criterion. Positive scores \
                     favour A, negative scores favour B, zero is a tie.\n\n\
                     Response A:\n{first}\n\nResponse B:\n{second}"
                )
            }
        };

        format!(
            "You are an evaluation judge (prompt {}).\n\nCriteria:\n{criteria}\n\n{body}\n\n\
             Respond with ONLY valid JSON:\n\
             {{\"criteria\": [{{\"name\": \"<criterion>\", \"score\": <number>, \"evidence\": \"<short justification>\"}}]}}",
            self.prompt_version
        )
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JudgeProtocolError {
    #[error("judge transport error: {0}")]
    Transport(String),

    #[error("malformed judge output: {0}")]
    Malformed(String),

    #[error("judge output has no score for criterion '{0}'")]
    MissingCriterion(String),

    #[error("judge scored '{criterion}' {score}, outside [{min}, {max}]")]
    OutOfScale {
        criterion: String,
        score: f64,
        min: f64,
        max: f64,
    },
}

// ---------------------------------------------------------------------------
// JudgeClient
// ---------------------------------------------------------------------------

/// An external scorer returning raw (expected JSON) text.
pub trait JudgeClient: Send + Sync {
    fn model_id(&self) -> &str;

    fn model_version(&self) -> &str;

    fn judge(
        &self,
        request: &JudgeRequest,
    ) -> impl Future<Output = Result<String, JudgeProtocolError>> + Send;
}

/// Object-safe version of [`JudgeClient`] with boxed futures.
pub trait JudgeClientDyn: Send + Sync {
    fn model_id(&self) -> &str;

    fn model_version(&self) -> &str;

    fn judge_boxed<'a>(
        &'a self,
        request: &'a JudgeRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String, JudgeProtocolError>> + Send + 'a>>;
}

impl<T: JudgeClient> JudgeClientDyn for T {
    fn model_id(&self) -> &str {
        JudgeClient::model_id(self)
    }

    fn model_version(&self) -> &str {
        JudgeClient::model_version(self)
    }

    fn judge_boxed<'a>(
        &'a self,
        request: &'a JudgeRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String, JudgeProtocolError>> + Send + 'a>> {
        Box::pin(self.judge(request))
    }
}

/// Type-erased judge client.
pub struct BoxJudgeClient {
    inner: Box<dyn JudgeClientDyn>,
}

impl BoxJudgeClient {
    pub fn new<T: JudgeClient + 'static>(client: T) -> Self {
        Self {
            inner: Box::new(client),
        }
    }

    pub fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    pub fn model_version(&self) -> &str {
        self.inner.model_version()
    }

    pub async fn judge(&self, request: &JudgeRequest) -> Result<String, JudgeProtocolError> {
        self.inner.judge_boxed(request).await
    }
}

impl std::fmt::Debug for BoxJudgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxJudgeClient")
            .field("model_id", &self.model_id())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// A validated score for one criterion.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeScore {
    pub name: String,
    pub score: f64,
    pub evidence: Vec<String>,
}

#[derive(Deserialize)]
struct WireVerdict {
    criteria: Vec<WireScore>,
}

#[derive(Deserialize)]
struct WireScore {
    name: String,
    score: f64,
    #[serde(default)]
    evidence: Value,
}

fn evidence_lines(value: Value) -> Vec<String> {
    match value {
        Value::Null => Vec::new(),
        Value::String(s) if s.is_empty() => Vec::new(),
        Value::String(s) => vec![s],
        Value::Array(items) => items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect(),
        other => vec![other.to_string()],
    }
}

/// Locate the JSON object in a reply that may wrap it in prose or fences.
fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && start < end
    {
        return &trimmed[start..=end];
    }
    trimmed
}

/// Parse a raw judge reply and check it covers `criteria` within scale.
///
/// Scores come back in the order of `criteria`.
pub fn parse_judge_output(
    raw: &str,
    criteria: &[JudgeCriterion],
) -> Result<Vec<JudgeScore>, JudgeProtocolError> {
    let verdict: WireVerdict = serde_json::from_str(extract_json(raw))
        .map_err(|e| JudgeProtocolError::Malformed(e.to_string()))?;
    let mut wire = verdict.criteria;

    criteria
        .iter()
        .map(|c| {
            let idx = wire
                .iter()
                .position(|w| w.name == c.name)
                .ok_or_else(|| JudgeProtocolError::MissingCriterion(c.name.clone()))?;
            let found = wire.swap_remove(idx);
            if !found.score.is_finite() || !c.scale.contains(found.score) {
                return Err(JudgeProtocolError::OutOfScale {
                    criterion: c.name.clone(),
                    score: found.score,
                    min: c.scale.min,
                    max: c.scale.max,
                });
            }
            Ok(JudgeScore {
                name: c.name.clone(),
                score: found.score,
                evidence: evidence_lines(found.evidence),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// JudgeProtocol
// ---------------------------------------------------------------------------

/// Scores for a direct (non-pairwise) call.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeVerdict {
    pub scores: Vec<JudgeScore>,
    pub metadata: JudgeMetadata,
}

/// Reconciled outcome of one pairwise criterion.
#[derive(Debug, Clone, PartialEq)]
pub struct PairwiseScore {
    pub name: String,
    pub raw: RawScore,
    pub evidence: Vec<String>,
    /// Candidate-perspective scores of the last disagreeing pair, when a tie
    /// had to be forced.
    pub inconsistent: Option<(f64, f64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairwiseVerdict {
    pub scores: Vec<PairwiseScore>,
    pub metadata: JudgeMetadata,
}

/// Runs judge calls with reruns and swapped-order reconciliation.
#[derive(Debug)]
pub struct JudgeProtocol {
    client: BoxJudgeClient,
    config: JudgeConfig,
}

impl JudgeProtocol {
    pub fn new(client: BoxJudgeClient, config: JudgeConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &JudgeConfig {
        &self.config
    }

    pub fn metadata(&self) -> JudgeMetadata {
        JudgeMetadata {
            model_id: self.client.model_id().to_string(),
            model_version: self.client.model_version().to_string(),
            prompt_version: self.config.prompt_version.clone(),
        }
    }

    fn request(
        &self,
        candidate: &Value,
        baseline: Option<&Value>,
        criteria: &[JudgeCriterion],
        swapped: bool,
    ) -> JudgeRequest {
        JudgeRequest {
            candidate: candidate.clone(),
            baseline: baseline.cloned(),
            criteria: criteria.to_vec(),
            temperature: self.config.temperature,
            prompt_version: self.config.prompt_version.clone(),
            swapped,
        }
    }

    /// One call, rerun up to `max_reruns` times on any failure.
    async fn call(&self, request: &JudgeRequest) -> Result<Vec<JudgeScore>, JudgeProtocolError> {
        let attempts = 1 + self.config.max_reruns;
        let mut last_error = None;
        for attempt in 1..=attempts {
            let span = tracing::info_span!(
                "judge_call",
                flowgrade.judge.model = %self.client.model_id(),
                flowgrade.judge.model_version = %self.client.model_version(),
                flowgrade.judge.prompt_version = %self.config.prompt_version,
            );
            let result = self
                .client
                .judge(request)
                .instrument(span)
                .await
                .and_then(|raw| parse_judge_output(&raw, &request.criteria));
            match result {
                Ok(scores) => return Ok(scores),
                Err(e) => {
                    warn!(
                        model = %self.client.model_id(),
                        attempt,
                        attempts,
                        swapped = request.swapped,
                        error = %e,
                        "judge call failed"
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| JudgeProtocolError::Transport("judge was never called".to_string())))
    }

    fn log_verdict(&self, kind: &str, criteria: usize) {
        info!(
            model_id = %self.client.model_id(),
            model_version = %self.client.model_version(),
            prompt_version = %self.config.prompt_version,
            kind,
            criteria,
            "judge verdict"
        );
    }

    /// Score `candidate` on each criterion.
    pub async fn score(
        &self,
        candidate: &Value,
        criteria: &[JudgeCriterion],
    ) -> Result<JudgeVerdict, JudgeProtocolError> {
        let request = self.request(candidate, None, criteria, false);
        let scores = self.call(&request).await?;
        self.log_verdict("direct", scores.len());
        Ok(JudgeVerdict {
            scores,
            metadata: self.metadata(),
        })
    }

    /// Compare `candidate` with `baseline` in both presentation orders.
    ///
    /// Scores are turned to the candidate's perspective before comparison.
    /// A criterion whose two scores differ by more than `scale_tolerance`
    /// is inconsistent; the pair is rerun once (when reruns are allowed)
    /// and a criterion still inconsistent after that is forced to a tie.
    pub async fn score_pairwise(
        &self,
        candidate: &Value,
        baseline: &Value,
        criteria: &[JudgeCriterion],
    ) -> Result<PairwiseVerdict, JudgeProtocolError> {
        let rounds = if self.config.max_reruns > 0 { 2 } else { 1 };
        let mut pending: Vec<JudgeCriterion> = criteria.to_vec();
        let mut settled: Vec<PairwiseScore> = Vec::with_capacity(criteria.len());

        for round in 1..=rounds {
            let forward = self.request(candidate, Some(baseline), &pending, false);
            let swapped = self.request(candidate, Some(baseline), &pending, true);
            let (first, second) =
                futures_util::future::join(self.call(&forward), self.call(&swapped)).await;
            let (first, second) = (first?, second?);

            let mut still_inconsistent = Vec::new();
            for ((criterion, a), b) in pending.iter().zip(first).zip(second) {
                let s1 = a.score;
                let s2 = -b.score;
                if (s1 - s2).abs() <= self.config.scale_tolerance {
                    let mut evidence = a.evidence;
                    evidence.extend(b.evidence);
                    settled.push(PairwiseScore {
                        name: criterion.name.clone(),
                        raw: tally(s1, s2),
                        evidence,
                        inconsistent: None,
                    });
                } else if round == rounds {
                    warn!(
                        criterion = %criterion.name,
                        first = s1,
                        second = s2,
                        "pairwise verdicts disagree after rerun; forcing a tie"
                    );
                    settled.push(PairwiseScore {
                        name: criterion.name.clone(),
                        raw: RawScore::Pairwise {
                            wins: 0,
                            ties: 2,
                            total: 2,
                        },
                        evidence: Vec::new(),
                        inconsistent: Some((s1, s2)),
                    });
                } else {
                    warn!(
                        criterion = %criterion.name,
                        first = s1,
                        second = s2,
                        "pairwise verdicts disagree; rerunning"
                    );
                    still_inconsistent.push(criterion.clone());
                }
            }

            if still_inconsistent.is_empty() {
                break;
            }
            pending = still_inconsistent;
        }

        // Back to the caller's criterion order.
        let scores = criteria
            .iter()
            .filter_map(|c| {
                settled
                    .iter()
                    .position(|s| s.name == c.name)
                    .map(|i| settled.swap_remove(i))
            })
            .collect::<Vec<_>>();
        self.log_verdict("pairwise", scores.len());
        Ok(PairwiseVerdict {
            scores,
            metadata: self.metadata(),
        })
    }
}

/// Each call is one comparison: win above zero, tie at zero.
fn tally(first: f64, second: f64) -> RawScore {
    let (mut wins, mut ties) = (0, 0);
    for s in [first, second] {
        if s > 0.0 {
            wins += 1;
        } else if s == 0.0 {
            ties += 1;
        }
    }
    RawScore::Pairwise {
        wins,
        ties,
        total: 2,
    }
}
