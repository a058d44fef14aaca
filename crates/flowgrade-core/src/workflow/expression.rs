//! JEXL expressions for step conditions, input mapping and extra gates.
//!
//! Wraps `jexl_eval::Evaluator`. Expressions are evaluated against a JSON
//! scope object; the executor's scope has the shape:
//!
//! ```json
//! {
//!   "variables": { ... },
//!   "steps": { "<name>": { "outputs": { ... }, "state": "success", "error": null } },
//!   "iteration": { "attempt": 1, "feedback": null }
//! }
//! ```
//!
//! References may be written `${steps.a.outputs.x}` or bare
//! `steps.a.outputs.x`; the `${ }` wrapper is stripped before the expression
//! reaches JEXL. Negation is the `|not` transform.
//!
//! Resolution is permissive: walking through a missing key or index yields
//! `null`, and an expression that fails at evaluation time (for example
//! `null > 1`) also yields `null`. A condition over data that is not there
//! yet is therefore false.
//!
//! Scope data is always passed as the JEXL context, never spliced into the
//! expression text.

use jexl_eval::Evaluator;
use jexl_eval::error::EvaluationError;
use serde_json::{Map, Value, json};

use super::context::ExecutionContext;

// ---------------------------------------------------------------------------
// ExpressionError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("unterminated reference at {offset}")]
    UnterminatedReference { offset: usize },

    #[error("empty expression")]
    Empty,

    #[error("parse error: {0}")]
    Parse(String),

    #[error("evaluation failed: {0}")]
    EvalFailed(String),

    #[error("scope must be a JSON object")]
    InvalidScope,
}

thread_local! {
    static EVALUATOR: Evaluator<'static> = evaluator();
}

fn evaluator() -> Evaluator<'static> {
    Evaluator::new()
        .with_transform("not", |args: &[Value]| {
            Ok(json!(!args.first().is_some_and(is_truthy)))
        })
        .with_transform("length", |args: &[Value]| {
            let len = match args.first() {
                Some(Value::String(s)) => s.chars().count(),
                Some(Value::Array(items)) => items.len(),
                Some(Value::Object(map)) => map.len(),
                _ => 0,
            };
            Ok(json!(len))
        })
        .with_transform("lower", |args: &[Value]| {
            let s = args.first().and_then(Value::as_str).unwrap_or("");
            Ok(json!(s.to_lowercase()))
        })
        .with_transform("contains", |args: &[Value]| {
            let found = match (args.first(), args.get(1)) {
                (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                _ => false,
            };
            Ok(json!(found))
        })
}

fn eval_jexl(source: &str, scope: &Value) -> Result<Value, ExpressionError> {
    if !scope.is_object() {
        return Err(ExpressionError::InvalidScope);
    }
    EVALUATOR.with(|evaluator| {
        evaluator
            .eval_in_context(source, scope)
            .map_err(|e| match &e {
                EvaluationError::ParseError(_) => ExpressionError::Parse(e.to_string()),
                _ => ExpressionError::EvalFailed(e.to_string()),
            })
    })
}

/// Replace every `${path}` in `source` with the bare `path`.
fn strip_references(source: &str) -> Result<String, ExpressionError> {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    let mut consumed = 0;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let inner = &rest[start + 2..];
        let Some(end) = inner.find('}') else {
            return Err(ExpressionError::UnterminatedReference {
                offset: consumed + start,
            });
        };
        out.push_str(inner[..end].trim());
        consumed += start + 2 + end + 1;
        rest = &inner[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Expression
// ---------------------------------------------------------------------------

/// A syntax-checked expression, ready to be evaluated any number of times.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    jexl: String,
}

impl Expression {
    /// Strip `${ }` wrappers and reject anything JEXL cannot parse.
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let jexl = strip_references(source)?;
        if jexl.trim().is_empty() {
            return Err(ExpressionError::Empty);
        }

        // Every path resolves to null here; only syntax errors matter.
        match eval_jexl(&jexl, &Value::Object(Map::new())) {
            Err(err @ ExpressionError::Parse(_)) => Err(err),
            _ => Ok(Self {
                source: source.to_string(),
                jexl,
            }),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn try_evaluate(&self, scope: &Value) -> Result<Value, ExpressionError> {
        eval_jexl(&self.jexl, scope)
    }

    /// Evaluate to a JSON value; evaluation failures are `null`.
    pub fn evaluate(&self, scope: &Value) -> Value {
        self.try_evaluate(scope).unwrap_or_else(|err| {
            tracing::trace!(expression = %self.source, error = %err, "expression evaluated to null");
            Value::Null
        })
    }

    /// Evaluate and coerce the result with [`is_truthy`].
    pub fn is_true(&self, scope: &Value) -> bool {
        is_truthy(&self.evaluate(scope))
    }
}

/// Truthiness: null, false, 0 and "" are false; arrays and objects are true.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Resolve a single reference (with or without `${ }`) against `scope`.
///
/// `None` for invalid references and for anything that resolves to null.
pub fn resolve_path(path: &str, scope: &Value) -> Option<Value> {
    Expression::parse(path)
        .ok()?
        .try_evaluate(scope)
        .ok()
        .filter(|value| !value.is_null())
}

// ---------------------------------------------------------------------------
// ExpressionEvaluator
// ---------------------------------------------------------------------------

/// Evaluates expressions against a live [`ExecutionContext`].
///
/// Stateless; each call snapshots the context into its expression scope.
pub struct ExpressionEvaluator;

impl ExpressionEvaluator {
    /// Evaluate `expr` to a boolean using [`is_truthy`].
    pub fn evaluate(expr: &str, ctx: &ExecutionContext) -> Result<bool, ExpressionError> {
        let parsed = Expression::parse(expr)?;
        Ok(parsed.is_true(&ctx.to_expression_scope()))
    }

    /// Evaluate `expr` to a JSON value. Unlike [`Expression::evaluate`],
    /// evaluation failures are reported.
    pub fn evaluate_value(expr: &str, ctx: &ExecutionContext) -> Result<Value, ExpressionError> {
        Expression::parse(expr)?.try_evaluate(&ctx.to_expression_scope())
    }

    /// Resolve a reference such as `steps.build.outputs.artifact`.
    pub fn resolve(path: &str, ctx: &ExecutionContext) -> Option<Value> {
        resolve_path(path, &ctx.to_expression_scope())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use flowgrade_types::workflow::{StepResult, StepState};

    fn scope() -> Value {
        json!({
            "variables": {
                "env": "prod",
                "threshold": 3,
                "flags": { "fast": true },
                "tags": ["a", "b"]
            },
            "steps": {
                "fetch": {
                    "state": "success",
                    "outputs": { "count": 5, "items": [{ "id": 7 }], "ok": true }
                }
            }
        })
    }

    fn eval_str(expr: &str) -> bool {
        Expression::parse(expr).unwrap().is_true(&scope())
    }

    #[test]
    fn test_comparisons() {
        assert!(eval_str("${steps.fetch.outputs.count} > ${variables.threshold}"));
        assert!(eval_str("${steps.fetch.outputs.count} >= 5"));
        assert!(!eval_str("${steps.fetch.outputs.count} < 5"));
        assert!(eval_str("${variables.env} == 'prod'"));
        assert!(eval_str("${variables.env} != 'dev'"));
    }

    #[test]
    fn test_boolean_combinators() {
        assert!(eval_str("${variables.flags.fast} && ${steps.fetch.outputs.ok}"));
        assert!(eval_str("false || ${variables.flags.fast}"));
        assert!(eval_str("(${variables.env} == 'dev')|not"));
        assert!(!eval_str("(${variables.flags.fast})|not"));
    }

    #[test]
    fn test_bare_and_wrapped_references_agree() {
        assert!(eval_str("steps.fetch.outputs.ok && ${variables.env} == 'prod'"));
        assert_eq!(
            strip_references("${ steps.a.outputs.x } > ${variables.n}").unwrap(),
            "steps.a.outputs.x > variables.n"
        );
    }

    #[test]
    fn test_integer_equals_float() {
        assert!(eval_str("${variables.threshold} == 3.0"));
    }

    #[test]
    fn test_indexed_paths() {
        assert!(eval_str("${steps.fetch.outputs.items[0].id} == 7"));
        assert!(eval_str("variables.tags[1] == 'b'"));
        assert!(eval_str("'a' in ${variables.tags}"));
    }

    #[test]
    fn test_transforms() {
        assert!(eval_str("${variables.tags}|length == 2"));
        assert!(eval_str("${variables.tags}|contains('b')"));
        assert!(eval_str("'PROD'|lower == ${variables.env}"));
    }

    #[test]
    fn test_missing_intermediate_resolves_to_none() {
        assert_eq!(resolve_path("${steps.ghost.outputs.count}", &scope()), None);
        assert_eq!(resolve_path("variables.flags.fast.deeper", &scope()), None);
        assert_eq!(resolve_path("variables.tags[9]", &scope()), None);
        // and conditions over it are simply false
        assert!(!eval_str("${steps.ghost.outputs.count} > 1"));
        assert!(!eval_str("${steps.ghost.outputs.ok}"));
        assert!(eval_str("${steps.ghost.outputs.ok} == null"));
    }

    #[test]
    fn test_mismatched_types_are_false() {
        assert!(!eval_str("${variables.env} > 1"));
        assert!(!eval_str("${variables.env} <= 1"));
        let expr = Expression::parse("${variables.env} > 1").unwrap();
        assert!(matches!(
            expr.try_evaluate(&scope()),
            Err(ExpressionError::EvalFailed(_))
        ));
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!("x")));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!({})));
    }

    #[test]
    fn test_evaluate_value_returns_referenced_value() {
        let expr = Expression::parse("${steps.fetch.outputs.items}").unwrap();
        assert_eq!(expr.evaluate(&scope()), json!([{ "id": 7 }]));
        assert_eq!(expr.source(), "${steps.fetch.outputs.items}");
    }

    #[test]
    fn test_invalid_syntax_is_rejected() {
        assert!(matches!(
            Expression::parse("exec('rm -rf /')"),
            Err(ExpressionError::Parse(_))
        ));
        assert!(matches!(
            Expression::parse("${variables.x} =="),
            Err(ExpressionError::Parse(_))
        ));
        assert_eq!(
            Expression::parse("a == ${variables.x"),
            Err(ExpressionError::UnterminatedReference { offset: 5 })
        );
        assert_eq!(Expression::parse("${ }"), Err(ExpressionError::Empty));
    }

    #[test]
    fn test_scope_must_be_an_object() {
        let expr = Expression::parse("true").unwrap();
        assert_eq!(
            expr.try_evaluate(&json!("not an object")),
            Err(ExpressionError::InvalidScope)
        );
        assert!(!expr.is_true(&json!([])));
    }

    #[test]
    fn test_evaluator_reads_execution_context() {
        let mut ctx = ExecutionContext::new("wf");
        ctx.variables.insert("mode".to_string(), json!("strict"));
        let mut outputs = Map::new();
        outputs.insert("score".to_string(), json!(0.9));
        ctx.record(StepResult {
            step: "grade".to_string(),
            state: StepState::Success,
            outputs,
            error: None,
            duration_ms: 1,
            retry_count: 0,
            skip_reason: None,
            target: None,
            model_tier: None,
        })
        .unwrap();

        assert!(
            ExpressionEvaluator::evaluate(
                "${variables.mode} == 'strict' && ${steps.grade.outputs.score} > 0.5",
                &ctx
            )
            .unwrap()
        );
        assert_eq!(
            ExpressionEvaluator::resolve("steps.grade.state", &ctx),
            Some(json!("success"))
        );
        assert_eq!(ExpressionEvaluator::resolve("steps.other.outputs", &ctx), None);
        assert_eq!(
            ExpressionEvaluator::evaluate_value("${steps.grade.outputs.score}", &ctx).unwrap(),
            json!(0.9)
        );
        assert!(ExpressionEvaluator::evaluate("${variables.mode} ==", &ctx).is_err());
    }
}
