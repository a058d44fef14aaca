//! Hard gates and the dataset compatibility check.
//!
//! Gates are binary preconditions. Any false gate fails the verdict
//! regardless of the weighted score; they are values, never errors.

use std::collections::{BTreeMap, BTreeSet};

use flowgrade_types::error::CompatibilityError;
use flowgrade_types::evaluation::{ExtraGate, HardGateResult};
use flowgrade_types::workflow::{DatasetSample, OutputDeclaration, WorkflowResult, WorkflowStatus};
use serde_json::{Map, Value, json};

use crate::workflow::expression::Expression;
use crate::workflow::graph::WorkflowGraph;

/// Everything besides the run result that the gates look at.
#[derive(Debug, Clone, Copy)]
pub struct GatePayload<'a> {
    pub sample: Option<&'a DatasetSample>,
    pub required_inputs: &'a BTreeSet<String>,
    pub extra_gates: &'a [ExtraGate],
}

/// JSON scope for objective score paths and extra gate expressions.
///
/// ```json
/// {
///   "outputs": { ...final_output },
///   "status": "success",
///   "steps": { "<name>": { "state": ..., "outputs": ..., "error": ..., "retry_count": ..., "duration_ms": ... } },
///   "sample": { "id": ..., "inputs": ..., "reference": ... },
///   "run": { "id": ..., "workflow_id": ..., "workflow_version": ..., "duration_ms": ... }
/// }
/// ```
pub fn evaluation_scope(result: &WorkflowResult, sample: Option<&DatasetSample>) -> Value {
    let mut steps = Map::new();
    for step in &result.step_results {
        steps.insert(
            step.step.clone(),
            json!({
                "state": step.state,
                "outputs": step.outputs,
                "error": step.error,
                "retry_count": step.retry_count,
                "duration_ms": step.duration_ms,
            }),
        );
    }

    json!({
        "outputs": result.final_output,
        "status": result.overall_status,
        "steps": steps,
        "sample": sample.map(|s| json!({
            "id": s.sample_id,
            "inputs": s.inputs,
            "reference": s.reference,
        })),
        "run": {
            "id": result.run_id.to_string(),
            "workflow_id": result.workflow_id,
            "workflow_version": result.workflow_version,
            "duration_ms": result.duration_ms,
        },
    })
}

/// Required inputs the sample does not provide (absent or null).
pub fn missing_inputs(required: &BTreeSet<String>, sample: &DatasetSample) -> Vec<String> {
    required
        .iter()
        .filter(|name| sample.inputs.get(*name).is_none_or(Value::is_null))
        .cloned()
        .collect()
}

/// Reject a sample that cannot drive `graph`, listing every reason.
pub fn check_compatibility(
    graph: &WorkflowGraph,
    sample: &DatasetSample,
) -> Result<(), CompatibilityError> {
    let mut reasons = Vec::new();
    if !sample.compatible {
        reasons.push("sample is marked incompatible with the workflow's capabilities".to_string());
    }
    reasons.extend(
        missing_inputs(graph.required_inputs(), sample)
            .into_iter()
            .map(|name| format!("missing required input '{name}'")),
    );

    if reasons.is_empty() {
        Ok(())
    } else {
        Err(CompatibilityError {
            workflow_id: graph.workflow_id().to_string(),
            sample_id: sample.sample_id.clone(),
            reasons,
        })
    }
}

/// Compute the five built-in gates plus any extra gates.
pub fn compute_hard_gates(
    result: &WorkflowResult,
    declared_outputs: &[OutputDeclaration],
    payload: &GatePayload<'_>,
) -> HardGateResult {
    let mut reasons = Vec::new();

    let mut required_outputs_present = true;
    for decl in declared_outputs.iter().filter(|d| d.required) {
        if result.final_output.get(&decl.name).is_none_or(Value::is_null) {
            required_outputs_present = false;
            reasons.push(format!("required output '{}' is missing", decl.name));
        }
    }

    let overall_status_success = result.overall_status == WorkflowStatus::Success;
    if !overall_status_success {
        reasons.push(format!("overall status is {}", result.overall_status));
    }

    let mut no_critical_step_failures = true;
    for step in result.step_results.iter().filter(|s| s.state.is_disqualifying()) {
        no_critical_step_failures = false;
        reasons.push(format!("step '{}' ended {}", step.step, step.state));
    }

    let mut schema_contract_valid = true;
    for decl in declared_outputs {
        let (Some(kind), Some(value)) = (decl.schema, result.final_output.get(&decl.name)) else {
            continue;
        };
        if !kind.matches(value) {
            schema_contract_valid = false;
            reasons.push(format!(
                "output '{}' should be {kind}, got {}",
                decl.name,
                json_type(value)
            ));
        }
    }

    let dataset_workflow_compatible = match payload.sample {
        Some(sample) => {
            let missing = missing_inputs(payload.required_inputs, sample);
            if !sample.compatible {
                reasons.push(format!(
                    "sample '{}' is marked incompatible",
                    sample.sample_id
                ));
            }
            for name in &missing {
                reasons.push(format!(
                    "sample '{}' is missing required input '{name}'",
                    sample.sample_id
                ));
            }
            sample.compatible && missing.is_empty()
        }
        None if payload.required_inputs.is_empty() => true,
        None => {
            reasons.push("no dataset sample for a workflow with required inputs".to_string());
            false
        }
    };

    let mut extra = BTreeMap::new();
    if !payload.extra_gates.is_empty() {
        let scope = evaluation_scope(result, payload.sample);
        for gate in payload.extra_gates {
            let passed = match Expression::parse(&gate.expression) {
                Ok(expr) => {
                    let passed = expr.is_true(&scope);
                    if !passed {
                        reasons.push(format!("gate '{}' failed: {}", gate.name, gate.expression));
                    }
                    passed
                }
                Err(err) => {
                    reasons.push(format!("gate '{}' is invalid: {err}", gate.name));
                    false
                }
            };
            extra.insert(gate.name.clone(), passed);
        }
    }

    HardGateResult {
        required_outputs_present,
        overall_status_success,
        no_critical_step_failures,
        schema_contract_valid,
        dataset_workflow_compatible,
        extra,
        failure_reasons: reasons,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
