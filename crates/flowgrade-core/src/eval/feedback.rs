//! Repair feedback built from an evaluated attempt.
//!
//! The text is injected into the next attempt's context as
//! `${iteration.feedback}` so agent steps can act on it.

use std::fmt::Write;

use flowgrade_types::evaluation::ScoreReport;
use flowgrade_types::workflow::WorkflowResult;

/// Criteria below this normalized score are listed as weak.
pub const WEAK_CRITERION: f64 = 0.6;

/// Summarize why `attempt` (1-based) did not pass, for the next attempt.
pub fn build_feedback(report: &ScoreReport, result: &WorkflowResult, attempt: u32) -> String {
    let mut out = format!(
        "## Evaluation Feedback (attempt {attempt})\n\
         \n\
         **Score:** {:.2} (grade {}, threshold {:.2})\n\
         **Run status:** {}\n",
        report.weighted_score, report.grade, report.pass_threshold, result.overall_status,
    );

    if !report.hard_gates.failure_reasons.is_empty() {
        out.push_str("\n### Failed gates\n");
        for reason in &report.hard_gates.failure_reasons {
            let _ = writeln!(out, "- {reason}");
        }
    }

    let failed_steps: Vec<_> = result
        .step_results
        .iter()
        .filter(|s| s.state.is_disqualifying())
        .collect();
    if !failed_steps.is_empty() {
        out.push_str("\n### Failed steps\n");
        for step in failed_steps {
            let error = step.error.as_deref().unwrap_or("no error message");
            let _ = writeln!(out, "- {} ({}): {error}", step.step, step.state);
        }
    }

    if !report.floor_violations.is_empty() {
        out.push_str("\n### Below critical floor\n");
        for v in &report.floor_violations {
            let _ = writeln!(
                out,
                "- {}: {:.2} < {:.2}",
                v.criterion, v.normalized_score, v.critical_floor
            );
        }
    }

    let weak: Vec<_> = report
        .criteria
        .iter()
        .filter(|c| c.floor_passed && c.normalized_score < WEAK_CRITERION)
        .collect();
    if !weak.is_empty() {
        out.push_str("\n### Weak criteria\n");
        for c in weak {
            let _ = write!(out, "- {}: {:.2}", c.name, c.normalized_score);
            if let Some(evidence) = c.evidence.first() {
                let _ = write!(out, " ({evidence})");
            }
            out.push('\n');
        }
    }

    out.push_str(
        "\nAddress the items above in the next attempt. Keep what already works.",
    );
    out
}
