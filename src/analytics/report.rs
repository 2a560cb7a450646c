//! Single-trace analysis.
//!
//! Everything here is a pure function of one [`ReasoningTrace`]; the engine
//! only loads the trace and hands it over.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::stats::{mean, std_dev, variance};
use super::types::{TraceAnalysis, TraceIssue};
use crate::trace::{DecisionLevel, ReasoningStep, ReasoningTrace, ReasoningType};

const LOW_CONFIDENCE: f64 = 0.3;
const RUSHED_MS: f64 = 100.0;
const DECISION_POINT_PREFIX: usize = 50;

/// Build the full report for one trace.
pub fn analyze_trace(trace: &ReasoningTrace) -> TraceAnalysis {
    let steps: Vec<&ReasoningStep> = trace.steps().collect();

    let mut steps_by_level = BTreeMap::new();
    let mut steps_by_type = BTreeMap::new();
    for step in &steps {
        *steps_by_level.entry(step.decision_level).or_insert(0) += 1;
        *steps_by_type.entry(step.reasoning_type).or_insert(0) += 1;
    }

    let issues = detect_issues(&steps);
    let suggestions = suggestions_for(&issues, trace);

    TraceAnalysis {
        trace_id: trace.trace_id().to_string(),
        operation_type: trace.operation_type().to_string(),
        total_steps: trace.total_steps(),
        success: trace.success(),
        overall_confidence: trace.overall_confidence(),
        total_duration_ms: trace.total_duration_ms(),
        confidence_progression: steps.iter().map(|s| s.confidence_score).collect(),
        decision_path: steps.iter().map(|s| s.decision_point.clone()).collect(),
        reasoning_quality_score: reasoning_quality_score(&steps),
        decision_consistency_score: decision_consistency_score(&steps),
        confidence_calibration_score: confidence_calibration_score(trace),
        patterns: detect_patterns(trace, &steps, &steps_by_type),
        steps_by_level,
        steps_by_type,
        issues,
        suggestions,
    }
}

/// Mean of reasoning coverage, confidence steadiness and level coverage.
/// Zero for a trace without steps.
pub fn reasoning_quality_score(steps: &[&ReasoningStep]) -> f64 {
    if steps.is_empty() {
        return 0.0;
    }

    let with_reasoning = steps
        .iter()
        .filter(|s| !s.reasoning_text.trim().is_empty())
        .count() as f64
        / steps.len() as f64;

    let confidences: Vec<f64> = steps.iter().map(|s| s.confidence_score).collect();
    let steadiness = (1.0 - std_dev(&confidences).unwrap_or(0.0)).max(0.0);

    let levels: BTreeSet<DecisionLevel> = steps.iter().map(|s| s.decision_level).collect();
    let level_coverage = levels.len() as f64 / DecisionLevel::ALL.len() as f64;

    (with_reasoning + steadiness + level_coverage) / 3.0
}

/// `1.0` minus the confidence variance of every group of steps sharing the
/// first 50 characters of their decision point, floored at zero.
pub fn decision_consistency_score(steps: &[&ReasoningStep]) -> f64 {
    let mut groups: HashMap<String, Vec<f64>> = HashMap::new();
    for step in steps {
        let prefix: String = step.decision_point.chars().take(DECISION_POINT_PREFIX).collect();
        groups.entry(prefix).or_default().push(step.confidence_score);
    }

    let penalty: f64 = groups
        .values()
        .filter(|confidences| confidences.len() > 1)
        .filter_map(|confidences| variance(confidences))
        .sum();

    (1.0 - penalty).max(0.0)
}

/// How well the stated confidence matched the outcome.
pub fn confidence_calibration_score(trace: &ReasoningTrace) -> f64 {
    if trace.success() {
        trace.overall_confidence()
    } else {
        1.0 - trace.overall_confidence()
    }
}

fn detect_issues(steps: &[&ReasoningStep]) -> Vec<TraceIssue> {
    let mut issues = Vec::new();

    let low = steps
        .iter()
        .filter(|s| s.confidence_score < LOW_CONFIDENCE)
        .count();
    if low > 0 {
        issues.push(TraceIssue::LowConfidence { count: low });
    }

    let missing = steps
        .iter()
        .filter(|s| s.reasoning_text.trim().is_empty())
        .count();
    if missing > 0 {
        issues.push(TraceIssue::MissingReasoning { count: missing });
    }

    let errors = steps.iter().filter(|s| s.error_occurred).count();
    if errors > 0 {
        issues.push(TraceIssue::Errors { count: errors });
    }

    let rushed = steps
        .iter()
        .filter(|s| s.duration_ms.is_some_and(|d| d < RUSHED_MS))
        .count();
    if rushed * 2 > steps.len() {
        issues.push(TraceIssue::RushedDecisions { count: rushed });
    }

    issues
}

fn suggestions_for(issues: &[TraceIssue], trace: &ReasoningTrace) -> Vec<String> {
    let mut suggestions: Vec<String> = issues
        .iter()
        .map(|issue| {
            match issue {
                TraceIssue::LowConfidence { .. } => {
                    "Gather more context or request review before acting on low-confidence decisions"
                }
                TraceIssue::MissingReasoning { .. } => "Record reasoning text for every decision",
                TraceIssue::Errors { .. } => {
                    "Add error handling or fallback decisions around the failing steps"
                }
                TraceIssue::RushedDecisions { .. } => {
                    "Allow more deliberation on decisions that complete in under 100ms"
                }
            }
            .to_string()
        })
        .collect();

    if trace.total_steps() > 0 && trace.overall_confidence() < 0.5 {
        suggestions.push(
            "Break complex decisions into smaller, more focused decisions".to_string(),
        );
    }

    suggestions
}

fn detect_patterns(
    trace: &ReasoningTrace,
    steps: &[&ReasoningStep],
    steps_by_type: &BTreeMap<ReasoningType, usize>,
) -> Vec<String> {
    let mut patterns = Vec::new();
    let total = steps.len();

    if let Some((dominant, count)) = steps_by_type.iter().max_by_key(|(_, count)| **count) {
        if total >= 2 && count * 2 > total {
            patterns.push(format!(
                "Dominated by {} decisions ({} of {})",
                dominant, count, total
            ));
        }
    }

    if total >= 4 {
        let confidences: Vec<f64> = steps.iter().map(|s| s.confidence_score).collect();
        let (early, late) = confidences.split_at(total / 2);
        if let (Some(early), Some(late)) = (mean(early), mean(late)) {
            if late - early >= 0.1 {
                patterns.push("Confidence increases as the operation progresses".to_string());
            } else if early - late >= 0.1 {
                patterns.push("Confidence decreases as the operation progresses".to_string());
            }
        }
    }

    if let Some(first_error) = steps.iter().position(|s| s.error_occurred) {
        let recovered = steps[first_error + 1..].iter().any(|s| {
            matches!(
                s.reasoning_type,
                ReasoningType::FallbackDecision | ReasoningType::ErrorHandling
            )
        });
        if recovered {
            patterns.push("Recovered from errors through fallback decisions".to_string());
        }
    }

    let depth = steps.iter().map(|s| depth_of(trace, s)).max().unwrap_or(0);
    if depth >= 3 {
        patterns.push(format!("Deep decision hierarchy (depth {})", depth));
    }

    let levels: BTreeSet<DecisionLevel> = steps.iter().map(|s| s.decision_level).collect();
    if levels.len() == DecisionLevel::ALL.len() {
        patterns.push("Spans all four decision levels".to_string());
    }

    patterns
}

/// Number of steps from the root down to `step`, inclusive.
fn depth_of(trace: &ReasoningTrace, step: &ReasoningStep) -> usize {
    let mut depth = 1;
    let mut current = step;
    // Bounded by the step count; a validated trace has no cycles.
    while let Some(parent) = current.parent_step_id.as_deref().and_then(|id| trace.step(id)) {
        depth += 1;
        current = parent;
        if depth > trace.total_steps() {
            break;
        }
    }
    depth
}
