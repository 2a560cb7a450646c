//! Result types produced by the analytics engine.
//!
//! Every type here is plain data and serializes to JSON for reporting.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::trace::{DecisionLevel, ReasoningStep, ReasoningType};

// ============================================================================
// Similarity
// ============================================================================

/// A stored decision resembling a reference decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarDecision {
    pub step: ReasoningStep,
    /// Weighted similarity in `[0, 1]`.
    pub similarity: f64,
}

// ============================================================================
// Patterns
// ============================================================================

/// A recurring `(reasoning_type, decision_level)` combination.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReasoningPattern {
    /// Stable key, `"{reasoning_type}:{decision_level}"`.
    pub pattern_id: String,
    pub reasoning_type: ReasoningType,
    pub decision_level: DecisionLevel,
    /// Number of steps in the group.
    pub frequency: usize,
    /// `(min, max)` confidence observed.
    pub confidence_range: (f64, f64),
    /// Up to five distinct serialized step contexts.
    pub example_contexts: Vec<String>,
    /// Up to three step ids.
    pub example_step_ids: Vec<String>,
    /// Fraction of distinct owning traces that succeeded.
    pub success_rate: f64,
    pub mean_confidence: f64,
    pub confidence_std_dev: f64,
}

/// Recurring failures among failed traces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorPattern {
    pub reasoning_type: ReasoningType,
    pub decision_level: DecisionLevel,
    /// Number of error steps in the group.
    pub frequency: usize,
    /// Most frequent exact error message; ties go to the message seen first.
    pub most_common_error: Option<String>,
    /// Distinct traces contributing to the group.
    pub affected_traces: usize,
    /// Up to five example records.
    pub examples: Vec<ErrorExample>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorExample {
    pub trace_id: String,
    pub step_id: String,
    pub decision_point: String,
    pub error_message: Option<String>,
    pub confidence_score: f64,
}

// ============================================================================
// Decision quality and calibration
// ============================================================================

/// Count of decisions falling in one confidence bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfidenceBucket {
    pub range: String,
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
}

/// A frequent reasoning term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TermFrequency {
    pub term: String,
    pub count: usize,
}

/// Quality report for decisions whose decision point matches a substring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionAnalysis {
    pub decision_point_query: String,
    pub lookback_days: u32,
    pub total_decisions: usize,
    pub mean_confidence: Option<f64>,
    /// Always five buckets, lowest first.
    pub confidence_distribution: Vec<ConfidenceBucket>,
    /// `(count - error_count) / count`.
    pub success_rate: Option<f64>,
    /// Mean over decisions that report a duration.
    pub mean_duration_ms: Option<f64>,
    /// Fraction of decisions that listed at least one alternative.
    pub alternatives_rate: Option<f64>,
    pub mean_alternatives: Option<f64>,
    pub common_reasoning_terms: Vec<TermFrequency>,
}

/// One confidence bucket of a calibration report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationBucket {
    pub range: String,
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
    pub mean_confidence: Option<f64>,
    pub success_rate: Option<f64>,
    /// `|mean_confidence - success_rate|`, absent for empty buckets.
    pub calibration_error: Option<f64>,
}

/// Agreement between stated trace confidence and actual outcomes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationReport {
    pub operation_type: Option<String>,
    pub lookback_days: u32,
    /// Completed traces in scope; equals the sum of bucket counts.
    pub total_traces: usize,
    /// Always five buckets, lowest first.
    pub buckets: Vec<CalibrationBucket>,
    /// `|mean confidence - success rate|` over every trace in scope.
    pub overall_calibration_error: Option<f64>,
    /// Bucket errors weighted by bucket size.
    pub expected_calibration_error: Option<f64>,
}

// ============================================================================
// Single-trace analysis
// ============================================================================

/// Problem detected in a single trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceIssue {
    /// Decisions with confidence below 0.3.
    LowConfidence { count: usize },
    /// Decisions recorded without reasoning text.
    MissingReasoning { count: usize },
    /// Decisions that hit an error.
    Errors { count: usize },
    /// More than half of all decisions took under 100ms.
    RushedDecisions { count: usize },
}

impl fmt::Display for TraceIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceIssue::LowConfidence { count } => {
                write!(f, "{} decision(s) with low confidence (< 0.3)", count)
            }
            TraceIssue::MissingReasoning { count } => {
                write!(f, "{} decision(s) missing reasoning text", count)
            }
            TraceIssue::Errors { count } => write!(f, "{} decision(s) encountered errors", count),
            TraceIssue::RushedDecisions { count } => {
                write!(f, "{} decision(s) completed in under 100ms", count)
            }
        }
    }
}

/// Deep report on one trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceAnalysis {
    pub trace_id: String,
    pub operation_type: String,
    pub total_steps: usize,
    pub success: bool,
    pub overall_confidence: f64,
    pub total_duration_ms: Option<f64>,
    pub steps_by_level: BTreeMap<DecisionLevel, usize>,
    pub steps_by_type: BTreeMap<ReasoningType, usize>,
    /// Step confidences in insertion order.
    pub confidence_progression: Vec<f64>,
    /// Decision points in insertion order.
    pub decision_path: Vec<String>,
    pub reasoning_quality_score: f64,
    pub decision_consistency_score: f64,
    pub confidence_calibration_score: f64,
    pub issues: Vec<TraceIssue>,
    pub patterns: Vec<String>,
    pub suggestions: Vec<String>,
}

// ============================================================================
// Comparison
// ============================================================================

/// Metric compared across traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonMetric {
    OverallConfidence,
    /// 1.0 for success, 0.0 for failure.
    Success,
    TotalDurationMs,
    TotalSteps,
    ReasoningQualityScore,
    DecisionConsistencyScore,
    ConfidenceCalibrationScore,
}

impl ComparisonMetric {
    /// Metrics compared when the caller names none.
    pub const DEFAULT: [ComparisonMetric; 5] = [
        ComparisonMetric::OverallConfidence,
        ComparisonMetric::Success,
        ComparisonMetric::TotalDurationMs,
        ComparisonMetric::ReasoningQualityScore,
        ComparisonMetric::DecisionConsistencyScore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonMetric::OverallConfidence => "overall_confidence",
            ComparisonMetric::Success => "success",
            ComparisonMetric::TotalDurationMs => "total_duration_ms",
            ComparisonMetric::TotalSteps => "total_steps",
            ComparisonMetric::ReasoningQualityScore => "reasoning_quality_score",
            ComparisonMetric::DecisionConsistencyScore => "decision_consistency_score",
            ComparisonMetric::ConfidenceCalibrationScore => "confidence_calibration_score",
        }
    }

    /// Value of this metric in an analysis, absent when the trace does not
    /// report it.
    pub fn value_of(&self, analysis: &TraceAnalysis) -> Option<f64> {
        match self {
            ComparisonMetric::OverallConfidence => Some(analysis.overall_confidence),
            ComparisonMetric::Success => Some(if analysis.success { 1.0 } else { 0.0 }),
            ComparisonMetric::TotalDurationMs => analysis.total_duration_ms,
            ComparisonMetric::TotalSteps => Some(analysis.total_steps as f64),
            ComparisonMetric::ReasoningQualityScore => Some(analysis.reasoning_quality_score),
            ComparisonMetric::DecisionConsistencyScore => {
                Some(analysis.decision_consistency_score)
            }
            ComparisonMetric::ConfidenceCalibrationScore => {
                Some(analysis.confidence_calibration_score)
            }
        }
    }
}

impl fmt::Display for ComparisonMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ComparisonMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "overall_confidence" => Ok(ComparisonMetric::OverallConfidence),
            "success" => Ok(ComparisonMetric::Success),
            "total_duration_ms" => Ok(ComparisonMetric::TotalDurationMs),
            "total_steps" => Ok(ComparisonMetric::TotalSteps),
            "reasoning_quality_score" => Ok(ComparisonMetric::ReasoningQualityScore),
            "decision_consistency_score" => Ok(ComparisonMetric::DecisionConsistencyScore),
            "confidence_calibration_score" => Ok(ComparisonMetric::ConfidenceCalibrationScore),
            other => Err(format!("Unknown comparison metric: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricValue {
    pub trace_id: String,
    pub value: f64,
}

/// One metric across the compared traces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricComparison {
    pub metric: ComparisonMetric,
    /// Values in the order the traces were requested; traces that do not
    /// report the metric are skipped.
    pub values: Vec<MetricValue>,
    pub avg: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub range: Option<f64>,
}

/// Side-by-side comparison of several traces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceComparison {
    /// Traces found and compared, in request order.
    pub trace_ids: Vec<String>,
    /// Requested traces that do not exist.
    pub missing_trace_ids: Vec<String>,
    pub metrics: Vec<MetricComparison>,
}
