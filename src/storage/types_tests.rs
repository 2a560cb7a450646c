//! Unit tests for storage query and statistics types.

use super::*;
use chrono::Duration;
use serde_json::json;

// ============================================================================
// TraceQuery tests
// ============================================================================

#[test]
fn test_trace_query_defaults() {
    let query = TraceQuery::new();
    assert!(query.operation_type.is_none());
    assert!(query.success.is_none());
    assert_eq!(query.limit, DEFAULT_QUERY_LIMIT);
    assert_eq!(query.offset, 0);
}

#[test]
fn test_trace_query_builder_chain() {
    let since = Utc::now() - Duration::days(7);
    let query = TraceQuery::new()
        .operation_type("workflow_generation")
        .operation_id("op-1")
        .session_id("sess-1")
        .success(false)
        .since(since)
        .limit(10)
        .offset(20);

    assert_eq!(query.operation_type.as_deref(), Some("workflow_generation"));
    assert_eq!(query.operation_id.as_deref(), Some("op-1"));
    assert_eq!(query.session_id.as_deref(), Some("sess-1"));
    assert_eq!(query.success, Some(false));
    assert_eq!(query.since, Some(since));
    assert!(query.until.is_none());
    assert_eq!(query.limit, 10);
    assert_eq!(query.offset, 20);
}

// ============================================================================
// StepQuery tests
// ============================================================================

#[test]
fn test_step_query_defaults() {
    let query = StepQuery::new();
    assert!(query.trace_id.is_none());
    assert!(!query.errors_only);
    assert_eq!(query.limit, DEFAULT_QUERY_LIMIT);
}

#[test]
fn test_step_query_builder_chain() {
    let query = StepQuery::new()
        .trace_id("t-1")
        .decision_level(DecisionLevel::Tool)
        .reasoning_type(ReasoningType::ErrorHandling)
        .confidence_threshold(0.6)
        .errors_only()
        .operation_type("workflow_generation")
        .limit(5);

    assert_eq!(query.trace_id.as_deref(), Some("t-1"));
    assert_eq!(query.decision_level, Some(DecisionLevel::Tool));
    assert_eq!(query.reasoning_type, Some(ReasoningType::ErrorHandling));
    assert_eq!(query.confidence_threshold, Some(0.6));
    assert!(query.errors_only);
    assert_eq!(query.operation_type.as_deref(), Some("workflow_generation"));
    assert_eq!(query.limit, 5);
}

// ============================================================================
// OperationKind tests
// ============================================================================

#[test]
fn test_operation_kind_names() {
    assert_eq!(OperationKind::StoreTrace.as_str(), "store_trace");
    assert_eq!(OperationKind::CleanupOldTraces.to_string(), "cleanup_old_traces");
    assert_eq!(
        serde_json::to_value(OperationKind::QuerySteps).unwrap(),
        json!("query_steps")
    );
}

// ============================================================================
// TraceStatistics tests
// ============================================================================

#[test]
fn test_statistics_serialize_enum_keys() {
    let mut stats = TraceStatistics::default();
    stats.steps_by_level.insert(DecisionLevel::Agent, 3);
    stats.steps_by_type.insert(ReasoningType::ToolSelection, 2);

    let value = serde_json::to_value(&stats).unwrap();
    assert_eq!(value["steps_by_level"]["agent"], json!(3));
    assert_eq!(value["steps_by_type"]["tool_selection"], json!(2));
    assert!(value["mean_confidence"].is_null());
}
