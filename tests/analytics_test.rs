//! Integration tests for the analytics engine
//!
//! Every test seeds a private in-memory store and runs the engine on top of
//! it through the `TraceStore` trait.

use std::sync::Arc;

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use reasoning_trace::analytics::{AnalyticsEngine, ComparisonMetric};
use reasoning_trace::config::AnalyticsConfig;
use reasoning_trace::error::StorageError;
use reasoning_trace::storage::{ScanOptions, SqliteTraceStore, TraceStore};
use reasoning_trace::trace::{DecisionLevel, ReasoningStep, ReasoningTrace, ReasoningType};

async fn setup(config: AnalyticsConfig) -> (Arc<SqliteTraceStore>, AnalyticsEngine) {
    let store = Arc::new(
        SqliteTraceStore::new_in_memory()
            .await
            .expect("Failed to create in-memory store"),
    );
    let engine = AnalyticsEngine::new(store.clone(), config);
    (store, engine)
}

fn step(level: DecisionLevel, kind: ReasoningType, point: &str, confidence: f64) -> ReasoningStep {
    ReasoningStep::new(level, kind, point).with_confidence(confidence)
}

/// Completed trace whose steps are all roots.
fn flat_trace(operation_type: &str, success: bool, steps: Vec<ReasoningStep>) -> ReasoningTrace {
    let mut trace = ReasoningTrace::new(operation_type);
    for step in steps {
        trace.add_step(step).unwrap();
    }
    let error = (!success).then(|| "operation failed".to_string());
    trace.complete_trace(success, error).unwrap();
    trace
}

// ============================================================================
// Single-trace analysis and comparison
// ============================================================================

#[cfg(test)]
mod trace_analysis_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_overconfident_failure_calibration() {
        let (store, engine) = setup(AnalyticsConfig::default()).await;
        let trace = flat_trace(
            "workflow_generation",
            false,
            vec![step(DecisionLevel::Agent, ReasoningType::WorkflowPlanning, "Plan", 0.95)],
        );
        store.store_trace(&trace).await.unwrap();

        let analysis = engine
            .analyze_trace(trace.trace_id())
            .await
            .unwrap()
            .expect("trace exists");
        assert!((analysis.confidence_calibration_score - 0.05).abs() < 1e-9);
        assert_eq!(analysis.total_steps, 1);
        assert!(!analysis.success);
    }

    #[tokio::test]
    async fn test_analyze_missing_trace() {
        let (_store, engine) = setup(AnalyticsConfig::default()).await;
        assert!(engine.analyze_trace("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compare_traces() {
        let (store, engine) = setup(AnalyticsConfig::default()).await;
        let high = flat_trace(
            "X",
            true,
            vec![step(DecisionLevel::Agent, ReasoningType::ModeSelection, "Mode", 0.9)
                .with_duration_ms(200.0)],
        );
        let low = flat_trace(
            "X",
            false,
            vec![step(DecisionLevel::Agent, ReasoningType::ModeSelection, "Mode", 0.5)],
        );
        store.store_trace(&high).await.unwrap();
        store.store_trace(&low).await.unwrap();

        let ids = vec![
            high.trace_id().to_string(),
            "missing".to_string(),
            low.trace_id().to_string(),
        ];
        let comparison = engine.compare_traces(&ids, None).await.unwrap();

        assert_eq!(
            comparison.trace_ids,
            vec![high.trace_id().to_string(), low.trace_id().to_string()]
        );
        assert_eq!(comparison.missing_trace_ids, vec!["missing".to_string()]);
        let metrics: Vec<ComparisonMetric> = comparison.metrics.iter().map(|m| m.metric).collect();
        assert_eq!(metrics, ComparisonMetric::DEFAULT.to_vec());

        let confidence = &comparison.metrics[0];
        assert_eq!(confidence.values.len(), 2);
        assert!((confidence.avg.unwrap() - 0.7).abs() < 1e-9);
        assert_eq!(confidence.min, Some(0.5));
        assert_eq!(confidence.max, Some(0.9));
        assert!((confidence.range.unwrap() - 0.4).abs() < 1e-9);

        // only one trace reports a duration
        let duration = &comparison.metrics[2];
        assert_eq!(duration.metric, ComparisonMetric::TotalDurationMs);
        assert_eq!(duration.values.len(), 1);
        assert_eq!(duration.range, Some(0.0));
    }

    #[tokio::test]
    async fn test_compare_selected_metrics() {
        let (store, engine) = setup(AnalyticsConfig::default()).await;
        let trace = flat_trace(
            "X",
            true,
            vec![step(DecisionLevel::Tool, ReasoningType::ToolSelection, "Tool", 0.6)],
        );
        store.store_trace(&trace).await.unwrap();

        let metrics = [ComparisonMetric::TotalSteps];
        let comparison = engine
            .compare_traces(&[trace.trace_id().to_string()], Some(&metrics[..]))
            .await
            .unwrap();
        assert_eq!(comparison.metrics.len(), 1);
        assert_eq!(comparison.metrics[0].avg, Some(1.0));
    }
}

// ============================================================================
// Pattern detection
// ============================================================================

#[cfg(test)]
mod pattern_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tool_steps() -> Vec<ReasoningStep> {
        vec![
            step(DecisionLevel::Tool, ReasoningType::ToolSelection, "Pick tool", 0.6)
                .with_context_value("query", "weather"),
            step(DecisionLevel::Tool, ReasoningType::ToolSelection, "Pick tool", 0.8)
                .with_context_value("query", "news"),
        ]
    }

    fn tool_trace(success: bool) -> ReasoningTrace {
        flat_trace("workflow_generation", success, tool_steps())
    }

    #[tokio::test]
    async fn test_frequency_floor() {
        let (store, engine) = setup(AnalyticsConfig::default()).await;
        store.store_trace(&tool_trace(true)).await.unwrap();
        store.store_trace(&tool_trace(true)).await.unwrap();

        let mut mixed = tool_steps();
        mixed.push(step(DecisionLevel::System, ReasoningType::Validation, "Check", 0.9));
        store
            .store_trace(&flat_trace("workflow_generation", false, mixed))
            .await
            .unwrap();

        let patterns = engine
            .detect_reasoning_patterns(None, 3, 7)
            .await
            .unwrap();

        assert_eq!(patterns.len(), 1);
        assert!(patterns.iter().all(|p| p.frequency >= 3));

        let pattern = &patterns[0];
        assert_eq!(pattern.pattern_id, "tool_selection:tool");
        assert_eq!(pattern.frequency, 6);
        assert_eq!(pattern.confidence_range, (0.6, 0.8));
        assert!((pattern.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((pattern.mean_confidence - 0.7).abs() < 1e-9);
        assert!((pattern.confidence_std_dev - 0.1).abs() < 1e-9);
        assert_eq!(pattern.example_step_ids.len(), 3);
        // two distinct contexts across six steps
        assert_eq!(pattern.example_contexts.len(), 2);
    }

    #[tokio::test]
    async fn test_operation_type_filter() {
        let (store, engine) = setup(AnalyticsConfig::default()).await;
        store.store_trace(&tool_trace(true)).await.unwrap();
        store
            .store_trace(&flat_trace(
                "chat",
                true,
                vec![step(DecisionLevel::Llm, ReasoningType::ReasoningChain, "Answer", 0.7)],
            ))
            .await
            .unwrap();

        let chat = engine
            .detect_reasoning_patterns(Some("chat"), 1, 7)
            .await
            .unwrap();
        assert_eq!(chat.len(), 1);
        assert_eq!(chat[0].decision_level, DecisionLevel::Llm);
    }

    #[tokio::test]
    async fn test_scan_pages_through_all_traces() {
        let config = AnalyticsConfig {
            scan_page_size: 2,
            ..AnalyticsConfig::default()
        };
        let (store, engine) = setup(config).await;
        for _ in 0..5 {
            store.store_trace(&tool_trace(true)).await.unwrap();
        }

        let patterns = engine
            .detect_reasoning_patterns(None, 1, 7)
            .await
            .unwrap();
        assert_eq!(patterns[0].frequency, 10);
    }

    #[tokio::test]
    async fn test_results_are_cached_until_invalidated() {
        let (store, engine) = setup(AnalyticsConfig::default()).await;
        store.store_trace(&tool_trace(true)).await.unwrap();

        let first = engine.detect_reasoning_patterns(None, 1, 7).await.unwrap();
        store.store_trace(&tool_trace(true)).await.unwrap();
        let cached = engine.detect_reasoning_patterns(None, 1, 7).await.unwrap();
        assert_eq!(cached, first);

        engine.invalidate_cache().await;
        let fresh = engine.detect_reasoning_patterns(None, 1, 7).await.unwrap();
        assert_eq!(fresh[0].frequency, 4);
    }

    #[tokio::test]
    async fn test_cancelled_scan() {
        let (store, engine) = setup(AnalyticsConfig::default()).await;
        store.store_trace(&tool_trace(true)).await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let err = engine
            .detect_reasoning_patterns_with(
                None,
                1,
                7,
                &ScanOptions::new().with_cancellation(token),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Cancelled { .. }));
    }
}

// ============================================================================
// Error patterns
// ============================================================================

#[cfg(test)]
mod error_pattern_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn failing_step(message: &str) -> ReasoningStep {
        step(DecisionLevel::Tool, ReasoningType::ToolSelection, "Call API", 0.5).with_error(message)
    }

    #[tokio::test]
    async fn test_groups_errors_of_failed_traces() {
        let (store, engine) = setup(AnalyticsConfig::default()).await;
        store
            .store_trace(&flat_trace(
                "X",
                false,
                vec![failing_step("timeout"), failing_step("rate limited")],
            ))
            .await
            .unwrap();
        store
            .store_trace(&flat_trace("X", false, vec![failing_step("timeout")]))
            .await
            .unwrap();
        // errors in successful traces are recovered and ignored
        store
            .store_trace(&flat_trace("X", true, vec![failing_step("timeout")]))
            .await
            .unwrap();
        store
            .store_trace(&flat_trace(
                "X",
                false,
                vec![step(DecisionLevel::Agent, ReasoningType::Validation, "Check", 0.5)
                    .with_error("invalid")],
            ))
            .await
            .unwrap();

        let patterns = engine.get_error_patterns(7, 2).await.unwrap();

        assert_eq!(patterns.len(), 1);
        let pattern = &patterns[0];
        assert_eq!(pattern.reasoning_type, ReasoningType::ToolSelection);
        assert_eq!(pattern.frequency, 3);
        assert_eq!(pattern.most_common_error.as_deref(), Some("timeout"));
        assert_eq!(pattern.affected_traces, 2);
        assert_eq!(pattern.examples.len(), 3);
    }
}

// ============================================================================
// Decision quality and calibration
// ============================================================================

#[cfg(test)]
mod quality_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_decision_quality() {
        let (store, engine) = setup(AnalyticsConfig::default()).await;
        store
            .store_trace(&flat_trace(
                "X",
                true,
                vec![
                    step(DecisionLevel::Tool, ReasoningType::ToolSelection, "Select SEARCH tool", 0.2)
                        .with_reasoning("search results were sparse")
                        .with_duration_ms(100.0),
                    step(DecisionLevel::Tool, ReasoningType::ToolSelection, "select search tool", 0.6)
                        .with_reasoning("search is cheap")
                        .with_option(json!("search"))
                        .with_option(json!("browse"))
                        .with_duration_ms(300.0),
                    step(DecisionLevel::Tool, ReasoningType::ToolSelection, "select search engine", 0.95)
                        .with_reasoning("the engine ranks well")
                        .with_error("quota"),
                    step(DecisionLevel::Tool, ReasoningType::ToolSelection, "Select calculator", 0.5),
                ],
            ))
            .await
            .unwrap();

        let analysis = engine
            .analyze_decision_quality("select search", 7)
            .await
            .unwrap();

        assert_eq!(analysis.total_decisions, 3);
        let counts: Vec<usize> = analysis
            .confidence_distribution
            .iter()
            .map(|b| b.count)
            .collect();
        assert_eq!(counts, vec![1, 0, 1, 0, 1]);
        assert!((analysis.mean_confidence.unwrap() - 0.5833333333).abs() < 1e-6);
        assert!((analysis.success_rate.unwrap() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(analysis.mean_duration_ms, Some(200.0));
        assert!((analysis.alternatives_rate.unwrap() - 1.0 / 3.0).abs() < 1e-9);
        assert!((analysis.mean_alternatives.unwrap() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(analysis.common_reasoning_terms[0].term, "search");
        assert_eq!(analysis.common_reasoning_terms[0].count, 2);
    }

    #[tokio::test]
    async fn test_decision_quality_without_matches() {
        let (_store, engine) = setup(AnalyticsConfig::default()).await;
        let analysis = engine.analyze_decision_quality("anything", 7).await.unwrap();
        assert_eq!(analysis.total_decisions, 0);
        assert!(analysis.mean_confidence.is_none());
        assert!(analysis.success_rate.is_none());
        assert_eq!(analysis.confidence_distribution.len(), 5);
        assert!(analysis.confidence_distribution.iter().all(|b| b.count == 0));
    }

    #[tokio::test]
    async fn test_calibration_buckets_cover_completed_traces() {
        let (store, engine) = setup(AnalyticsConfig::default()).await;
        let plan = |c| vec![step(DecisionLevel::Agent, ReasoningType::WorkflowPlanning, "Plan", c)];
        store.store_trace(&flat_trace("X", true, plan(0.95))).await.unwrap();
        store.store_trace(&flat_trace("X", false, plan(0.95))).await.unwrap();
        store.store_trace(&flat_trace("X", false, plan(0.2))).await.unwrap();

        let mut open = ReasoningTrace::new("X");
        open.add_step(step(DecisionLevel::Agent, ReasoningType::WorkflowPlanning, "Plan", 0.5))
            .unwrap();
        store.store_trace(&open).await.unwrap();

        let report = engine
            .analyze_confidence_calibration(Some("X"), 30)
            .await
            .unwrap();

        assert_eq!(report.total_traces, 3);
        assert_eq!(report.buckets.len(), 5);
        let bucket_total: usize = report.buckets.iter().map(|b| b.count).sum();
        assert_eq!(bucket_total, report.total_traces);

        let low = &report.buckets[0];
        assert_eq!(low.count, 1);
        assert_eq!(low.success_rate, Some(0.0));
        assert!((low.calibration_error.unwrap() - 0.2).abs() < 1e-9);

        let high = &report.buckets[4];
        assert_eq!(high.count, 2);
        assert_eq!(high.success_rate, Some(0.5));
        assert!((high.calibration_error.unwrap() - 0.45).abs() < 1e-9);

        assert!(report.buckets[2].calibration_error.is_none());
        let expected = (0.2 + 2.0 * 0.45) / 3.0;
        assert!((report.expected_calibration_error.unwrap() - expected).abs() < 1e-9);
        let overall = (0.7_f64 - 1.0 / 3.0).abs();
        assert!((report.overall_calibration_error.unwrap() - overall).abs() < 1e-9);
    }
}

// ============================================================================
// Similarity and decision chains
// ============================================================================

#[cfg(test)]
mod navigation_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_find_similar_decisions() {
        let (store, engine) = setup(AnalyticsConfig::default()).await;
        let reference =
            step(DecisionLevel::Tool, ReasoningType::ToolSelection, "select search tool", 0.8)
                .with_context_value("query", "a");
        let trace = flat_trace(
            "X",
            true,
            vec![
                reference.clone(),
                step(DecisionLevel::Tool, ReasoningType::ToolSelection, "select search tool", 0.8)
                    .with_context_value("query", "b"),
                step(DecisionLevel::Tool, ReasoningType::ToolSelection, "unrelated choice", 0.1),
                step(DecisionLevel::Agent, ReasoningType::ToolSelection, "select search tool", 0.8),
            ],
        );
        store.store_trace(&trace).await.unwrap();
        let reference = trace.step(&reference.step_id).unwrap().clone();

        let similar = engine
            .find_similar_decisions(&reference, 0.5, 10)
            .await
            .unwrap();

        assert_eq!(similar.len(), 2);
        assert!(similar.iter().all(|s| s.step.step_id != reference.step_id));
        assert!((similar[0].similarity - 1.0).abs() < 1e-9);
        assert_eq!(similar[0].step.decision_point, "select search tool");
        assert!(similar[0].similarity >= similar[1].similarity);

        let strict = engine
            .find_similar_decisions(&reference, 0.95, 10)
            .await
            .unwrap();
        assert_eq!(strict.len(), 1);

        let limited = engine
            .find_similar_decisions(&reference, 0.0, 1)
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_similar_ties_keep_most_recent_first() {
        let (store, engine) = setup(AnalyticsConfig::default()).await;
        let now = Utc::now();
        let twin = |id: &str, minutes_ago: i64| {
            step(DecisionLevel::Tool, ReasoningType::ToolSelection, "select search tool", 0.8)
                .with_id(id)
                .with_context_value("query", "q")
                .with_timestamp(now - Duration::minutes(minutes_ago))
        };
        let trace = flat_trace(
            "X",
            true,
            vec![
                twin("reference", 40),
                twin("older", 30),
                twin("newest", 10),
                twin("middle", 20),
            ],
        );
        store.store_trace(&trace).await.unwrap();
        let reference = trace.step("reference").unwrap().clone();

        let similar = engine
            .find_similar_decisions(&reference, 0.0, 10)
            .await
            .unwrap();

        let ids: Vec<&str> = similar.iter().map(|s| s.step.step_id.as_str()).collect();
        assert_eq!(ids, vec!["newest", "middle", "older"]);
        assert!(similar
            .iter()
            .all(|s| s.similarity == similar[0].similarity));

        // Only the two most recent candidates are scored.
        let capped = AnalyticsEngine::new(
            store.clone(),
            AnalyticsConfig {
                similarity_candidates: 2,
                ..AnalyticsConfig::default()
            },
        );
        let similar = capped
            .find_similar_decisions(&reference, 0.0, 10)
            .await
            .unwrap();
        let ids: Vec<&str> = similar.iter().map(|s| s.step.step_id.as_str()).collect();
        assert_eq!(ids, vec!["newest", "middle"]);
    }

    async fn seed_chain(store: &SqliteTraceStore) {
        let mut trace = ReasoningTrace::new("workflow_generation");
        trace
            .add_step(
                step(DecisionLevel::System, ReasoningType::WorkflowPlanning, "Plan the workflow", 0.9)
                    .with_id("root"),
            )
            .unwrap();
        trace
            .add_step(
                step(DecisionLevel::Agent, ReasoningType::ToolSelection, "Pick tool", 0.8)
                    .with_id("pick")
                    .with_parent("root"),
            )
            .unwrap();
        trace
            .add_step(
                step(DecisionLevel::Tool, ReasoningType::ParameterSelection, "Run tool", 0.7)
                    .with_id("run")
                    .with_parent("pick"),
            )
            .unwrap();
        trace
            .add_step(
                step(DecisionLevel::Agent, ReasoningType::Validation, "Validate", 0.85)
                    .with_id("validate")
                    .with_parent("root"),
            )
            .unwrap();
        trace.complete_trace(true, None).unwrap();
        store.store_trace(&trace).await.unwrap();
    }

    fn ids(chains: &[Vec<ReasoningStep>]) -> Vec<Vec<String>> {
        chains
            .iter()
            .map(|chain| chain.iter().map(|s| s.step_id.clone()).collect())
            .collect()
    }

    #[tokio::test]
    async fn test_chains_walk_children_depth_first() {
        let (store, engine) = setup(AnalyticsConfig::default()).await;
        seed_chain(&store).await;

        let chains = engine.find_decision_chains("PLAN", 5, 0.5).await.unwrap();
        assert_eq!(
            ids(&chains),
            vec![
                vec!["root".to_string(), "pick".to_string(), "run".to_string()],
                vec!["root".to_string(), "validate".to_string()],
            ]
        );
    }

    #[tokio::test]
    async fn test_chains_respect_depth_and_confidence() {
        let (store, engine) = setup(AnalyticsConfig::default()).await;
        seed_chain(&store).await;

        let shallow = engine.find_decision_chains("plan", 1, 0.5).await.unwrap();
        assert_eq!(
            ids(&shallow),
            vec![
                vec!["root".to_string(), "pick".to_string()],
                vec!["root".to_string(), "validate".to_string()],
            ]
        );

        let leaf = engine.find_decision_chains("run tool", 5, 0.5).await.unwrap();
        assert_eq!(ids(&leaf), vec![vec!["run".to_string()]]);

        let confident = engine.find_decision_chains("plan", 5, 0.95).await.unwrap();
        assert!(confident.is_empty());
    }
}
