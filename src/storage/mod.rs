//! Storage layer for reasoning trace persistence.
//!
//! This module defines the [`TraceStore`] contract, the filter types used by
//! its query primitives and the SQLite-backed implementation. Traces are
//! written atomically (trace row plus every step row, or nothing), read back
//! as fully wired hierarchies, and every public call is recorded into the
//! store's own `operation_metrics` table.

mod scan;
mod sqlite;

#[cfg(test)]
#[path = "types_tests.rs"]
mod types_tests;

pub use scan::ScanOptions;
pub use sqlite::SqliteTraceStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;
use crate::trace::{DecisionLevel, ReasoningStep, ReasoningTrace, ReasoningType};

/// Default page size for trace and step queries.
pub const DEFAULT_QUERY_LIMIT: u32 = 100;

/// Filters for [`TraceStore::query_traces`].
///
/// Results are ordered by `created_at`, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceQuery {
    /// Exact operation type.
    pub operation_type: Option<String>,
    /// Exact correlation id.
    pub operation_id: Option<String>,
    /// Exact session id.
    pub session_id: Option<String>,
    /// `Some(true)` for successful traces only, `Some(false)` for failed
    /// traces only, `None` for both.
    pub success: Option<bool>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`.
    pub until: Option<DateTime<Utc>>,
    /// Maximum number of traces returned.
    pub limit: u32,
    /// Number of matching traces skipped.
    pub offset: u32,
}

impl Default for TraceQuery {
    fn default() -> Self {
        Self {
            operation_type: None,
            operation_id: None,
            session_id: None,
            success: None,
            since: None,
            until: None,
            limit: DEFAULT_QUERY_LIMIT,
            offset: 0,
        }
    }
}

impl TraceQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operation_type(mut self, operation_type: impl Into<String>) -> Self {
        self.operation_type = Some(operation_type.into());
        self
    }

    pub fn operation_id(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn success(mut self, success: bool) -> Self {
        self.success = Some(success);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }
}

/// Filters for [`TraceStore::query_steps`].
///
/// Results are ordered by step `timestamp`, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct StepQuery {
    pub trace_id: Option<String>,
    pub decision_level: Option<DecisionLevel>,
    pub reasoning_type: Option<ReasoningType>,
    /// Minimum confidence score (inclusive).
    pub confidence_threshold: Option<f64>,
    /// Only steps with `error_occurred` set.
    pub errors_only: bool,
    /// Operation type of the owning trace.
    pub operation_type: Option<String>,
    /// Inclusive lower bound on the step timestamp.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on the step timestamp.
    pub until: Option<DateTime<Utc>>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for StepQuery {
    fn default() -> Self {
        Self {
            trace_id: None,
            decision_level: None,
            reasoning_type: None,
            confidence_threshold: None,
            errors_only: false,
            operation_type: None,
            since: None,
            until: None,
            limit: DEFAULT_QUERY_LIMIT,
            offset: 0,
        }
    }
}

impl StepQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn decision_level(mut self, level: DecisionLevel) -> Self {
        self.decision_level = Some(level);
        self
    }

    pub fn reasoning_type(mut self, reasoning_type: ReasoningType) -> Self {
        self.reasoning_type = Some(reasoning_type);
        self
    }

    pub fn confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = Some(threshold);
        self
    }

    pub fn errors_only(mut self) -> Self {
        self.errors_only = true;
        self
    }

    pub fn operation_type(mut self, operation_type: impl Into<String>) -> Self {
        self.operation_type = Some(operation_type.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }
}

/// Aggregate counts over the whole store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceStatistics {
    pub total_traces: u64,
    /// Completed traces that succeeded.
    pub successful_traces: u64,
    /// Completed traces that did not succeed.
    pub failed_traces: u64,
    /// Traces without `completed_at`; counted as neither success nor failure.
    pub in_progress_traces: u64,
    pub total_steps: u64,
    pub steps_by_level: BTreeMap<DecisionLevel, u64>,
    pub steps_by_type: BTreeMap<ReasoningType, u64>,
    /// Mean step confidence, absent when no steps are stored.
    pub mean_confidence: Option<f64>,
    pub error_steps: u64,
    /// Number of recorded store operations.
    pub total_operations: u64,
    /// Running average latency of recorded store operations.
    pub avg_operation_ms: Option<f64>,
}

/// Kind of store call recorded in `operation_metrics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    StoreTrace,
    GetTrace,
    QueryTraces,
    QuerySteps,
    GetStatistics,
    DeleteTrace,
    CleanupOldTraces,
    GetOperationMetrics,
    HealthCheck,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::StoreTrace => "store_trace",
            OperationKind::GetTrace => "get_trace",
            OperationKind::QueryTraces => "query_traces",
            OperationKind::QuerySteps => "query_steps",
            OperationKind::GetStatistics => "get_statistics",
            OperationKind::DeleteTrace => "delete_trace",
            OperationKind::CleanupOldTraces => "cleanup_old_traces",
            OperationKind::GetOperationMetrics => "get_operation_metrics",
            OperationKind::HealthCheck => "health_check",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry of the store's self-observability log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationMetric {
    pub timestamp: DateTime<Utc>,
    pub operation_kind: String,
    pub execution_time_ms: f64,
    pub rows_affected: u64,
    pub success: bool,
    pub error_message: Option<String>,
}

/// Durable trace persistence.
///
/// Implementations must be safe to call concurrently. Writes are atomic:
/// a failed `store_trace` or `delete_trace` leaves no partial state behind.
/// Absent records are reported as `Ok(None)`, `Ok(false)` or an empty list;
/// `Err` always means the store itself failed.
#[async_trait]
pub trait TraceStore: Send + Sync {
    /// Insert or fully replace a trace and all of its steps.
    async fn store_trace(&self, trace: &ReasoningTrace) -> StorageResult<()>;

    /// Load a trace with its complete step hierarchy.
    async fn get_trace(&self, trace_id: &str) -> StorageResult<Option<ReasoningTrace>>;

    /// Load every trace matching the filters.
    async fn query_traces(&self, query: &TraceQuery) -> StorageResult<Vec<ReasoningTrace>>;

    /// Search steps across all traces.
    async fn query_steps(&self, query: &StepQuery) -> StorageResult<Vec<ReasoningStep>>;

    /// Aggregate counts over the store.
    async fn get_statistics(&self) -> StorageResult<TraceStatistics>;

    /// Delete a trace and its steps. Returns whether the trace existed.
    async fn delete_trace(&self, trace_id: &str) -> StorageResult<bool>;

    /// Delete completed traces created more than `older_than_days` ago.
    ///
    /// In-progress traces are never removed. Deletion proceeds page by page;
    /// pages already removed stay removed if the scan is cancelled.
    async fn cleanup_old_traces(
        &self,
        older_than_days: u32,
        options: &ScanOptions,
    ) -> StorageResult<u64>;

    /// Most recent self-observability records, newest first.
    async fn get_operation_metrics(&self, limit: u32) -> StorageResult<Vec<OperationMetric>>;

    /// Verify the store is reachable.
    async fn health_check(&self) -> StorageResult<()>;
}
