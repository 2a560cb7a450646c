use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    OperationKind, OperationMetric, ScanOptions, StepQuery, TraceQuery, TraceStatistics,
    TraceStore,
};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};
use crate::trace::{DecisionLevel, Payload, ReasoningStep, ReasoningTrace, ReasoningType, TraceHeader};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const TRACE_COLUMNS: &str = "trace_id, created_at, operation_type, operation_id, session_id, \
     root_step_ids, success, initial_context, final_outputs, metadata, completed_at, error_message";

const STEP_COLUMNS: &str = "s.step_id, s.trace_id, s.timestamp, s.decision_level, \
     s.reasoning_type, s.decision_point, s.context, s.options_considered, s.decision_made, \
     s.reasoning_text, s.confidence_score, s.parent_step_id, s.child_step_ids, s.duration_ms, \
     s.metadata, s.error_occurred, s.error_message";

/// SQLite-backed trace store.
///
/// Reads go through the connection pool and may run concurrently (WAL mode
/// for file databases). Every write transaction is serialized through a
/// single async mutex.
#[derive(Clone)]
pub struct SqliteTraceStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl SqliteTraceStore {
    /// Open (creating if needed) a file-backed store and apply migrations.
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                    message: format!("Failed to create database directory: {}", e),
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout())
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let store = Self::from_pool(pool);
        store.run_migrations().await?;
        info!(path = %config.path.display(), "Trace store opened");

        Ok(store)
    }

    /// Create a private in-memory store, mainly for tests.
    ///
    /// The pool pins a single connection for its whole lifetime; an
    /// in-memory database disappears with its connection.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let store = Self::from_pool(pool);
        store.run_migrations().await?;
        Ok(store)
    }

    fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running trace store migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Trace store migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ========================================================================
    // Self-observability
    // ========================================================================

    async fn record_operation(
        &self,
        kind: OperationKind,
        started: Instant,
        rows_affected: u64,
        error: Option<String>,
    ) {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let result = sqlx::query(
            r#"
            INSERT INTO operation_metrics
                (timestamp, operation_kind, execution_time_ms, rows_affected, success, error_message)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(format_timestamp(Utc::now()))
        .bind(kind.as_str())
        .bind(elapsed_ms)
        .bind(rows_affected as i64)
        .bind(error.is_none())
        .bind(&error)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(operation = %kind, error = %e, "Failed to record operation metric");
        }
    }

    /// Record the outcome of a public call and hand the result back.
    async fn instrumented<T>(
        &self,
        kind: OperationKind,
        started: Instant,
        result: StorageResult<T>,
        rows_of: fn(&T) -> u64,
    ) -> StorageResult<T> {
        let (rows, error) = match &result {
            Ok(value) => (rows_of(value), None),
            Err(e) => {
                let processed = match e {
                    StorageError::Cancelled { processed } => *processed,
                    _ => 0,
                };
                (processed, Some(e.to_string()))
            }
        };
        self.record_operation(kind, started, rows, error).await;
        result
    }

    // ========================================================================
    // Writes
    // ========================================================================

    async fn write_trace(&self, trace: &ReasoningTrace) -> StorageResult<u64> {
        trace.validate()?;

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        match write_trace_rows(&mut *tx, trace).await {
            Ok(rows) => {
                tx.commit().await?;
                debug!(trace_id = %trace.trace_id(), steps = trace.total_steps(), "Trace stored");
                Ok(rows)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                warn!(trace_id = %trace.trace_id(), error = %e, "Trace write rolled back");
                Err(e)
            }
        }
    }

    async fn remove_traces(&self, trace_ids: &[String]) -> StorageResult<u64> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let mut removed = 0u64;
        for trace_id in trace_ids {
            match delete_trace_rows(&mut *tx, trace_id).await {
                Ok(deleted) => {
                    if deleted {
                        removed += 1;
                    }
                }
                Err(e) => {
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(error = %rollback_err, "Rollback failed");
                    }
                    warn!(trace_id = %trace_id, error = %e, "Trace delete rolled back");
                    return Err(e);
                }
            }
        }

        tx.commit().await?;
        Ok(removed)
    }

    async fn purge_completed_before(
        &self,
        cutoff: DateTime<Utc>,
        options: &ScanOptions,
    ) -> StorageResult<u64> {
        let cutoff = format_timestamp(cutoff);
        let page_size = options.page_size();
        let started = Instant::now();
        let mut deleted = 0u64;

        loop {
            options.check(started, deleted)?;

            let page: Vec<String> = sqlx::query_scalar(
                r#"
                SELECT trace_id FROM traces
                WHERE completed_at IS NOT NULL AND created_at < ?
                ORDER BY created_at ASC
                LIMIT ?
                "#,
            )
            .bind(&cutoff)
            .bind(page_size as i64)
            .fetch_all(&self.pool)
            .await?;

            if page.is_empty() {
                break;
            }

            deleted += self.remove_traces(&page).await?;
            debug!(page = page.len(), deleted, "Retention page removed");

            if page.len() < page_size as usize {
                break;
            }
        }

        Ok(deleted)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    async fn load_trace(&self, trace_id: &str) -> StorageResult<Option<ReasoningTrace>> {
        // One read transaction so the trace row and its steps come from the
        // same snapshot.
        let mut tx = self.pool.begin().await?;
        let trace = fetch_trace(&mut *tx, trace_id).await?;
        tx.commit().await?;
        Ok(trace)
    }

    async fn load_traces(&self, query: &TraceQuery) -> StorageResult<Vec<ReasoningTrace>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT trace_id FROM traces WHERE 1 = 1");

        if let Some(operation_type) = &query.operation_type {
            qb.push(" AND operation_type = ").push_bind(operation_type.as_str());
        }
        if let Some(operation_id) = &query.operation_id {
            qb.push(" AND operation_id = ").push_bind(operation_id.as_str());
        }
        if let Some(session_id) = &query.session_id {
            qb.push(" AND session_id = ").push_bind(session_id.as_str());
        }
        if let Some(success) = query.success {
            qb.push(" AND success = ").push_bind(success);
        }
        if let Some(since) = query.since {
            qb.push(" AND created_at >= ").push_bind(format_timestamp(since));
        }
        if let Some(until) = query.until {
            qb.push(" AND created_at < ").push_bind(format_timestamp(until));
        }
        qb.push(" ORDER BY created_at DESC, trace_id ASC LIMIT ")
            .push_bind(query.limit as i64)
            .push(" OFFSET ")
            .push_bind(query.offset as i64);

        let ids: Vec<String> = qb.build_query_scalar().fetch_all(&self.pool).await?;

        let mut traces = Vec::with_capacity(ids.len());
        for trace_id in ids {
            // A concurrent delete between the id scan and the load is a miss,
            // not an error.
            if let Some(trace) = self.load_trace(&trace_id).await? {
                traces.push(trace);
            }
        }
        Ok(traces)
    }

    async fn load_steps(&self, query: &StepQuery) -> StorageResult<Vec<ReasoningStep>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT ");
        qb.push(STEP_COLUMNS).push(" FROM steps s");
        if query.operation_type.is_some() {
            qb.push(" JOIN traces t ON t.trace_id = s.trace_id");
        }
        qb.push(" WHERE 1 = 1");

        if let Some(trace_id) = &query.trace_id {
            qb.push(" AND s.trace_id = ").push_bind(trace_id.as_str());
        }
        if let Some(level) = query.decision_level {
            qb.push(" AND s.decision_level = ").push_bind(level.as_str());
        }
        if let Some(reasoning_type) = query.reasoning_type {
            qb.push(" AND s.reasoning_type = ").push_bind(reasoning_type.as_str());
        }
        if let Some(threshold) = query.confidence_threshold {
            qb.push(" AND s.confidence_score >= ").push_bind(threshold);
        }
        if query.errors_only {
            qb.push(" AND s.error_occurred = 1");
        }
        if let Some(operation_type) = &query.operation_type {
            qb.push(" AND t.operation_type = ").push_bind(operation_type.as_str());
        }
        if let Some(since) = query.since {
            qb.push(" AND s.timestamp >= ").push_bind(format_timestamp(since));
        }
        if let Some(until) = query.until {
            qb.push(" AND s.timestamp < ").push_bind(format_timestamp(until));
        }
        qb.push(" ORDER BY s.timestamp DESC, s.step_id ASC LIMIT ")
            .push_bind(query.limit as i64)
            .push(" OFFSET ")
            .push_bind(query.offset as i64);

        let rows: Vec<StepRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(ReasoningStep::try_from).collect()
    }

    async fn compute_statistics(&self) -> StorageResult<TraceStatistics> {
        let mut tx = self.pool.begin().await?;

        let (total_traces, successful_traces, failed_traces, in_progress_traces): (
            i64,
            i64,
            i64,
            i64,
        ) = sqlx::query_as(
            "SELECT COUNT(*), \
                    COALESCE(SUM(completed_at IS NOT NULL AND success = 1), 0), \
                    COALESCE(SUM(completed_at IS NOT NULL AND success = 0), 0), \
                    COALESCE(SUM(completed_at IS NULL), 0) \
             FROM traces",
        )
        .fetch_one(&mut *tx)
        .await?;

        let (total_steps, mean_confidence, error_steps): (i64, Option<f64>, i64) = sqlx::query_as(
            "SELECT COUNT(*), AVG(confidence_score), COALESCE(SUM(error_occurred), 0) FROM steps",
        )
        .fetch_one(&mut *tx)
        .await?;

        let by_level: Vec<(String, i64)> = sqlx::query_as(
            "SELECT decision_level, COUNT(*) FROM steps GROUP BY decision_level",
        )
        .fetch_all(&mut *tx)
        .await?;

        let by_type: Vec<(String, i64)> = sqlx::query_as(
            "SELECT reasoning_type, COUNT(*) FROM steps GROUP BY reasoning_type",
        )
        .fetch_all(&mut *tx)
        .await?;

        let (total_operations, avg_operation_ms): (i64, Option<f64>) = sqlx::query_as(
            "SELECT COUNT(*), AVG(execution_time_ms) FROM operation_metrics",
        )
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut stats = TraceStatistics {
            total_traces: total_traces as u64,
            successful_traces: successful_traces as u64,
            failed_traces: failed_traces as u64,
            in_progress_traces: in_progress_traces as u64,
            total_steps: total_steps as u64,
            mean_confidence,
            error_steps: error_steps as u64,
            total_operations: total_operations as u64,
            avg_operation_ms,
            ..TraceStatistics::default()
        };
        for (level, count) in by_level {
            stats
                .steps_by_level
                .insert(parse_column::<DecisionLevel>("decision_level", &level)?, count as u64);
        }
        for (reasoning_type, count) in by_type {
            stats.steps_by_type.insert(
                parse_column::<ReasoningType>("reasoning_type", &reasoning_type)?,
                count as u64,
            );
        }
        Ok(stats)
    }
}

#[async_trait]
impl TraceStore for SqliteTraceStore {
    async fn store_trace(&self, trace: &ReasoningTrace) -> StorageResult<()> {
        let started = Instant::now();
        let result = self.write_trace(trace).await;
        self.instrumented(OperationKind::StoreTrace, started, result, |rows| *rows)
            .await
            .map(|_| ())
    }

    async fn get_trace(&self, trace_id: &str) -> StorageResult<Option<ReasoningTrace>> {
        let started = Instant::now();
        let result = self.load_trace(trace_id).await;
        self.instrumented(OperationKind::GetTrace, started, result, |trace| {
            trace.as_ref().map(|t| 1 + t.total_steps() as u64).unwrap_or(0)
        })
        .await
    }

    async fn query_traces(&self, query: &TraceQuery) -> StorageResult<Vec<ReasoningTrace>> {
        let started = Instant::now();
        let result = self.load_traces(query).await;
        self.instrumented(OperationKind::QueryTraces, started, result, |traces| {
            traces.len() as u64
        })
        .await
    }

    async fn query_steps(&self, query: &StepQuery) -> StorageResult<Vec<ReasoningStep>> {
        let started = Instant::now();
        let result = self.load_steps(query).await;
        self.instrumented(OperationKind::QuerySteps, started, result, |steps| {
            steps.len() as u64
        })
        .await
    }

    async fn get_statistics(&self) -> StorageResult<TraceStatistics> {
        let started = Instant::now();
        let result = self.compute_statistics().await;
        self.instrumented(OperationKind::GetStatistics, started, result, |_| 0)
            .await
    }

    async fn delete_trace(&self, trace_id: &str) -> StorageResult<bool> {
        let started = Instant::now();
        let result = self
            .remove_traces(&[trace_id.to_string()])
            .await
            .map(|removed| removed > 0);
        if let Ok(true) = result {
            debug!(trace_id = %trace_id, "Trace deleted");
        }
        self.instrumented(OperationKind::DeleteTrace, started, result, |deleted| {
            u64::from(*deleted)
        })
        .await
    }

    async fn cleanup_old_traces(
        &self,
        older_than_days: u32,
        options: &ScanOptions,
    ) -> StorageResult<u64> {
        let started = Instant::now();
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(older_than_days));
        let result = self.purge_completed_before(cutoff, options).await;
        match &result {
            Ok(deleted) => info!(deleted, older_than_days, "Retention cleanup finished"),
            Err(e) => warn!(older_than_days, error = %e, "Retention cleanup stopped"),
        }
        self.instrumented(OperationKind::CleanupOldTraces, started, result, |deleted| {
            *deleted
        })
        .await
    }

    async fn get_operation_metrics(&self, limit: u32) -> StorageResult<Vec<OperationMetric>> {
        let started = Instant::now();
        let result = async {
            let rows: Vec<OperationMetricRow> = sqlx::query_as(
                r#"
                SELECT timestamp, operation_kind, execution_time_ms, rows_affected, success, error_message
                FROM operation_metrics
                ORDER BY id DESC
                LIMIT ?
                "#,
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter()
                .map(OperationMetric::try_from)
                .collect::<StorageResult<Vec<_>>>()
        }
        .await;
        self.instrumented(OperationKind::GetOperationMetrics, started, result, |metrics| {
            metrics.len() as u64
        })
        .await
    }

    async fn health_check(&self) -> StorageResult<()> {
        let started = Instant::now();
        let result = sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(StorageError::from);
        self.instrumented(OperationKind::HealthCheck, started, result, |_| 0)
            .await
    }
}

// ============================================================================
// Row-level helpers
// ============================================================================

/// Fixed-width RFC 3339 UTC so lexical order equals chronological order.
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(column: &str, value: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization {
            message: format!("Invalid timestamp in {}: {} ({})", column, value, e),
        })
}

fn parse_column<T: FromStr<Err = String>>(column: &str, value: &str) -> StorageResult<T> {
    value.parse().map_err(|e: String| StorageError::Serialization {
        message: format!("Invalid {}: {}", column, e),
    })
}

fn parse_payload(column: &str, value: &str) -> StorageResult<Payload> {
    serde_json::from_str(value).map_err(|e| StorageError::Serialization {
        message: format!("Invalid JSON in {}: {}", column, e),
    })
}

fn parse_id_list(column: &str, value: &str) -> StorageResult<Vec<String>> {
    serde_json::from_str(value).map_err(|e| StorageError::Serialization {
        message: format!("Invalid id list in {}: {}", column, e),
    })
}

async fn write_trace_rows(conn: &mut SqliteConnection, trace: &ReasoningTrace) -> StorageResult<u64> {
    sqlx::query(
        r#"
        INSERT INTO traces (
            trace_id, created_at, operation_type, operation_id, session_id,
            root_step_ids, total_steps, total_duration_ms, overall_confidence, success,
            initial_context, final_outputs, metadata, completed_at, error_message
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(trace_id) DO UPDATE SET
            created_at = excluded.created_at,
            operation_type = excluded.operation_type,
            operation_id = excluded.operation_id,
            session_id = excluded.session_id,
            root_step_ids = excluded.root_step_ids,
            total_steps = excluded.total_steps,
            total_duration_ms = excluded.total_duration_ms,
            overall_confidence = excluded.overall_confidence,
            success = excluded.success,
            initial_context = excluded.initial_context,
            final_outputs = excluded.final_outputs,
            metadata = excluded.metadata,
            completed_at = excluded.completed_at,
            error_message = excluded.error_message
        "#,
    )
    .bind(trace.trace_id())
    .bind(format_timestamp(trace.created_at()))
    .bind(trace.operation_type())
    .bind(trace.operation_id())
    .bind(trace.session_id())
    .bind(serde_json::to_string(trace.root_step_ids())?)
    .bind(trace.total_steps() as i64)
    .bind(trace.total_duration_ms())
    .bind(trace.overall_confidence())
    .bind(trace.success())
    .bind(serde_json::to_string(&trace.initial_context)?)
    .bind(serde_json::to_string(&trace.final_outputs)?)
    .bind(serde_json::to_string(&trace.metadata)?)
    .bind(trace.completed_at().map(format_timestamp))
    .bind(trace.error_message())
    .execute(&mut *conn)
    .await?;

    // Full replacement: steps dropped from the trace must not linger.
    sqlx::query("DELETE FROM steps WHERE trace_id = ?")
        .bind(trace.trace_id())
        .execute(&mut *conn)
        .await?;

    let mut rows = 1u64;
    for (index, step) in trace.steps().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO steps (
                step_id, trace_id, step_index, timestamp, decision_level, reasoning_type,
                decision_point, context, options_considered, decision_made, reasoning_text,
                confidence_score, parent_step_id, child_step_ids, duration_ms, metadata,
                error_occurred, error_message
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&step.step_id)
        .bind(trace.trace_id())
        .bind(index as i64)
        .bind(format_timestamp(step.timestamp))
        .bind(step.decision_level.as_str())
        .bind(step.reasoning_type.as_str())
        .bind(&step.decision_point)
        .bind(serde_json::to_string(&step.context)?)
        .bind(serde_json::to_string(&step.options_considered)?)
        .bind(serde_json::to_string(&step.decision_made)?)
        .bind(&step.reasoning_text)
        .bind(step.confidence_score)
        .bind(&step.parent_step_id)
        .bind(serde_json::to_string(&step.child_step_ids)?)
        .bind(step.duration_ms)
        .bind(serde_json::to_string(&step.metadata)?)
        .bind(step.error_occurred)
        .bind(&step.error_message)
        .execute(&mut *conn)
        .await?;
        rows += 1;
    }

    Ok(rows)
}

async fn delete_trace_rows(conn: &mut SqliteConnection, trace_id: &str) -> StorageResult<bool> {
    sqlx::query("DELETE FROM steps WHERE trace_id = ?")
        .bind(trace_id)
        .execute(&mut *conn)
        .await?;

    let result = sqlx::query("DELETE FROM traces WHERE trace_id = ?")
        .bind(trace_id)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected() > 0)
}

async fn fetch_trace(
    conn: &mut SqliteConnection,
    trace_id: &str,
) -> StorageResult<Option<ReasoningTrace>> {
    let row: Option<TraceRow> = sqlx::query_as(&format!(
        "SELECT {} FROM traces WHERE trace_id = ?",
        TRACE_COLUMNS
    ))
    .bind(trace_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let step_rows: Vec<StepRow> = sqlx::query_as(&format!(
        "SELECT {} FROM steps s WHERE s.trace_id = ? ORDER BY s.step_index ASC",
        STEP_COLUMNS
    ))
    .bind(trace_id)
    .fetch_all(&mut *conn)
    .await?;

    let steps = step_rows
        .into_iter()
        .map(ReasoningStep::try_from)
        .collect::<StorageResult<Vec<_>>>()?;

    let trace = ReasoningTrace::from_parts(TraceHeader::try_from(row)?, steps)?;
    Ok(Some(trace))
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct TraceRow {
    trace_id: String,
    created_at: String,
    operation_type: String,
    operation_id: Option<String>,
    session_id: Option<String>,
    root_step_ids: String,
    success: bool,
    initial_context: String,
    final_outputs: String,
    metadata: String,
    completed_at: Option<String>,
    error_message: Option<String>,
}

impl TryFrom<TraceRow> for TraceHeader {
    type Error = StorageError;

    fn try_from(row: TraceRow) -> Result<Self, Self::Error> {
        Ok(Self {
            created_at: parse_timestamp("created_at", &row.created_at)?,
            root_step_ids: parse_id_list("root_step_ids", &row.root_step_ids)?,
            initial_context: parse_payload("initial_context", &row.initial_context)?,
            final_outputs: parse_payload("final_outputs", &row.final_outputs)?,
            metadata: parse_payload("metadata", &row.metadata)?,
            completed_at: row
                .completed_at
                .as_deref()
                .map(|ts| parse_timestamp("completed_at", ts))
                .transpose()?,
            trace_id: row.trace_id,
            operation_type: row.operation_type,
            operation_id: row.operation_id,
            session_id: row.session_id,
            success: row.success,
            error_message: row.error_message,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    step_id: String,
    trace_id: String,
    timestamp: String,
    decision_level: String,
    reasoning_type: String,
    decision_point: String,
    context: String,
    options_considered: String,
    decision_made: String,
    reasoning_text: String,
    confidence_score: f64,
    parent_step_id: Option<String>,
    child_step_ids: String,
    duration_ms: Option<f64>,
    metadata: String,
    error_occurred: bool,
    error_message: Option<String>,
}

impl TryFrom<StepRow> for ReasoningStep {
    type Error = StorageError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        let options_considered = serde_json::from_str(&row.options_considered).map_err(|e| {
            StorageError::Serialization {
                message: format!("Invalid JSON in options_considered: {}", e),
            }
        })?;

        Ok(Self {
            timestamp: parse_timestamp("timestamp", &row.timestamp)?,
            decision_level: parse_column("decision_level", &row.decision_level)?,
            reasoning_type: parse_column("reasoning_type", &row.reasoning_type)?,
            context: parse_payload("context", &row.context)?,
            options_considered,
            decision_made: parse_payload("decision_made", &row.decision_made)?,
            child_step_ids: parse_id_list("child_step_ids", &row.child_step_ids)?,
            metadata: parse_payload("metadata", &row.metadata)?,
            step_id: row.step_id,
            trace_id: row.trace_id,
            decision_point: row.decision_point,
            reasoning_text: row.reasoning_text,
            confidence_score: row.confidence_score,
            parent_step_id: row.parent_step_id,
            duration_ms: row.duration_ms,
            error_occurred: row.error_occurred,
            error_message: row.error_message,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OperationMetricRow {
    timestamp: String,
    operation_kind: String,
    execution_time_ms: f64,
    rows_affected: i64,
    success: bool,
    error_message: Option<String>,
}

impl TryFrom<OperationMetricRow> for OperationMetric {
    type Error = StorageError;

    fn try_from(row: OperationMetricRow) -> Result<Self, Self::Error> {
        Ok(Self {
            timestamp: parse_timestamp("timestamp", &row.timestamp)?,
            operation_kind: row.operation_kind,
            execution_time_ms: row.execution_time_ms,
            rows_affected: row.rows_affected.max(0) as u64,
            success: row.success,
            error_message: row.error_message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_timestamp_is_fixed_width() {
        let whole = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let fractional = whole + ChronoDuration::nanoseconds(123_456_789);
        assert_eq!(format_timestamp(whole), "2024-01-02T03:04:05.000000Z");
        assert_eq!(format_timestamp(fractional), "2024-01-02T03:04:05.123456Z");
        assert!(format_timestamp(whole) < format_timestamp(fractional));
    }

    #[test]
    fn test_parse_timestamp_round_trip() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let parsed = parse_timestamp("created_at", &format_timestamp(ts)).unwrap();
        assert_eq!(parsed, ts);
        assert!(parse_timestamp("created_at", "yesterday").is_err());
    }

    #[test]
    fn test_parse_column_rejects_unknown_enum() {
        let err = parse_column::<DecisionLevel>("decision_level", "cluster").unwrap_err();
        assert!(matches!(err, StorageError::Serialization { .. }));
        let level: DecisionLevel = parse_column("decision_level", "tool").unwrap();
        assert_eq!(level, DecisionLevel::Tool);
    }

    #[test]
    fn test_parse_payload_requires_object() {
        assert!(parse_payload("context", r#"{"k": 1}"#).is_ok());
        assert!(parse_payload("context", "[1, 2]").is_err());
    }
}
