use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use reasoning_trace::{
    analytics::{AnalyticsEngine, ComparisonMetric},
    config::{Config, LogFormat},
    storage::{ScanOptions, SqliteTraceStore, TraceQuery, TraceStore},
};

/// Maintenance and reporting tool for the reasoning trace store.
#[derive(Parser, Debug)]
#[command(name = "trace-admin", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Show aggregate store statistics
    Stats,

    /// Verify the store is reachable
    Health,

    /// Print a stored trace as JSON
    Show {
        /// Trace to print
        trace_id: String,
    },

    /// List recent traces
    List {
        /// Filter by operation type
        #[arg(long)]
        operation_type: Option<String>,

        /// Filter by outcome: true for successful, false for failed
        #[arg(long)]
        success: Option<bool>,

        /// Maximum number of traces to show
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Analyze a single trace
    Analyze {
        /// Trace to analyze
        trace_id: String,
    },

    /// Compare several traces
    Compare {
        /// Traces to compare
        #[arg(required = true)]
        trace_ids: Vec<String>,

        /// Metric to compare (repeatable); defaults to the standard set
        #[arg(long = "metric")]
        metrics: Vec<ComparisonMetric>,
    },

    /// Detect recurring reasoning patterns
    Patterns {
        /// Restrict to one operation type
        #[arg(long)]
        operation_type: Option<String>,

        /// Minimum occurrences for a pattern
        #[arg(long, default_value = "3")]
        min_frequency: usize,

        /// Days of history to scan
        #[arg(long, default_value = "7")]
        days: u32,
    },

    /// Mine recurring errors from failed traces
    Errors {
        /// Minimum occurrences for a pattern
        #[arg(long, default_value = "2")]
        min_frequency: usize,

        /// Days of history to scan
        #[arg(long, default_value = "7")]
        days: u32,
    },

    /// Report confidence calibration
    Calibration {
        /// Restrict to one operation type
        #[arg(long)]
        operation_type: Option<String>,

        /// Days of history to scan
        #[arg(long, default_value = "30")]
        days: u32,
    },

    /// Show recent store operation metrics
    Metrics {
        /// Maximum number of records to show
        #[arg(long, default_value = "50")]
        limit: u32,
    },

    /// Delete completed traces older than the retention window
    Cleanup {
        /// Retention window in days
        #[arg(long, default_value = "30")]
        days: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_logging(&config);

    info!(version = env!("CARGO_PKG_VERSION"), command = ?cli.command, "trace-admin starting");

    let store = match SqliteTraceStore::new(&config.database).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "Failed to open trace store");
            return Err(e.into());
        }
    };

    let page_size = config.analytics.scan_page_size;
    let analytics = AnalyticsEngine::new(store.clone(), config.analytics);

    run(cli.command, store.as_ref(), &analytics, page_size).await
}

async fn run(
    command: Command,
    store: &SqliteTraceStore,
    analytics: &AnalyticsEngine,
    page_size: u32,
) -> anyhow::Result<()> {
    match command {
        Command::Stats => print_json(&store.get_statistics().await?),
        Command::Health => {
            store.health_check().await?;
            print_json(&serde_json::json!({ "status": "ok" }))
        }
        Command::Show { trace_id } => {
            let trace = store
                .get_trace(&trace_id)
                .await?
                .with_context(|| format!("Trace not found: {}", trace_id))?;
            print_json(&trace)
        }
        Command::List {
            operation_type,
            success,
            limit,
        } => {
            let mut query = TraceQuery::new().limit(limit);
            if let Some(operation_type) = operation_type {
                query = query.operation_type(operation_type);
            }
            if let Some(success) = success {
                query = query.success(success);
            }
            let summaries: Vec<serde_json::Value> = store
                .query_traces(&query)
                .await?
                .iter()
                .map(|trace| {
                    serde_json::json!({
                        "trace_id": trace.trace_id(),
                        "operation_type": trace.operation_type(),
                        "created_at": trace.created_at(),
                        "total_steps": trace.total_steps(),
                        "overall_confidence": trace.overall_confidence(),
                        "success": trace.success(),
                        "completed": trace.is_completed(),
                    })
                })
                .collect();
            print_json(&summaries)
        }
        Command::Analyze { trace_id } => {
            let analysis = analytics
                .analyze_trace(&trace_id)
                .await?
                .with_context(|| format!("Trace not found: {}", trace_id))?;
            print_json(&analysis)
        }
        Command::Compare { trace_ids, metrics } => {
            let metrics = (!metrics.is_empty()).then_some(metrics.as_slice());
            print_json(&analytics.compare_traces(&trace_ids, metrics).await?)
        }
        Command::Patterns {
            operation_type,
            min_frequency,
            days,
        } => print_json(
            &analytics
                .detect_reasoning_patterns(operation_type.as_deref(), min_frequency, days)
                .await?,
        ),
        Command::Errors {
            min_frequency,
            days,
        } => print_json(&analytics.get_error_patterns(days, min_frequency).await?),
        Command::Calibration {
            operation_type,
            days,
        } => print_json(
            &analytics
                .analyze_confidence_calibration(operation_type.as_deref(), days)
                .await?,
        ),
        Command::Metrics { limit } => print_json(&store.get_operation_metrics(limit).await?),
        Command::Cleanup { days } => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, stopping cleanup after the current page");
                    on_signal.cancel();
                }
            });

            let options = ScanOptions::new()
                .with_page_size(page_size)
                .with_cancellation(cancel);
            let deleted = store.cleanup_old_traces(days, &options).await?;
            print_json(&serde_json::json!({ "deleted": deleted, "older_than_days": days }))
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
