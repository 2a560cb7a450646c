//! # Reasoning Trace
//!
//! Durable decision traces for multi-level reasoning systems, with a
//! read-only analytics layer on top.
//!
//! ## Features
//!
//! - **Trace model**: hierarchical decision records (System, Agent, Tool and
//!   LLM levels) with invariants enforced at mutation time
//! - **Trace store**: transactional SQLite persistence with indexed queries,
//!   retention cleanup and self-instrumentation
//! - **Analytics**: similarity search, pattern and error-pattern mining,
//!   decision quality, confidence calibration, per-trace reports, trace
//!   comparison and decision-chain traversal
//!
//! ## Architecture
//!
//! ```text
//! Trace producer → ReasoningTrace → TraceStore (SQLite)
//!                                         ↓
//!                                  AnalyticsEngine → reports
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use reasoning_trace::{AnalyticsEngine, Config, ReasoningTrace, SqliteTraceStore, TraceStore};
//! use reasoning_trace::trace::{DecisionLevel, ReasoningStep, ReasoningType};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let store = Arc::new(SqliteTraceStore::new(&config.database).await?);
//!
//!     let mut trace = ReasoningTrace::new("workflow_generation");
//!     trace.add_step(
//!         ReasoningStep::new(DecisionLevel::Agent, ReasoningType::WorkflowPlanning, "plan")
//!             .with_confidence(0.9),
//!     )?;
//!     trace.complete_trace(true, None)?;
//!     store.store_trace(&trace).await?;
//!
//!     let analytics = AnalyticsEngine::new(store, config.analytics);
//!     let report = analytics.analyze_trace(trace.trace_id()).await?;
//!     println!("{:?}", report);
//!     Ok(())
//! }
//! ```

/// Query and analytics engine over stored traces.
pub mod analytics;
/// Configuration management.
pub mod config;
/// Error types and result aliases.
pub mod error;
/// Trace storage contract and SQLite implementation.
pub mod storage;
/// Trace and step data model.
pub mod trace;

pub use analytics::AnalyticsEngine;
pub use config::Config;
pub use error::{AppError, AppResult, StorageError, StorageResult, TraceError, TraceResult};
pub use storage::{SqliteTraceStore, TraceStore};
pub use trace::{ReasoningStep, ReasoningTrace};
