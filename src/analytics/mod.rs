//! Read-side analytics over stored traces.
//!
//! [`AnalyticsEngine`] is built only on the [`TraceStore`] query primitives
//! and never writes. Wide scans page through the store using the configured
//! page size and honour [`ScanOptions`] cancellation between pages. Pattern
//! and error-pattern results are kept in a TTL cache with its own lock.

mod cache;
mod report;
mod stats;
mod types;

pub use cache::PatternCache;
pub use report::{
    analyze_trace, confidence_calibration_score, decision_consistency_score,
    reasoning_quality_score,
};
pub use stats::CONFIDENCE_BUCKETS;
pub use types::{
    CalibrationBucket, CalibrationReport, ComparisonMetric, ConfidenceBucket, DecisionAnalysis,
    ErrorExample, ErrorPattern, MetricComparison, MetricValue, ReasoningPattern, SimilarDecision,
    TermFrequency, TraceAnalysis, TraceComparison, TraceIssue,
};

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::debug;

use crate::config::AnalyticsConfig;
use crate::error::StorageResult;
use crate::storage::{ScanOptions, StepQuery, TraceQuery, TraceStore};
use crate::trace::{DecisionLevel, ReasoningStep, ReasoningTrace, ReasoningType};

const MAX_EXAMPLE_CONTEXTS: usize = 5;
const MAX_EXAMPLE_STEPS: usize = 3;
const MAX_ERROR_EXAMPLES: usize = 5;

/// Query and analytics engine over a trace store.
pub struct AnalyticsEngine {
    store: Arc<dyn TraceStore>,
    config: AnalyticsConfig,
    pattern_cache: PatternCache<Vec<ReasoningPattern>>,
    error_cache: PatternCache<Vec<ErrorPattern>>,
}

impl AnalyticsEngine {
    pub fn new(store: Arc<dyn TraceStore>, config: AnalyticsConfig) -> Self {
        let ttl = config.cache_ttl();
        Self {
            store,
            config,
            pattern_cache: PatternCache::new(ttl),
            error_cache: PatternCache::new(ttl),
        }
    }

    pub fn store(&self) -> &Arc<dyn TraceStore> {
        &self.store
    }

    /// Drop every cached pattern result.
    pub async fn invalidate_cache(&self) {
        self.pattern_cache.clear().await;
        self.error_cache.clear().await;
        debug!("Analytics cache invalidated");
    }

    fn default_scan(&self) -> ScanOptions {
        ScanOptions::new().with_page_size(self.config.scan_page_size)
    }

    // ========================================================================
    // Similarity
    // ========================================================================

    /// Stored decisions resembling `reference`, most similar first.
    ///
    /// Candidates share the reference's decision level and reasoning type
    /// and are limited to the `similarity_candidates` most recent such steps
    /// (`TRACE_SIMILARITY_CANDIDATES`); older steps are never scored. The
    /// reference itself is never returned. Equal scores keep the store's
    /// most-recent-first order.
    pub async fn find_similar_decisions(
        &self,
        reference: &ReasoningStep,
        threshold: f64,
        limit: usize,
    ) -> StorageResult<Vec<SimilarDecision>> {
        let candidates = self
            .store
            .query_steps(
                &StepQuery::new()
                    .decision_level(reference.decision_level)
                    .reasoning_type(reference.reasoning_type)
                    .limit(self.config.similarity_candidates),
            )
            .await?;

        let mut similar: Vec<SimilarDecision> = candidates
            .into_iter()
            .filter(|c| !(c.step_id == reference.step_id && c.trace_id == reference.trace_id))
            .filter_map(|step| {
                let similarity = stats::decision_similarity(reference, &step);
                (similarity >= threshold).then_some(SimilarDecision { step, similarity })
            })
            .collect();

        // Stable sort keeps candidate order for ties.
        similar.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
        });
        similar.truncate(limit);
        Ok(similar)
    }

    // ========================================================================
    // Patterns
    // ========================================================================

    /// Recurring `(reasoning_type, decision_level)` combinations in traces
    /// created within the last `lookback_days`.
    pub async fn detect_reasoning_patterns(
        &self,
        operation_type: Option<&str>,
        min_frequency: usize,
        lookback_days: u32,
    ) -> StorageResult<Vec<ReasoningPattern>> {
        self.detect_reasoning_patterns_with(
            operation_type,
            min_frequency,
            lookback_days,
            &self.default_scan(),
        )
        .await
    }

    /// [`detect_reasoning_patterns`](Self::detect_reasoning_patterns) with
    /// caller-supplied paging and cancellation.
    pub async fn detect_reasoning_patterns_with(
        &self,
        operation_type: Option<&str>,
        min_frequency: usize,
        lookback_days: u32,
        options: &ScanOptions,
    ) -> StorageResult<Vec<ReasoningPattern>> {
        let cache_key = format!(
            "patterns:{}:{}:{}",
            operation_type.unwrap_or("*"),
            min_frequency,
            lookback_days
        );
        if let Some(cached) = self.pattern_cache.get(&cache_key).await {
            debug!(key = %cache_key, "Pattern cache hit");
            return Ok(cached);
        }

        let mut query = TraceQuery::new().since(lookback_start(lookback_days));
        if let Some(operation_type) = operation_type {
            query = query.operation_type(operation_type);
        }

        let mut groups: BTreeMap<(ReasoningType, DecisionLevel), PatternGroup> = BTreeMap::new();
        let scanned = self
            .scan_traces(query, options, |trace| {
                for step in trace.steps() {
                    groups
                        .entry((step.reasoning_type, step.decision_level))
                        .or_default()
                        .add(step, trace.success());
                }
            })
            .await?;

        let mut patterns: Vec<ReasoningPattern> = groups
            .into_iter()
            .filter(|(_, group)| group.confidences.len() >= min_frequency)
            .map(|((reasoning_type, decision_level), group)| {
                group.into_pattern(reasoning_type, decision_level)
            })
            .collect();
        patterns.sort_by(|a, b| b.frequency.cmp(&a.frequency));

        debug!(traces = scanned, patterns = patterns.len(), "Reasoning patterns detected");
        self.pattern_cache.put(cache_key, patterns.clone()).await;
        Ok(patterns)
    }

    /// Recurring error steps among failed traces created within the last
    /// `lookback_days`.
    pub async fn get_error_patterns(
        &self,
        lookback_days: u32,
        min_frequency: usize,
    ) -> StorageResult<Vec<ErrorPattern>> {
        self.get_error_patterns_with(lookback_days, min_frequency, &self.default_scan())
            .await
    }

    pub async fn get_error_patterns_with(
        &self,
        lookback_days: u32,
        min_frequency: usize,
        options: &ScanOptions,
    ) -> StorageResult<Vec<ErrorPattern>> {
        let cache_key = format!("errors:{}:{}", min_frequency, lookback_days);
        if let Some(cached) = self.error_cache.get(&cache_key).await {
            debug!(key = %cache_key, "Error pattern cache hit");
            return Ok(cached);
        }

        let query = TraceQuery::new()
            .success(false)
            .since(lookback_start(lookback_days));

        let mut groups: BTreeMap<(ReasoningType, DecisionLevel), ErrorGroup> = BTreeMap::new();
        self.scan_traces(query, options, |trace| {
            for step in trace.error_steps() {
                groups
                    .entry((step.reasoning_type, step.decision_level))
                    .or_default()
                    .add(step);
            }
        })
        .await?;

        let mut patterns: Vec<ErrorPattern> = groups
            .into_iter()
            .filter(|(_, group)| group.frequency >= min_frequency)
            .map(|((reasoning_type, decision_level), group)| {
                group.into_pattern(reasoning_type, decision_level)
            })
            .collect();
        patterns.sort_by(|a, b| b.frequency.cmp(&a.frequency));

        self.error_cache.put(cache_key, patterns.clone()).await;
        Ok(patterns)
    }

    // ========================================================================
    // Decision quality and calibration
    // ========================================================================

    /// Quality report for decisions whose decision point contains
    /// `decision_point` (case-insensitive), made within the last
    /// `lookback_days`.
    pub async fn analyze_decision_quality(
        &self,
        decision_point: &str,
        lookback_days: u32,
    ) -> StorageResult<DecisionAnalysis> {
        let needle = decision_point.to_lowercase();
        let query = StepQuery::new().since(lookback_start(lookback_days));

        let mut matched: Vec<ReasoningStep> = Vec::new();
        self.scan_steps(query, &self.default_scan(), |step| {
            if step.decision_point.to_lowercase().contains(&needle) {
                matched.push(step);
            }
        })
        .await?;

        let confidences: Vec<f64> = matched.iter().map(|s| s.confidence_score).collect();
        let mut histogram = [0usize; 5];
        for confidence in &confidences {
            histogram[stats::bucket_index(*confidence)] += 1;
        }

        let total = matched.len();
        let errors = matched.iter().filter(|s| s.error_occurred).count();
        let durations: Vec<f64> = matched.iter().filter_map(|s| s.duration_ms).collect();
        let alternatives: Vec<f64> = matched
            .iter()
            .map(|s| s.options_considered.len() as f64)
            .collect();
        let with_alternatives = matched
            .iter()
            .filter(|s| !s.options_considered.is_empty())
            .count();

        let mut term_counts: HashMap<String, usize> = HashMap::new();
        for step in &matched {
            for term in stats::content_terms(&step.reasoning_text) {
                *term_counts.entry(term).or_insert(0) += 1;
            }
        }
        let mut terms: Vec<TermFrequency> = term_counts
            .into_iter()
            .map(|(term, count)| TermFrequency { term, count })
            .collect();
        terms.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.term.cmp(&b.term)));
        terms.truncate(self.config.top_terms);

        Ok(DecisionAnalysis {
            decision_point_query: decision_point.to_string(),
            lookback_days,
            total_decisions: total,
            mean_confidence: stats::mean(&confidences),
            confidence_distribution: CONFIDENCE_BUCKETS
                .iter()
                .zip(histogram)
                .map(|((lower, upper, label), count)| ConfidenceBucket {
                    range: label.to_string(),
                    lower: *lower,
                    upper: *upper,
                    count,
                })
                .collect(),
            success_rate: ratio(total - errors, total),
            mean_duration_ms: stats::mean(&durations),
            alternatives_rate: ratio(with_alternatives, total),
            mean_alternatives: stats::mean(&alternatives),
            common_reasoning_terms: terms,
        })
    }

    /// Calibration of completed traces created within the last
    /// `lookback_days`, bucketed by overall confidence.
    pub async fn analyze_confidence_calibration(
        &self,
        operation_type: Option<&str>,
        lookback_days: u32,
    ) -> StorageResult<CalibrationReport> {
        let mut query = TraceQuery::new().since(lookback_start(lookback_days));
        if let Some(operation_type) = operation_type {
            query = query.operation_type(operation_type);
        }

        // (confidence, succeeded) per bucket
        let mut buckets: [Vec<(f64, bool)>; 5] = Default::default();
        self.scan_traces(query, &self.default_scan(), |trace| {
            if trace.is_completed() {
                let confidence = trace.overall_confidence();
                buckets[stats::bucket_index(confidence)].push((confidence, trace.success()));
            }
        })
        .await?;

        let total: usize = buckets.iter().map(Vec::len).sum();
        let report_buckets: Vec<CalibrationBucket> = CONFIDENCE_BUCKETS
            .iter()
            .zip(buckets.iter())
            .map(|((lower, upper, label), members)| {
                let (mean_confidence, success_rate) = calibration_of(members);
                CalibrationBucket {
                    range: label.to_string(),
                    lower: *lower,
                    upper: *upper,
                    count: members.len(),
                    mean_confidence,
                    success_rate,
                    calibration_error: mean_confidence
                        .zip(success_rate)
                        .map(|(c, s)| (c - s).abs()),
                }
            })
            .collect();

        let everything: Vec<(f64, bool)> = buckets.into_iter().flatten().collect();
        let (mean_confidence, success_rate) = calibration_of(&everything);
        let expected_calibration_error = (total > 0).then(|| {
            report_buckets
                .iter()
                .filter_map(|b| b.calibration_error.map(|e| e * b.count as f64))
                .sum::<f64>()
                / total as f64
        });

        Ok(CalibrationReport {
            operation_type: operation_type.map(str::to_string),
            lookback_days,
            total_traces: total,
            buckets: report_buckets,
            overall_calibration_error: mean_confidence
                .zip(success_rate)
                .map(|(c, s)| (c - s).abs()),
            expected_calibration_error,
        })
    }

    // ========================================================================
    // Single trace and comparison
    // ========================================================================

    /// Deep report on one trace, or `None` if it does not exist.
    pub async fn analyze_trace(&self, trace_id: &str) -> StorageResult<Option<TraceAnalysis>> {
        Ok(self
            .store
            .get_trace(trace_id)
            .await?
            .map(|trace| report::analyze_trace(&trace)))
    }

    /// Compare traces on `metrics`, or on [`ComparisonMetric::DEFAULT`] when
    /// none are given. Unknown trace ids are listed, not treated as errors.
    pub async fn compare_traces(
        &self,
        trace_ids: &[String],
        metrics: Option<&[ComparisonMetric]>,
    ) -> StorageResult<TraceComparison> {
        let metrics = metrics.unwrap_or(&ComparisonMetric::DEFAULT);

        let mut analyses = Vec::with_capacity(trace_ids.len());
        let mut missing_trace_ids = Vec::new();
        for trace_id in trace_ids {
            match self.analyze_trace(trace_id).await? {
                Some(analysis) => analyses.push(analysis),
                None => missing_trace_ids.push(trace_id.clone()),
            }
        }

        let comparisons = metrics
            .iter()
            .map(|metric| {
                let values: Vec<MetricValue> = analyses
                    .iter()
                    .filter_map(|analysis| {
                        metric.value_of(analysis).map(|value| MetricValue {
                            trace_id: analysis.trace_id.clone(),
                            value,
                        })
                    })
                    .collect();
                let raw: Vec<f64> = values.iter().map(|v| v.value).collect();
                let min = raw.iter().copied().reduce(f64::min);
                let max = raw.iter().copied().reduce(f64::max);
                MetricComparison {
                    metric: *metric,
                    avg: stats::mean(&raw),
                    range: min.zip(max).map(|(lo, hi)| hi - lo),
                    min,
                    max,
                    values,
                }
            })
            .collect();

        Ok(TraceComparison {
            trace_ids: analyses.into_iter().map(|a| a.trace_id).collect(),
            missing_trace_ids,
            metrics: comparisons,
        })
    }

    // ========================================================================
    // Decision chains
    // ========================================================================

    /// Downward decision paths starting at every step whose decision point
    /// contains `decision_point` (case-insensitive) and whose confidence is
    /// at least `min_confidence`.
    ///
    /// Each path follows parent-to-child links depth first, at most
    /// `max_depth` links deep; a starting step without children yields a
    /// single-step chain.
    pub async fn find_decision_chains(
        &self,
        decision_point: &str,
        max_depth: usize,
        min_confidence: f64,
    ) -> StorageResult<Vec<Vec<ReasoningStep>>> {
        let needle = decision_point.to_lowercase();
        let query = StepQuery::new().confidence_threshold(min_confidence);

        // Starting steps grouped by trace so each trace is loaded once,
        // traces kept in the order they were first seen.
        let mut starts: Vec<(String, Vec<String>)> = Vec::new();
        let mut slot_of: HashMap<String, usize> = HashMap::new();
        self.scan_steps(query, &self.default_scan(), |step| {
            if !step.decision_point.to_lowercase().contains(&needle) {
                return;
            }
            let slot = *slot_of.entry(step.trace_id.clone()).or_insert_with(|| {
                starts.push((step.trace_id.clone(), Vec::new()));
                starts.len() - 1
            });
            starts[slot].1.push(step.step_id);
        })
        .await?;

        let mut chains = Vec::new();
        for (trace_id, step_ids) in starts {
            // Deleted since the step scan.
            let Some(trace) = self.store.get_trace(&trace_id).await? else {
                continue;
            };
            for step_id in step_ids {
                chains.extend(
                    trace
                        .paths_from(&step_id, max_depth)
                        .into_iter()
                        .map(|path| path.into_iter().cloned().collect::<Vec<_>>()),
                );
            }
        }

        debug!(chains = chains.len(), "Decision chains collected");
        Ok(chains)
    }

    // ========================================================================
    // Paged scans
    // ========================================================================

    async fn scan_traces<F>(
        &self,
        query: TraceQuery,
        options: &ScanOptions,
        mut visit: F,
    ) -> StorageResult<u64>
    where
        F: FnMut(&ReasoningTrace),
    {
        let page_size = options.page_size();
        let started = Instant::now();
        let mut seen = 0u64;
        let mut offset = 0u32;

        loop {
            options.check(started, seen)?;
            let page = self
                .store
                .query_traces(&query.clone().limit(page_size).offset(offset))
                .await?;
            for trace in &page {
                visit(trace);
            }
            seen += page.len() as u64;
            if page.len() < page_size as usize {
                break;
            }
            offset = offset.saturating_add(page_size);
        }

        Ok(seen)
    }

    async fn scan_steps<F>(
        &self,
        query: StepQuery,
        options: &ScanOptions,
        mut visit: F,
    ) -> StorageResult<u64>
    where
        F: FnMut(ReasoningStep),
    {
        let page_size = options.page_size();
        let started = Instant::now();
        let mut seen = 0u64;
        let mut offset = 0u32;

        loop {
            options.check(started, seen)?;
            let page = self
                .store
                .query_steps(&query.clone().limit(page_size).offset(offset))
                .await?;
            let fetched = page.len();
            for step in page {
                visit(step);
            }
            seen += fetched as u64;
            if fetched < page_size as usize {
                break;
            }
            offset = offset.saturating_add(page_size);
        }

        Ok(seen)
    }
}

// ============================================================================
// Group accumulators
// ============================================================================

#[derive(Default)]
struct PatternGroup {
    confidences: Vec<f64>,
    contexts: Vec<String>,
    step_ids: Vec<String>,
    /// Outcome per distinct owning trace.
    outcomes: HashMap<String, bool>,
}

impl PatternGroup {
    fn add(&mut self, step: &ReasoningStep, trace_succeeded: bool) {
        self.confidences.push(step.confidence_score);
        if self.step_ids.len() < MAX_EXAMPLE_STEPS {
            self.step_ids.push(step.step_id.clone());
        }
        if self.contexts.len() < MAX_EXAMPLE_CONTEXTS && !step.context.is_empty() {
            if let Ok(context) = serde_json::to_string(&step.context) {
                if !self.contexts.contains(&context) {
                    self.contexts.push(context);
                }
            }
        }
        self.outcomes
            .insert(step.trace_id.clone(), trace_succeeded);
    }

    fn into_pattern(
        self,
        reasoning_type: ReasoningType,
        decision_level: DecisionLevel,
    ) -> ReasoningPattern {
        let min = self.confidences.iter().copied().fold(f64::INFINITY, f64::min);
        let max = self
            .confidences
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let succeeded = self.outcomes.values().filter(|ok| **ok).count();

        ReasoningPattern {
            pattern_id: format!("{}:{}", reasoning_type, decision_level),
            reasoning_type,
            decision_level,
            frequency: self.confidences.len(),
            confidence_range: (min, max),
            example_contexts: self.contexts,
            example_step_ids: self.step_ids,
            success_rate: ratio(succeeded, self.outcomes.len()).unwrap_or(0.0),
            mean_confidence: stats::mean(&self.confidences).unwrap_or(0.0),
            confidence_std_dev: stats::std_dev(&self.confidences).unwrap_or(0.0),
        }
    }
}

#[derive(Default)]
struct ErrorGroup {
    frequency: usize,
    /// Message counts in first-seen order.
    messages: Vec<(String, usize)>,
    traces: HashSet<String>,
    examples: Vec<ErrorExample>,
}

impl ErrorGroup {
    fn add(&mut self, step: &ReasoningStep) {
        self.frequency += 1;
        self.traces.insert(step.trace_id.clone());

        if let Some(message) = &step.error_message {
            match self.messages.iter_mut().find(|(m, _)| m == message) {
                Some((_, count)) => *count += 1,
                None => self.messages.push((message.clone(), 1)),
            }
        }

        if self.examples.len() < MAX_ERROR_EXAMPLES {
            self.examples.push(ErrorExample {
                trace_id: step.trace_id.clone(),
                step_id: step.step_id.clone(),
                decision_point: step.decision_point.clone(),
                error_message: step.error_message.clone(),
                confidence_score: step.confidence_score,
            });
        }
    }

    fn into_pattern(self, reasoning_type: ReasoningType, decision_level: DecisionLevel) -> ErrorPattern {
        // Highest count wins; on ties the earliest message is kept.
        let most_common_error = self
            .messages
            .iter()
            .fold(None::<&(String, usize)>, |best, candidate| match best {
                Some(b) if b.1 >= candidate.1 => Some(b),
                _ => Some(candidate),
            })
            .map(|(message, _)| message.clone());

        ErrorPattern {
            reasoning_type,
            decision_level,
            frequency: self.frequency,
            most_common_error,
            affected_traces: self.traces.len(),
            examples: self.examples,
        }
    }
}

fn lookback_start(lookback_days: u32) -> DateTime<Utc> {
    Utc::now() - ChronoDuration::days(i64::from(lookback_days))
}

fn ratio(part: usize, whole: usize) -> Option<f64> {
    (whole > 0).then(|| part as f64 / whole as f64)
}

/// Mean confidence and success rate of `(confidence, succeeded)` pairs.
fn calibration_of(members: &[(f64, bool)]) -> (Option<f64>, Option<f64>) {
    let confidences: Vec<f64> = members.iter().map(|(c, _)| *c).collect();
    let succeeded = members.iter().filter(|(_, ok)| *ok).count();
    (stats::mean(&confidences), ratio(succeeded, members.len()))
}
