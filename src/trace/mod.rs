//! Trace data model.
//!
//! A [`ReasoningTrace`] owns every [`ReasoningStep`] recorded during one
//! operation. Steps live in an id-keyed arena inside the trace; parent/child
//! links are ids, never references, so the tree has no ownership cycles.
//!
//! The trace enforces its structural invariants at mutation time:
//! - step ids are unique within the trace
//! - a step is either a root (no parent, listed in `root_step_ids`) or has a
//!   parent already present in the trace that lists it as a child
//! - confidence scores are finite and within `[0.0, 1.0]`
//! - a completed trace is sealed against further steps
//!
//! Derived statistics (`total_steps`, `total_duration_ms`,
//! `overall_confidence`) are recomputed on every mutation.


use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{TraceError, TraceResult};

/// Opaque key/value payload stored and returned verbatim.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Tier of the system that made a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionLevel {
    /// Whole-system orchestration.
    System,
    /// An agent acting on behalf of the system.
    Agent,
    /// A tool invocation.
    Tool,
    /// A language model call.
    Llm,
}

impl DecisionLevel {
    /// All levels, top of the hierarchy first.
    pub const ALL: [DecisionLevel; 4] = [
        DecisionLevel::System,
        DecisionLevel::Agent,
        DecisionLevel::Tool,
        DecisionLevel::Llm,
    ];

    /// Persisted string encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionLevel::System => "system",
            DecisionLevel::Agent => "agent",
            DecisionLevel::Tool => "tool",
            DecisionLevel::Llm => "llm",
        }
    }
}

impl std::fmt::Display for DecisionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DecisionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "system" => Ok(DecisionLevel::System),
            "agent" => Ok(DecisionLevel::Agent),
            "tool" => Ok(DecisionLevel::Tool),
            "llm" => Ok(DecisionLevel::Llm),
            _ => Err(format!("Unknown decision level: {}", s)),
        }
    }
}

/// Category of decision being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningType {
    WorkflowPlanning,
    ToolSelection,
    ParameterSelection,
    ModeSelection,
    ErrorHandling,
    Optimization,
    Validation,
    ReasoningChain,
    FallbackDecision,
}

impl ReasoningType {
    pub const ALL: [ReasoningType; 9] = [
        ReasoningType::WorkflowPlanning,
        ReasoningType::ToolSelection,
        ReasoningType::ParameterSelection,
        ReasoningType::ModeSelection,
        ReasoningType::ErrorHandling,
        ReasoningType::Optimization,
        ReasoningType::Validation,
        ReasoningType::ReasoningChain,
        ReasoningType::FallbackDecision,
    ];

    /// Persisted string encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningType::WorkflowPlanning => "workflow_planning",
            ReasoningType::ToolSelection => "tool_selection",
            ReasoningType::ParameterSelection => "parameter_selection",
            ReasoningType::ModeSelection => "mode_selection",
            ReasoningType::ErrorHandling => "error_handling",
            ReasoningType::Optimization => "optimization",
            ReasoningType::Validation => "validation",
            ReasoningType::ReasoningChain => "reasoning_chain",
            ReasoningType::FallbackDecision => "fallback_decision",
        }
    }
}

impl std::fmt::Display for ReasoningType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ReasoningType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReasoningType::ALL
            .iter()
            .find(|t| t.as_str() == s.to_lowercase())
            .copied()
            .ok_or_else(|| format!("Unknown reasoning type: {}", s))
    }
}

/// A single recorded decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningStep {
    /// Identifier, unique within the owning trace.
    pub step_id: String,
    /// Owning trace. Assigned by [`ReasoningTrace::add_step`].
    pub trace_id: String,
    /// When the decision was made.
    pub timestamp: DateTime<Utc>,
    /// Tier that made the decision.
    pub decision_level: DecisionLevel,
    /// Category of the decision.
    pub reasoning_type: ReasoningType,
    /// Label of what was being decided.
    pub decision_point: String,
    /// Information available at decision time.
    pub context: Payload,
    /// Alternatives considered, in the order presented.
    pub options_considered: Vec<serde_json::Value>,
    /// The chosen outcome.
    pub decision_made: Payload,
    /// Free-text justification.
    pub reasoning_text: String,
    /// Stated confidence (0.0-1.0).
    pub confidence_score: f64,
    /// Parent step within the same trace.
    pub parent_step_id: Option<String>,
    /// Children in insertion order. Maintained by the owning trace.
    pub child_step_ids: Vec<String>,
    /// How long the decision took.
    pub duration_ms: Option<f64>,
    /// Opaque metadata.
    pub metadata: Payload,
    /// Whether the decision ended in an error.
    pub error_occurred: bool,
    /// Error detail when `error_occurred` is set.
    pub error_message: Option<String>,
}

impl ReasoningStep {
    /// Create a new step with a generated id.
    pub fn new(
        decision_level: DecisionLevel,
        reasoning_type: ReasoningType,
        decision_point: impl Into<String>,
    ) -> Self {
        Self {
            step_id: Uuid::new_v4().to_string(),
            trace_id: String::new(),
            timestamp: Utc::now(),
            decision_level,
            reasoning_type,
            decision_point: decision_point.into(),
            context: Payload::new(),
            options_considered: Vec::new(),
            decision_made: Payload::new(),
            reasoning_text: String::new(),
            confidence_score: 0.5,
            parent_step_id: None,
            child_step_ids: Vec::new(),
            duration_ms: None,
            metadata: Payload::new(),
            error_occurred: false,
            error_message: None,
        }
    }

    pub fn with_id(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = step_id.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_context(mut self, context: Payload) -> Self {
        self.context = context;
        self
    }

    /// Add a single context entry.
    pub fn with_context_value(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_option(mut self, option: serde_json::Value) -> Self {
        self.options_considered.push(option);
        self
    }

    pub fn with_options(mut self, options: Vec<serde_json::Value>) -> Self {
        self.options_considered = options;
        self
    }

    pub fn with_decision(mut self, decision: Payload) -> Self {
        self.decision_made = decision;
        self
    }

    pub fn with_reasoning(mut self, reasoning_text: impl Into<String>) -> Self {
        self.reasoning_text = reasoning_text.into();
        self
    }

    /// Set the stated confidence. Range is checked when the step joins a trace.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence_score = confidence;
        self
    }

    pub fn with_parent(mut self, parent_step_id: impl Into<String>) -> Self {
        self.parent_step_id = Some(parent_step_id.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_metadata(mut self, metadata: Payload) -> Self {
        self.metadata = metadata;
        self
    }

    /// Mark the step as failed with the given message.
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_occurred = true;
        self.error_message = Some(message.into());
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_step_id.is_none()
    }

    fn check_confidence(&self) -> TraceResult<()> {
        if self.confidence_score.is_finite() && (0.0..=1.0).contains(&self.confidence_score) {
            Ok(())
        } else {
            Err(TraceError::InvalidConfidence {
                step_id: self.step_id.clone(),
                value: self.confidence_score,
            })
        }
    }
}

/// Trace-level fields persisted alongside the steps.
///
/// Used by storage backends to rebuild a trace from flat rows.
#[derive(Debug, Clone)]
pub struct TraceHeader {
    pub trace_id: String,
    pub created_at: DateTime<Utc>,
    pub operation_type: String,
    pub operation_id: Option<String>,
    pub session_id: Option<String>,
    pub root_step_ids: Vec<String>,
    pub success: bool,
    pub initial_context: Payload,
    pub final_outputs: Payload,
    pub metadata: Payload,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Serialized form of a trace. Derived statistics are not read back;
/// they are recomputed after the structure is validated.
#[derive(Deserialize)]
struct RawTrace {
    trace_id: String,
    created_at: DateTime<Utc>,
    operation_type: String,
    operation_id: Option<String>,
    session_id: Option<String>,
    root_step_ids: Vec<String>,
    all_steps: HashMap<String, ReasoningStep>,
    step_order: Vec<String>,
    success: bool,
    #[serde(default)]
    initial_context: Payload,
    #[serde(default)]
    final_outputs: Payload,
    #[serde(default)]
    metadata: Payload,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

impl TryFrom<RawTrace> for ReasoningTrace {
    type Error = TraceError;

    fn try_from(raw: RawTrace) -> TraceResult<Self> {
        let mut trace = Self {
            trace_id: raw.trace_id,
            created_at: raw.created_at,
            operation_type: raw.operation_type,
            operation_id: raw.operation_id,
            session_id: raw.session_id,
            root_step_ids: raw.root_step_ids,
            all_steps: raw.all_steps,
            step_order: raw.step_order,
            total_steps: 0,
            total_duration_ms: None,
            overall_confidence: 0.0,
            success: raw.success,
            initial_context: raw.initial_context,
            final_outputs: raw.final_outputs,
            metadata: raw.metadata,
            completed_at: raw.completed_at,
            error_message: raw.error_message,
        };

        for step in trace.all_steps.values_mut() {
            step.trace_id.clone_from(&trace.trace_id);
        }

        trace.validate()?;
        trace.recompute_statistics();
        Ok(trace)
    }
}

/// The complete decision record of one traced operation.
///
/// Deserializing re-checks every structural invariant and recomputes the
/// derived statistics, so a decoded trace is as trustworthy as one built
/// through [`ReasoningTrace::add_step`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTrace")]
pub struct ReasoningTrace {
    trace_id: String,
    created_at: DateTime<Utc>,
    operation_type: String,
    operation_id: Option<String>,
    session_id: Option<String>,
    root_step_ids: Vec<String>,
    all_steps: HashMap<String, ReasoningStep>,
    step_order: Vec<String>,
    total_steps: usize,
    total_duration_ms: Option<f64>,
    overall_confidence: f64,
    success: bool,
    /// Inputs the operation started with.
    pub initial_context: Payload,
    /// Outputs produced by the operation.
    pub final_outputs: Payload,
    /// Opaque metadata.
    pub metadata: Payload,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

impl ReasoningTrace {
    /// Open a new, in-progress trace.
    pub fn new(operation_type: impl Into<String>) -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            operation_type: operation_type.into(),
            operation_id: None,
            session_id: None,
            root_step_ids: Vec::new(),
            all_steps: HashMap::new(),
            step_order: Vec::new(),
            total_steps: 0,
            total_duration_ms: None,
            overall_confidence: 0.0,
            success: false,
            initial_context: Payload::new(),
            final_outputs: Payload::new(),
            metadata: Payload::new(),
            completed_at: None,
            error_message: None,
        }
    }

    /// Override the generated id. Only meaningful before steps are added.
    pub fn with_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        for step in self.all_steps.values_mut() {
            step.trace_id = self.trace_id.clone();
        }
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_operation_id(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_initial_context(mut self, initial_context: Payload) -> Self {
        self.initial_context = initial_context;
        self
    }

    pub fn with_metadata(mut self, metadata: Payload) -> Self {
        self.metadata = metadata;
        self
    }

    /// Rebuild a trace from persisted parts, re-checking every invariant.
    ///
    /// `steps` must be in insertion order and carry their stored
    /// `child_step_ids`.
    pub fn from_parts(header: TraceHeader, steps: Vec<ReasoningStep>) -> TraceResult<Self> {
        let mut trace = Self {
            trace_id: header.trace_id,
            created_at: header.created_at,
            operation_type: header.operation_type,
            operation_id: header.operation_id,
            session_id: header.session_id,
            root_step_ids: header.root_step_ids,
            all_steps: HashMap::with_capacity(steps.len()),
            step_order: Vec::with_capacity(steps.len()),
            total_steps: 0,
            total_duration_ms: None,
            overall_confidence: 0.0,
            success: header.success,
            initial_context: header.initial_context,
            final_outputs: header.final_outputs,
            metadata: header.metadata,
            completed_at: header.completed_at,
            error_message: header.error_message,
        };

        for mut step in steps {
            if trace.all_steps.contains_key(&step.step_id) {
                return Err(TraceError::DuplicateStep {
                    trace_id: trace.trace_id.clone(),
                    step_id: step.step_id,
                });
            }
            step.trace_id = trace.trace_id.clone();
            trace.step_order.push(step.step_id.clone());
            trace.all_steps.insert(step.step_id.clone(), step);
        }

        trace.validate()?;
        trace.recompute_statistics();
        Ok(trace)
    }

    /// Append a step, linking it under its parent when one is set.
    ///
    /// Returns the id of the inserted step.
    pub fn add_step(&mut self, mut step: ReasoningStep) -> TraceResult<String> {
        if self.is_completed() {
            return Err(TraceError::TraceSealed {
                trace_id: self.trace_id.clone(),
            });
        }
        step.check_confidence()?;
        if self.all_steps.contains_key(&step.step_id) {
            return Err(TraceError::DuplicateStep {
                trace_id: self.trace_id.clone(),
                step_id: step.step_id,
            });
        }

        match &step.parent_step_id {
            Some(parent_id) => {
                let parent = self.all_steps.get_mut(parent_id).ok_or_else(|| {
                    TraceError::UnknownParent {
                        step_id: step.step_id.clone(),
                        parent_step_id: parent_id.clone(),
                    }
                })?;
                parent.child_step_ids.push(step.step_id.clone());
            }
            None => self.root_step_ids.push(step.step_id.clone()),
        }

        // Children attach themselves as they are added.
        step.child_step_ids.clear();
        step.trace_id = self.trace_id.clone();

        let step_id = step.step_id.clone();
        self.step_order.push(step_id.clone());
        self.all_steps.insert(step_id.clone(), step);
        self.recompute_statistics();
        Ok(step_id)
    }

    /// Replace the final outputs of an in-progress trace.
    pub fn set_final_outputs(&mut self, final_outputs: Payload) -> TraceResult<()> {
        if self.is_completed() {
            return Err(TraceError::TraceSealed {
                trace_id: self.trace_id.clone(),
            });
        }
        self.final_outputs = final_outputs;
        Ok(())
    }

    /// Close the trace. A completed trace rejects further mutation.
    pub fn complete_trace(&mut self, success: bool, error_message: Option<String>) -> TraceResult<()> {
        if self.is_completed() {
            return Err(TraceError::TraceSealed {
                trace_id: self.trace_id.clone(),
            });
        }
        self.completed_at = Some(Utc::now());
        self.success = success;
        self.error_message = error_message;
        self.recompute_statistics();
        Ok(())
    }

    /// Re-check every structural invariant.
    pub fn validate(&self) -> TraceResult<()> {
        let hierarchy_error = |reason: String| TraceError::InvalidHierarchy {
            trace_id: self.trace_id.clone(),
            reason,
        };

        // Step order must be a permutation of the stored steps.
        let mut ordered = HashSet::with_capacity(self.step_order.len());
        for step_id in &self.step_order {
            if !ordered.insert(step_id.as_str()) {
                return Err(hierarchy_error(format!(
                    "step {} listed twice in step order",
                    step_id
                )));
            }
            if !self.all_steps.contains_key(step_id) {
                return Err(hierarchy_error(format!(
                    "step order lists unknown step {}",
                    step_id
                )));
            }
        }
        if ordered.len() != self.all_steps.len() {
            return Err(hierarchy_error(format!(
                "step order lists {} ids but trace holds {} steps",
                ordered.len(),
                self.all_steps.len()
            )));
        }

        for (step_id, step) in &self.all_steps {
            if &step.step_id != step_id {
                return Err(hierarchy_error(format!(
                    "step stored under {} reports id {}",
                    step_id, step.step_id
                )));
            }
            step.check_confidence()?;

            match &step.parent_step_id {
                None => {
                    if !self.root_step_ids.contains(step_id) {
                        return Err(hierarchy_error(format!(
                            "parentless step {} is not a root",
                            step_id
                        )));
                    }
                }
                Some(parent_id) => {
                    let parent =
                        self.all_steps
                            .get(parent_id)
                            .ok_or_else(|| TraceError::UnknownParent {
                                step_id: step_id.clone(),
                                parent_step_id: parent_id.clone(),
                            })?;
                    if !parent.child_step_ids.contains(step_id) {
                        return Err(hierarchy_error(format!(
                            "parent {} does not list child {}",
                            parent_id, step_id
                        )));
                    }
                }
            }

            for child_id in &step.child_step_ids {
                let linked = self
                    .all_steps
                    .get(child_id)
                    .map(|child| child.parent_step_id.as_deref() == Some(step_id.as_str()))
                    .unwrap_or(false);
                if !linked {
                    return Err(hierarchy_error(format!(
                        "step {} lists child {} which does not point back",
                        step_id, child_id
                    )));
                }
            }
        }

        let mut seen_roots = HashSet::new();
        for root_id in &self.root_step_ids {
            if !seen_roots.insert(root_id) {
                return Err(hierarchy_error(format!("root {} listed twice", root_id)));
            }
            match self.all_steps.get(root_id) {
                Some(root) if root.parent_step_id.is_none() => {}
                Some(_) => {
                    return Err(hierarchy_error(format!("root {} has a parent", root_id)));
                }
                None => {
                    return Err(hierarchy_error(format!("root {} is not a step", root_id)));
                }
            }
        }

        // Local links can still hide a detached cycle; everything must be
        // reachable from a root exactly once.
        let mut visited = HashSet::with_capacity(self.all_steps.len());
        let mut stack: Vec<&str> = self.root_step_ids.iter().map(String::as_str).collect();
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                return Err(hierarchy_error(format!("step {} reached twice", id)));
            }
            if let Some(step) = self.all_steps.get(id) {
                stack.extend(step.child_step_ids.iter().map(String::as_str));
            }
        }
        if visited.len() != self.all_steps.len() {
            return Err(hierarchy_error(format!(
                "{} steps unreachable from roots",
                self.all_steps.len() - visited.len()
            )));
        }

        Ok(())
    }

    // Sums run in insertion order so equal traces get bit-identical results.
    fn recompute_statistics(&mut self) {
        self.total_steps = self.all_steps.len();

        let durations: Vec<f64> = self.steps().filter_map(|s| s.duration_ms).collect();
        self.total_duration_ms = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum())
        };

        self.overall_confidence = if self.all_steps.is_empty() {
            0.0
        } else {
            self.steps().map(|s| s.confidence_score).sum::<f64>() / self.all_steps.len() as f64
        };
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn operation_type(&self) -> &str {
        &self.operation_type
    }

    pub fn operation_id(&self) -> Option<&str> {
        self.operation_id.as_deref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn root_step_ids(&self) -> &[String] {
        &self.root_step_ids
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    pub fn total_duration_ms(&self) -> Option<f64> {
        self.total_duration_ms
    }

    pub fn overall_confidence(&self) -> f64 {
        self.overall_confidence
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn step(&self, step_id: &str) -> Option<&ReasoningStep> {
        self.all_steps.get(step_id)
    }

    /// Steps in insertion order.
    pub fn steps(&self) -> impl Iterator<Item = &ReasoningStep> + '_ {
        self.step_order
            .iter()
            .filter_map(move |id| self.all_steps.get(id))
    }

    pub fn root_steps(&self) -> Vec<&ReasoningStep> {
        self.root_step_ids
            .iter()
            .filter_map(|id| self.all_steps.get(id))
            .collect()
    }

    pub fn children_of(&self, step_id: &str) -> Vec<&ReasoningStep> {
        self.all_steps
            .get(step_id)
            .map(|step| {
                step.child_step_ids
                    .iter()
                    .filter_map(|id| self.all_steps.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn error_steps(&self) -> Vec<&ReasoningStep> {
        self.steps().filter(|s| s.error_occurred).collect()
    }

    /// Every downward path starting at `step_id`, following at most
    /// `max_depth` parent-to-child links.
    ///
    /// A step without children (or a walk that hits the depth limit) ends a
    /// path. Returns an empty list if the step is unknown.
    pub fn paths_from(&self, step_id: &str, max_depth: usize) -> Vec<Vec<&ReasoningStep>> {
        let Some(start) = self.all_steps.get(step_id) else {
            return Vec::new();
        };

        let mut paths = Vec::new();
        let mut stack: Vec<Vec<&ReasoningStep>> = vec![vec![start]];
        while let Some(path) = stack.pop() {
            let Some(last) = path.last() else { continue };
            let children = self.children_of(&last.step_id);
            if children.is_empty() || path.len() > max_depth {
                paths.push(path);
                continue;
            }
            // Reverse so the first child is explored first.
            for child in children.into_iter().rev() {
                let mut next = path.clone();
                next.push(child);
                stack.push(next);
            }
        }
        paths
    }
}
