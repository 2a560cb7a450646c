//! Numeric and text helpers shared by the analyses.

use std::collections::HashSet;
use std::hash::Hash;

use crate::trace::ReasoningStep;

/// Upper bounds of the five confidence buckets. The last bucket is closed.
pub const CONFIDENCE_BUCKETS: [(f64, f64, &str); 5] = [
    (0.0, 0.3, "0.0-0.3"),
    (0.3, 0.5, "0.3-0.5"),
    (0.5, 0.7, "0.5-0.7"),
    (0.7, 0.9, "0.7-0.9"),
    (0.9, 1.0, "0.9-1.0"),
];

/// Words ignored when mining reasoning text.
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "that", "this", "with", "from", "are", "was", "were", "will", "would",
    "should", "could", "can", "have", "has", "had", "not", "but", "all", "any", "its", "it's",
    "into", "than", "then", "there", "their", "they", "them", "these", "those", "which", "what",
    "when", "where", "who", "why", "how", "been", "being", "because", "also", "more", "most",
    "such", "only", "other", "some", "very", "our", "you", "your", "use", "used", "using", "may",
    "might", "must", "each", "per", "via", "over", "under", "about", "after", "before", "both",
    "does", "did", "doing", "just", "like", "make", "made", "need", "needs",
];

/// Index of the confidence bucket for `confidence`.
///
/// Buckets are `[0,.3) [.3,.5) [.5,.7) [.7,.9) [.9,1.0]`; values outside
/// `[0,1]` fall into the nearest end bucket.
pub fn bucket_index(confidence: f64) -> usize {
    CONFIDENCE_BUCKETS[..4]
        .iter()
        .position(|(_, upper, _)| confidence < *upper)
        .unwrap_or(4)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Population variance.
pub fn variance(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    Some(values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64)
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> Option<f64> {
    variance(values).map(f64::sqrt)
}

/// Jaccard index of two sets; 0.0 when both are empty.
pub fn jaccard<T: Eq + Hash>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Lowercased whitespace-separated words.
pub fn word_set(text: &str) -> HashSet<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}

/// Content terms of a reasoning text: lowercased alphanumeric runs of at
/// least three characters that are not stopwords.
pub fn content_terms(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .map(|w| w.trim_matches('\''))
        .filter(|w| w.chars().count() >= 3 && !STOPWORDS.contains(w))
        .filter(|w| !w.chars().all(char::is_numeric))
        .map(str::to_string)
        .collect()
}

/// Weighted similarity between two decisions, in `[0, 1]`.
///
/// 0.3 level match, 0.3 type match, 0.2 decision-point word overlap,
/// 0.1 confidence proximity, 0.1 context key overlap.
pub fn decision_similarity(reference: &ReasoningStep, candidate: &ReasoningStep) -> f64 {
    let mut score = 0.0;
    if reference.decision_level == candidate.decision_level {
        score += 0.3;
    }
    if reference.reasoning_type == candidate.reasoning_type {
        score += 0.3;
    }

    score += 0.2
        * jaccard(
            &word_set(&reference.decision_point),
            &word_set(&candidate.decision_point),
        );

    let confidence_gap = (reference.confidence_score - candidate.confidence_score).abs();
    score += 0.1 * (1.0 - confidence_gap).max(0.0);

    let reference_keys: HashSet<&String> = reference.context.keys().collect();
    let candidate_keys: HashSet<&String> = candidate.context.keys().collect();
    score += 0.1 * jaccard(&reference_keys, &candidate_keys);

    score
}
