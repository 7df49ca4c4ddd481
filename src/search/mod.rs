//! Hybrid ranking: weighted Reciprocal Rank Fusion plus fielded lexical
//! scoring and confidence bucketing.
//!
//! The functions here are pure — the vector store feeds them candidate
//! rankings and the router feeds them fusion weights.  Graph-proximity
//! rankings from the dual-core bridges enter the same [`rrf_fuse`] call as
//! just another weighted list.

use std::collections::HashMap;

use crate::config::{ConfidenceProfile, FieldBoosting, RouterSearchConfig};
use crate::vector::payloads::Confidence;

/// Weights applied to the individual rankings during RRF fusion.
#[derive(Debug, Clone)]
pub struct FusionParams {
    pub semantic_weight: f64,
    pub keyword_weight: f64,
    /// Optional graph-proximity ranking weight (0 disables).
    pub graph_weight: f64,
    pub rrf_k: f64,
    pub field_boosting: FieldBoosting,
}

impl From<&RouterSearchConfig> for FusionParams {
    fn from(cfg: &RouterSearchConfig) -> Self {
        Self {
            semantic_weight: cfg.semantic_weight,
            keyword_weight: cfg.keyword_weight,
            graph_weight: 0.0,
            rrf_k: cfg.rrf_k,
            field_boosting: cfg.field_boosting.clone(),
        }
    }
}

impl Default for FusionParams {
    fn default() -> Self {
        (&RouterSearchConfig::default()).into()
    }
}

/// Weighted RRF: each candidate at rank `r` (1-based) in list `L`
/// contributes `w_L / (rrf_k + r)`.  Returns the summed score per id.
pub fn rrf_fuse(lists: &[(f64, Vec<String>)], rrf_k: f64) -> HashMap<String, f64> {
    let mut scores: HashMap<String, f64> = HashMap::new();
    for (weight, ids) in lists {
        if *weight == 0.0 {
            continue;
        }
        for (idx, id) in ids.iter().enumerate() {
            let rank = (idx + 1) as f64;
            *scores.entry(id.clone()).or_default() += weight / (rrf_k + rank);
        }
    }
    scores
}

/// The maximum score a candidate ranked first in every list can reach —
/// used to normalize fused scores into `[0, 1]`.
pub fn rrf_max(lists: &[(f64, Vec<String>)], rrf_k: f64) -> f64 {
    lists
        .iter()
        .filter(|(_, ids)| !ids.is_empty())
        .map(|(w, _)| w / (rrf_k + 1.0))
        .sum()
}

// ── Lexical scoring ─────────────────────────────────────────

/// Fielded lexical score over `{name, description, routing_keywords,
/// intents}`, normalized to `[0, 1]`.
///
/// An exact phrase match on the name field yields the maximum score.
/// Name-token hits weigh `name_token_boost` against 1.0 for the other
/// fields, per the configured boosts.
pub fn lexical_score(
    query: &str,
    name: &str,
    description: &str,
    routing_keywords: &[String],
    intents: &[String],
    boosts: &FieldBoosting,
) -> f64 {
    let query_lower = query.trim().to_lowercase();
    if query_lower.is_empty() {
        return 0.0;
    }
    let name_lower = name.to_lowercase();

    // Exact phrase on the name field (either form of the tool id).
    if name_lower == query_lower || name_lower.replace('.', " ") == query_lower {
        return 1.0;
    }

    let terms: Vec<&str> = query_lower.split_whitespace().collect();
    if terms.is_empty() {
        return 0.0;
    }
    let name_tokens: Vec<String> = name_lower
        .split(|c: char| c == '.' || c == '_' || c == '-' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect();
    let desc_lower = description.to_lowercase();

    let mut hit = 0.0f64;
    // Per-term ceiling: a name-token hit is worth `name_token_boost`,
    // everything else 1.0; phrase presence in the name adds the phrase
    // boost once.
    let per_term_max = boosts.name_token_boost.max(1.0) + 2.0;
    for term in &terms {
        let mut term_score = 0.0f64;
        if name_tokens.iter().any(|t| t == term) {
            term_score += boosts.name_token_boost.max(1.0);
        } else if name_tokens.iter().any(|t| t.contains(term)) {
            term_score += boosts.name_token_boost.max(1.0) * 0.5;
        }
        if routing_keywords
            .iter()
            .any(|k| k.to_lowercase().contains(term))
        {
            term_score += 1.0;
        }
        if intents.iter().any(|i| i.to_lowercase().contains(term)) {
            term_score += 0.5;
        }
        if desc_lower.contains(term) {
            term_score += 0.5;
        }
        hit += term_score.min(per_term_max);
    }

    let mut score = hit / (terms.len() as f64 * per_term_max);
    if name_lower.contains(&query_lower) {
        score += boosts.exact_phrase_boost / (boosts.exact_phrase_boost + 4.0) * (1.0 - score);
    }
    score.clamp(0.0, 1.0)
}

// ── Confidence ──────────────────────────────────────────────

/// Bucket a final score by the profile thresholds; `None` means the row
/// falls below `low_floor` and is dropped.
pub fn bucket_confidence(score: f64, profile: &ConfidenceProfile) -> Option<Confidence> {
    if score >= profile.high_threshold {
        Some(Confidence::High)
    } else if score >= profile.medium_threshold {
        Some(Confidence::Medium)
    } else if score >= profile.low_floor {
        Some(Confidence::Low)
    } else {
        None
    }
}

// ── Tie-breaking ────────────────────────────────────────────

/// Scores used to order two hybrid hits deterministically.
#[derive(Debug, Clone, PartialEq)]
pub struct RankKeys {
    pub final_score: f64,
    pub lexical: f64,
    pub vector: f64,
    pub tool_name: String,
}

/// Tie-break order: final score → lexical score → vector score →
/// lexicographic tool name.
pub fn compare_hits(a: &RankKeys, b: &RankKeys) -> std::cmp::Ordering {
    b.final_score
        .partial_cmp(&a.final_score)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| {
            b.lexical
                .partial_cmp(&a.lexical)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .then_with(|| {
            b.vector
                .partial_cmp(&a.vector)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .then_with(|| a.tool_name.cmp(&b.tool_name))
}
