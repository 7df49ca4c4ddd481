//! Dual-core fusion: bridges between the note/knowledge graphs (Core 1)
//! and the vector store (Core 2).
//!
//! Four independent, individually optional bridges:
//! 1. link-proximity boost for recall results,
//! 2. a vector-search function shaped for graph consumption,
//! 3. entity-graph enrichment of the tool relationship graph,
//! 4. idempotent entity registration on skill-index sync.
//!
//! Plus [`compute_fusion_weights`]: a lightweight intent classifier that
//! scales the hybrid-search weights per query.  Every bridge degrades to
//! a no-op when its backend is unavailable.

pub mod knowledge;
pub mod notegraph;

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::vector::embedder::Embedder;
use crate::vector::VectorStore;
use knowledge::{EdgeType, EntityType, KnowledgeGraph};
use notegraph::NoteGraph;

/// Additive score boost for recall hits adjacent in the note graph.
pub const ZK_LINK_PROXIMITY_BOOST: f64 = 0.05;

/// Default weight for tool↔tool edges discovered via shared entities.
const SHARED_ENTITY_EDGE_WEIGHT: f64 = 0.5;

// ── B1: link-proximity boost ────────────────────────────────

/// A scored note-shaped result (memory recall, knowledge search).
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredNote {
    pub stem: String,
    pub score: f64,
}

/// Boost results whose note is linked (either direction) to another hit,
/// then re-sort descending.  Unavailable graph → input unchanged.
pub fn boost_linked_results(mut results: Vec<ScoredNote>, graph: &NoteGraph) -> Vec<ScoredNote> {
    if !graph.is_available() || results.len() < 2 {
        return results;
    }
    let stems: HashSet<String> = results.iter().map(|r| r.stem.clone()).collect();
    for result in results.iter_mut() {
        let neighbors = graph.neighbors(&result.stem);
        if neighbors.iter().any(|n| stems.contains(n)) {
            result.score += ZK_LINK_PROXIMITY_BOOST;
        }
    }
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.stem.cmp(&b.stem))
    });
    results
}

// ── B2: vector search for graph queries ─────────────────────

/// A vector hit shaped for the note graph's consumption.
#[derive(Debug, Clone, Serialize)]
pub struct GraphVectorHit {
    pub id: String,
    pub filename_stem: String,
    pub score: f64,
    pub source: &'static str,
}

/// Vector-search handle the note graph calls to find semantically
/// similar notes.
pub struct GraphVectorSearch {
    store: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
    collection: String,
}

impl GraphVectorSearch {
    pub fn new(store: Arc<VectorStore>, embedder: Arc<dyn Embedder>, collection: String) -> Self {
        Self {
            store,
            embedder,
            collection,
        }
    }

    /// Search; failures yield an empty list (the graph treats the vector
    /// core as optional).
    pub fn search(&self, query: &str, limit: usize) -> Vec<GraphVectorHit> {
        let vector = match self.embedder.embed(&[query]).into_iter().next() {
            Some(v) => v,
            None => return Vec::new(),
        };
        match self.store.search(&self.collection, &vector, limit.max(1), None) {
            Ok(rows) => rows
                .into_iter()
                .map(|row| {
                    let stem = row
                        .id
                        .rsplit('/')
                        .next()
                        .unwrap_or(&row.id)
                        .trim_end_matches(".md")
                        .to_string();
                    GraphVectorHit {
                        score: row.score.unwrap_or(1.0 - row.distance),
                        id: row.id,
                        filename_stem: stem,
                        source: "vector",
                    }
                })
                .collect(),
            Err(e) => {
                debug!(error = %e, "graph vector search unavailable, returning empty");
                Vec::new()
            }
        }
    }
}

// ── B3: entity-graph enrichment ─────────────────────────────

/// Add `RELATED_TO` edges between tools that share at least one entity
/// (matched via entity search on the tool's name parts).  Existing
/// higher-weight edges are preserved.  Returns the number of new edges.
pub fn enrich_tool_graph(kg: &mut KnowledgeGraph, tool_ids: &[String]) -> usize {
    let mut added = 0usize;
    for (i, a) in tool_ids.iter().enumerate() {
        let a_entities = shared_entities(kg, a);
        for b in tool_ids.iter().skip(i + 1) {
            if a == b {
                continue;
            }
            let b_entities = shared_entities(kg, b);
            if a_entities.intersection(&b_entities).next().is_some()
                && kg.add_edge(a, b, EdgeType::RelatedTo, SHARED_ENTITY_EDGE_WEIGHT)
            {
                added += 1;
            }
        }
    }
    added
}

/// Entities matching any name part of a tool id (skill, command, tokens).
fn shared_entities(kg: &KnowledgeGraph, tool_id: &str) -> HashSet<String> {
    let mut out = HashSet::new();
    for part in tool_id.split(['.', '_', '-']) {
        if part.len() < 3 {
            continue;
        }
        for entity in kg.search_entities(part, 16) {
            // A tool trivially matches itself; relationships need a
            // genuinely shared third entity.
            if entity.name != tool_id {
                out.insert(entity.name.clone());
            }
        }
    }
    out
}

// ── B4: entity registration ─────────────────────────────────

/// One skill's registration document.
#[derive(Debug, Clone)]
pub struct SkillDoc {
    pub skill_name: String,
    pub tool_names: Vec<String>,
    pub keywords: Vec<String>,
}

/// Register skills, tools and keywords as entities plus their containment
/// and relation edges.  Idempotent: a second sync with unchanged docs adds
/// zero entities.  Returns the number of newly added entities.
pub fn register_skill_entities(kg: &mut KnowledgeGraph, docs: &[SkillDoc]) -> usize {
    let mut added = 0usize;
    for doc in docs {
        if kg.add_entity(&doc.skill_name, EntityType::Skill) {
            added += 1;
        }
        for tool in &doc.tool_names {
            if kg.add_entity(tool, EntityType::Tool) {
                added += 1;
            }
            kg.add_edge(&doc.skill_name, tool, EdgeType::Contains, 1.0);
        }
        for keyword in &doc.keywords {
            if kg.add_entity(keyword, EntityType::Keyword) {
                added += 1;
            }
            for tool in &doc.tool_names {
                kg.add_edge(tool, keyword, EdgeType::RelatedTo, 0.8);
            }
        }
    }
    debug!(added, docs = docs.len(), "skill entities registered");
    added
}

// ── Dynamic fusion weights ──────────────────────────────────

/// Intent-scaled weights for one query.
#[derive(Debug, Clone, PartialEq)]
pub struct FusionWeights {
    pub zk_proximity_scale: f64,
    pub kg_rerank_scale: f64,
    pub vector_weight: f64,
    pub keyword_weight: f64,
    pub intent_action: Option<String>,
    pub intent_target: Option<String>,
    pub intent_keywords: Vec<String>,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            zk_proximity_scale: 1.0,
            kg_rerank_scale: 1.0,
            vector_weight: 1.0,
            keyword_weight: 1.0,
            intent_action: None,
            intent_target: None,
            intent_keywords: Vec::new(),
        }
    }
}

const ACTION_LEXICON: &[(&str, &[&str])] = &[
    ("commit", &["commit", "push", "merge"]),
    ("search", &["search", "look", "lookup"]),
    ("find", &["find", "grep", "locate"]),
    ("research", &["research", "investigate", "explore"]),
];

const TARGET_LEXICON: &[(&str, &[&str])] = &[
    ("git", &["git", "repo", "repository", "branch", "staged"]),
    (
        "knowledge",
        &["knowledge", "note", "notes", "doc", "docs", "zettel", "wiki"],
    ),
    (
        "code",
        &["code", "codebase", "function", "class", "module", "source"],
    ),
];

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "for", "to", "in", "of", "my", "me", "about", "with", "on", "and", "is",
    "are", "that", "this",
];

/// Classify `(action, target)` and scale the fusion weights accordingly.
///
/// Absent or intent-free queries return balanced weights (all 1.0).
pub fn compute_fusion_weights(query: &str) -> FusionWeights {
    let mut weights = FusionWeights::default();
    let tokens: Vec<String> = query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect();
    if tokens.is_empty() {
        return weights;
    }

    let action = ACTION_LEXICON.iter().find_map(|(label, words)| {
        tokens
            .iter()
            .any(|t| words.contains(&t.as_str()))
            .then(|| label.to_string())
    });
    let target = TARGET_LEXICON.iter().find_map(|(label, words)| {
        tokens
            .iter()
            .any(|t| words.contains(&t.as_str()))
            .then(|| label.to_string())
    });

    let lexicon_words: HashSet<&str> = ACTION_LEXICON
        .iter()
        .chain(TARGET_LEXICON.iter())
        .flat_map(|(_, words)| words.iter().copied())
        .collect();
    weights.intent_keywords = tokens
        .iter()
        .filter(|t| !STOPWORDS.contains(&t.as_str()) && !lexicon_words.contains(t.as_str()))
        .cloned()
        .collect();

    match target.as_deref() {
        Some("knowledge") => {
            weights.zk_proximity_scale = 1.5;
            weights.kg_rerank_scale = 1.3;
        }
        Some("code") => {
            weights.vector_weight = 1.3;
            weights.zk_proximity_scale = 0.8;
        }
        Some("git") => {
            weights.keyword_weight = 1.4;
        }
        _ => {}
    }
    match action.as_deref() {
        Some("commit") => {
            weights.keyword_weight = weights.keyword_weight.max(1.4);
        }
        Some("research") => {
            weights.kg_rerank_scale = weights.kg_rerank_scale.max(1.5);
            weights.zk_proximity_scale = weights.zk_proximity_scale.max(1.2);
        }
        _ => {}
    }

    weights.intent_action = action;
    weights.intent_target = target;
    weights
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::embedder::HashEmbedder;

    // ── B1 ──────────────────────────────────────────────────

    #[test]
    fn boost_passthrough_on_empty_and_single() {
        let graph = NoteGraph::default();
        assert!(boost_linked_results(Vec::new(), &graph).is_empty());
        let one = vec![ScoredNote {
            stem: "a".into(),
            score: 0.5,
        }];
        assert_eq!(boost_linked_results(one.clone(), &graph), one);
    }

    #[test]
    fn boost_passthrough_when_graph_unavailable() {
        let graph = NoteGraph::load(std::path::Path::new("/nonexistent"));
        let results = vec![
            ScoredNote {
                stem: "a".into(),
                score: 0.9,
            },
            ScoredNote {
                stem: "b".into(),
                score: 0.5,
            },
        ];
        assert_eq!(boost_linked_results(results.clone(), &graph), results);
    }

    #[test]
    fn linked_documents_get_boosted_and_resorted() {
        let mut graph = NoteGraph::default();
        graph.index_note("alpha", "see [[beta]]");
        graph.index_note("beta", "");
        graph.index_note("lonely", "");

        let results = vec![
            ScoredNote {
                stem: "lonely".into(),
                score: 0.52,
            },
            ScoredNote {
                stem: "alpha".into(),
                score: 0.50,
            },
            ScoredNote {
                stem: "beta".into(),
                score: 0.48,
            },
        ];
        let boosted = boost_linked_results(results, &graph);
        // alpha and beta gain the proximity boost; alpha overtakes lonely.
        assert_eq!(boosted[0].stem, "alpha");
        assert!((boosted[0].score - 0.55).abs() < 1e-9);
        assert!(boosted
            .iter()
            .find(|r| r.stem == "lonely")
            .map(|r| (r.score - 0.52).abs() < 1e-9)
            .unwrap());
    }

    // ── B2 ──────────────────────────────────────────────────

    #[test]
    fn graph_vector_search_returns_shaped_rows() {
        let store = Arc::new(VectorStore::open_in_memory().unwrap());
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(32));
        let docs = vec!["notes about rust ownership".to_string()];
        let vectors = embedder.embed(&["notes about rust ownership"]);
        store
            .add(
                "notes",
                &["ownership.md".to_string()],
                &vectors,
                &docs,
                &[serde_json::json!({})],
            )
            .unwrap();

        let search = GraphVectorSearch::new(store, embedder, "notes".into());
        let hits = search.search("rust ownership", 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].filename_stem, "ownership");
        assert_eq!(hits[0].source, "vector");
    }

    #[test]
    fn graph_vector_search_empty_on_missing_collection() {
        let store = Arc::new(VectorStore::open_in_memory().unwrap());
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(32));
        let search = GraphVectorSearch::new(store, embedder, "ghost".into());
        assert!(search.search("anything", 5).is_empty());
    }

    // ── B3 ──────────────────────────────────────────────────

    #[test]
    fn enrich_links_tools_sharing_entities() {
        let mut kg = KnowledgeGraph::new();
        let tools = vec!["git.commit".to_string(), "git.status".to_string()];
        register_skill_entities(
            &mut kg,
            &[SkillDoc {
                skill_name: "git".into(),
                tool_names: tools.clone(),
                keywords: vec!["vcs".into()],
            }],
        );
        let added = enrich_tool_graph(&mut kg, &tools);
        assert!(added >= 1);
        assert!(kg
            .edge_weight("git.commit", "git.status", EdgeType::RelatedTo)
            .is_some());
    }

    #[test]
    fn enrich_preserves_higher_existing_weight() {
        let mut kg = KnowledgeGraph::new();
        let tools = vec!["git.commit".to_string(), "git.status".to_string()];
        register_skill_entities(
            &mut kg,
            &[SkillDoc {
                skill_name: "git".into(),
                tool_names: tools.clone(),
                keywords: vec![],
            }],
        );
        kg.add_edge("git.commit", "git.status", EdgeType::RelatedTo, 0.95);
        enrich_tool_graph(&mut kg, &tools);
        assert_eq!(
            kg.edge_weight("git.commit", "git.status", EdgeType::RelatedTo),
            Some(0.95)
        );
    }

    #[test]
    fn enrich_empty_graph_is_noop() {
        let mut kg = KnowledgeGraph::new();
        assert_eq!(enrich_tool_graph(&mut kg, &["a.b".to_string()]), 0);
    }

    // ── B4 ──────────────────────────────────────────────────

    fn sample_docs() -> Vec<SkillDoc> {
        vec![SkillDoc {
            skill_name: "git".into(),
            tool_names: vec!["git.status".into(), "git.commit".into()],
            keywords: vec!["vcs".into(), "version-control".into()],
        }]
    }

    #[test]
    fn register_creates_entities_and_edges() {
        let mut kg = KnowledgeGraph::new();
        let added = register_skill_entities(&mut kg, &sample_docs());
        // 1 skill + 2 tools + 2 keywords.
        assert_eq!(added, 5);
        assert_eq!(
            kg.edge_weight("git", "git.status", EdgeType::Contains),
            Some(1.0)
        );
        assert!(kg.edge_weight("git.status", "vcs", EdgeType::RelatedTo).is_some());
    }

    #[test]
    fn register_is_idempotent() {
        let mut kg = KnowledgeGraph::new();
        register_skill_entities(&mut kg, &sample_docs());
        let second = register_skill_entities(&mut kg, &sample_docs());
        assert_eq!(second, 0);
    }

    // ── Fusion weights ──────────────────────────────────────

    #[test]
    fn empty_query_returns_balanced() {
        let w = compute_fusion_weights("");
        assert_eq!(w, FusionWeights::default());
    }

    #[test]
    fn knowledge_query_boosts_zk() {
        let w = compute_fusion_weights("search for knowledge about rust patterns");
        assert!(w.zk_proximity_scale > 1.0);
        assert!(w.kg_rerank_scale > 1.0);
        assert_eq!(w.intent_target.as_deref(), Some("knowledge"));
    }

    #[test]
    fn code_query_boosts_vector() {
        let w = compute_fusion_weights("find the function in the codebase");
        assert!(w.vector_weight >= 1.0);
        assert!(w.zk_proximity_scale <= 1.0);
        assert_eq!(w.intent_target.as_deref(), Some("code"));
    }

    #[test]
    fn git_commit_favors_keyword_routing() {
        let w = compute_fusion_weights("commit my changes to git");
        assert!(w.keyword_weight >= 1.0);
        assert_eq!(w.intent_action.as_deref(), Some("commit"));
        assert_eq!(w.intent_target.as_deref(), Some("git"));
    }

    #[test]
    fn research_query_emphasizes_graph() {
        let w = compute_fusion_weights("research about LanceDB architecture");
        assert!(w.kg_rerank_scale >= 1.0);
        assert_eq!(w.intent_action.as_deref(), Some("research"));
    }

    #[test]
    fn intent_keywords_propagated() {
        let w = compute_fusion_weights("search python async patterns in code");
        assert!(w.intent_keywords.contains(&"python".to_string()));
        assert!(w.intent_keywords.contains(&"async".to_string()));
        // Lexicon words are excluded from the keyword list.
        assert!(!w.intent_keywords.contains(&"search".to_string()));
    }
}
