//! Knowledge graph (Core 1, half two): typed entities and weighted edges.
//!
//! Entities are `skill`, `tool` or `keyword` nodes; edges are `CONTAINS`
//! (skill → tool) or `RELATED_TO` (tool ↔ keyword, tool ↔ tool).
//! Registration is idempotent and re-registration never lowers an
//! existing edge weight.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Entity type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Skill,
    Tool,
    Keyword,
}

/// Edge label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeType {
    Contains,
    RelatedTo,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub name: String,
    pub entity_type: EntityType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub edge_type: EdgeType,
    pub weight: f64,
}

/// In-memory knowledge graph.
#[derive(Debug, Default)]
pub struct KnowledgeGraph {
    entities: HashMap<String, Entity>,
    edges: HashMap<(String, String, EdgeType), f64>,
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entity; returns `true` when it was new.
    pub fn add_entity(&mut self, name: &str, entity_type: EntityType) -> bool {
        if self.entities.contains_key(name) {
            return false;
        }
        self.entities.insert(
            name.to_string(),
            Entity {
                name: name.to_string(),
                entity_type,
            },
        );
        true
    }

    /// Add (or strengthen) an edge.  An existing edge keeps its weight
    /// when it is already higher.  Returns `true` when the edge was new.
    pub fn add_edge(&mut self, from: &str, to: &str, edge_type: EdgeType, weight: f64) -> bool {
        let key = (from.to_string(), to.to_string(), edge_type);
        match self.edges.get_mut(&key) {
            Some(existing) => {
                if weight > *existing {
                    *existing = weight;
                }
                false
            }
            None => {
                self.edges.insert(key, weight);
                true
            }
        }
    }

    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.entities.get(name)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Edge weight if present (direction-sensitive).
    pub fn edge_weight(&self, from: &str, to: &str, edge_type: EdgeType) -> Option<f64> {
        self.edges
            .get(&(from.to_string(), to.to_string(), edge_type))
            .copied()
    }

    /// Substring entity search, case-insensitive, name-sorted.
    pub fn search_entities(&self, query: &str, limit: usize) -> Vec<&Entity> {
        let q = query.to_lowercase();
        if q.is_empty() {
            return Vec::new();
        }
        let mut hits: Vec<&Entity> = self
            .entities
            .values()
            .filter(|e| e.name.to_lowercase().contains(&q))
            .collect();
        hits.sort_by(|a, b| a.name.cmp(&b.name));
        hits.truncate(limit);
        hits
    }

    /// Neighbours of an entity across both edge directions.
    pub fn related(&self, name: &str) -> Vec<(&str, EdgeType, f64)> {
        let mut out = Vec::new();
        for ((from, to, ty), weight) in &self.edges {
            if from == name {
                out.push((to.as_str(), *ty, *weight));
            } else if to == name {
                out.push((from.as_str(), *ty, *weight));
            }
        }
        out.sort_by(|a, b| a.0.cmp(b.0));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_entity_idempotent() {
        let mut kg = KnowledgeGraph::new();
        assert!(kg.add_entity("git", EntityType::Skill));
        assert!(!kg.add_entity("git", EntityType::Skill));
        assert_eq!(kg.entity_count(), 1);
    }

    #[test]
    fn add_edge_keeps_higher_weight() {
        let mut kg = KnowledgeGraph::new();
        kg.add_entity("a", EntityType::Tool);
        kg.add_entity("b", EntityType::Tool);
        assert!(kg.add_edge("a", "b", EdgeType::RelatedTo, 0.9));
        assert!(!kg.add_edge("a", "b", EdgeType::RelatedTo, 0.3));
        assert_eq!(kg.edge_weight("a", "b", EdgeType::RelatedTo), Some(0.9));
        // A higher re-registration raises the weight.
        kg.add_edge("a", "b", EdgeType::RelatedTo, 1.0);
        assert_eq!(kg.edge_weight("a", "b", EdgeType::RelatedTo), Some(1.0));
    }

    #[test]
    fn search_is_substring_and_sorted() {
        let mut kg = KnowledgeGraph::new();
        kg.add_entity("git.status", EntityType::Tool);
        kg.add_entity("git.commit", EntityType::Tool);
        kg.add_entity("testing.run_tests", EntityType::Tool);
        let hits = kg.search_entities("git", 10);
        let names: Vec<&str> = hits.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["git.commit", "git.status"]);
    }

    #[test]
    fn related_walks_both_directions() {
        let mut kg = KnowledgeGraph::new();
        kg.add_edge("git", "git.status", EdgeType::Contains, 1.0);
        kg.add_edge("vcs", "git", EdgeType::RelatedTo, 0.5);
        let related = kg.related("git");
        assert_eq!(related.len(), 2);
    }
}
