//! Episodic memory: durable `InteractionLog`s recalled at task start and
//! written at task end.
//!
//! Storage is the `memory` collection in the vector store, one document
//! per log.  The embedded text concatenates query, reflection and the
//! optional error so semantic recall matches on all three.

pub mod interceptor;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{ErrorKind, OmniError};
use crate::vector::embedder::Embedder;
use crate::vector::VectorStore;

/// Collection holding the episodic log.
pub const MEMORY_COLLECTION: &str = "memory";

/// Task outcome recorded on a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

/// One episodic memory record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InteractionLog {
    pub id: String,
    pub timestamp: String,
    pub user_query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<String>,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    /// Free-text synthesized lesson.
    pub reflection: String,
}

impl InteractionLog {
    /// The text embedded for semantic recall.
    pub fn document_text(&self) -> String {
        let mut text = format!(
            "Query: {}\nReflection: {}",
            self.user_query, self.reflection
        );
        if let Some(error) = &self.error_msg {
            text.push_str(&format!("\n[Error: {error}]"));
        }
        text
    }

    /// Compact single-line summary for prompt injection.
    pub fn to_summary(&self) -> String {
        let marker = match self.outcome {
            Outcome::Success => "✓",
            Outcome::Failure => "✗",
        };
        format!(
            "{marker} {} → {}",
            crate::utils::truncate_str(&self.user_query, 80),
            crate::utils::truncate_str(&self.reflection, 160),
        )
    }
}

/// Episodic memory manager over the vector store.
pub struct MemoryManager {
    store: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
}

impl MemoryManager {
    pub fn new(store: Arc<VectorStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    /// Record a new experience; returns the new record id.
    pub fn add_experience(
        &self,
        user_query: &str,
        tool_calls: Vec<String>,
        outcome: Outcome,
        reflection: &str,
        error_msg: Option<String>,
        session_id: Option<String>,
    ) -> Result<String, OmniError> {
        let log = InteractionLog {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            user_query: user_query.to_string(),
            session_id,
            tool_calls,
            outcome,
            error_msg,
            reflection: reflection.to_string(),
        };
        let document = log.document_text();
        let vector = self
            .embedder
            .embed(&[document.as_str()])
            .into_iter()
            .next()
            .ok_or_else(|| OmniError::new(ErrorKind::MemoryWriteFailed, "embedder returned nothing"))?;
        let metadata = serde_json::to_value(&log)
            .map_err(|e| OmniError::new(ErrorKind::MemoryWriteFailed, e.to_string()))?;

        self.store
            .add(
                MEMORY_COLLECTION,
                &[log.id.clone()],
                &[vector],
                &[document],
                &[metadata],
            )
            .map_err(|e| OmniError::new(ErrorKind::MemoryWriteFailed, e.message))?;

        debug!(id = %log.id, outcome = ?outcome, "experience recorded");
        Ok(log.id)
    }

    /// Retrieve relevant past experiences, deduplicated by id and
    /// optionally filtered by outcome.  An unavailable store degrades
    /// to an empty list.
    pub fn recall(
        &self,
        query: &str,
        limit: usize,
        outcome_filter: Option<Outcome>,
    ) -> Vec<InteractionLog> {
        let vector = match self.embedder.embed(&[query]).into_iter().next() {
            Some(v) => v,
            None => return Vec::new(),
        };
        // Over-fetch so post-filtering can still fill the limit.
        let fetch = (limit * 2).clamp(1, 1000);
        let rows = match self.store.search(MEMORY_COLLECTION, &vector, fetch, None) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(kind = e.kind.as_str(), "memory recall degraded to empty");
                return Vec::new();
            }
        };

        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for row in rows {
            if out.len() >= limit {
                break;
            }
            if !seen.insert(row.id.clone()) {
                continue;
            }
            let log = match reconstruct(&row) {
                Some(log) => log,
                None => continue,
            };
            if let Some(filter) = outcome_filter {
                if log.outcome != filter {
                    continue;
                }
            }
            out.push(log);
        }
        out
    }

    /// Most recent memories regardless of content.
    pub fn get_recent(&self, limit: usize) -> Vec<InteractionLog> {
        let rows = match self.store.list_all(MEMORY_COLLECTION) {
            Ok(rows) => rows,
            Err(_) => return Vec::new(),
        };
        let mut logs: Vec<InteractionLog> = rows.iter().filter_map(reconstruct).collect();
        logs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        logs.truncate(limit);
        logs
    }

    /// Total recorded experiences.
    pub fn count(&self) -> usize {
        self.store.count(MEMORY_COLLECTION).unwrap_or(0)
    }
}

/// Rebuild a log from structured metadata, falling back to the text body.
fn reconstruct(row: &crate::vector::payloads::VectorPayload) -> Option<InteractionLog> {
    let metadata = serde_json::Value::Object(row.metadata.clone());
    if metadata.get("user_query").is_some() {
        if let Ok(log) = serde_json::from_value::<InteractionLog>(metadata) {
            return Some(log);
        }
    }
    // Fallback: the document text alone.
    Some(InteractionLog {
        id: row.id.clone(),
        timestamp: String::new(),
        user_query: "Retrieved from memory".to_string(),
        session_id: None,
        tool_calls: Vec::new(),
        outcome: Outcome::Success,
        error_msg: None,
        reflection: crate::utils::truncate_str(&row.content, 500),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::embedder::HashEmbedder;

    fn manager() -> MemoryManager {
        let store = Arc::new(VectorStore::open_in_memory().unwrap());
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(64));
        MemoryManager::new(store, embedder)
    }

    #[test]
    fn add_and_count() {
        let mm = manager();
        let id = mm
            .add_experience(
                "run the tests",
                vec!["testing.run_tests".into()],
                Outcome::Success,
                "pytest worked",
                None,
                None,
            )
            .unwrap();
        assert!(!id.is_empty());
        assert_eq!(mm.count(), 1);
    }

    #[test]
    fn recall_finds_relevant_experience() {
        let mm = manager();
        mm.add_experience(
            "run the unit tests",
            vec!["testing.run_tests".into()],
            Outcome::Success,
            "pytest with maxfail works well",
            None,
            None,
        )
        .unwrap();
        mm.add_experience(
            "commit my changes",
            vec!["git.commit".into()],
            Outcome::Success,
            "staged then committed",
            None,
            None,
        )
        .unwrap();

        let memories = mm.recall("execute the unit tests", 1, None);
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].user_query, "run the unit tests");
        assert_eq!(memories[0].tool_calls, vec!["testing.run_tests"]);
    }

    #[test]
    fn recall_outcome_filter() {
        let mm = manager();
        mm.add_experience(
            "deploy the service",
            vec!["deploy.run".into()],
            Outcome::Failure,
            "failed: permission denied",
            Some("permission denied".into()),
            None,
        )
        .unwrap();
        mm.add_experience(
            "deploy the service again",
            vec!["deploy.run".into()],
            Outcome::Success,
            "worked after chmod",
            None,
            None,
        )
        .unwrap();

        let failures = mm.recall("deploy", 5, Some(Outcome::Failure));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].outcome, Outcome::Failure);
        assert!(failures[0].error_msg.is_some());
    }

    #[test]
    fn recall_on_empty_store_degrades_to_empty() {
        let mm = manager();
        assert!(mm.recall("anything", 3, None).is_empty());
    }

    #[test]
    fn get_recent_orders_by_timestamp() {
        let mm = manager();
        for i in 0..5 {
            mm.add_experience(
                &format!("task number {i}"),
                vec![],
                Outcome::Success,
                "done",
                None,
                None,
            )
            .unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let recent = mm.get_recent(3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].user_query, "task number 4");
    }

    #[test]
    fn document_text_includes_error() {
        let log = InteractionLog {
            id: "x".into(),
            timestamp: String::new(),
            user_query: "q".into(),
            session_id: None,
            tool_calls: vec![],
            outcome: Outcome::Failure,
            error_msg: Some("boom".into()),
            reflection: "r".into(),
        };
        let text = log.document_text();
        assert!(text.contains("Query: q"));
        assert!(text.contains("Reflection: r"));
        assert!(text.contains("[Error: boom]"));
    }

    #[test]
    fn summary_marks_outcome() {
        let log = InteractionLog {
            id: "x".into(),
            timestamp: String::new(),
            user_query: "q".into(),
            session_id: None,
            tool_calls: vec![],
            outcome: Outcome::Success,
            error_msg: None,
            reflection: "lesson".into(),
        };
        assert!(log.to_summary().starts_with('✓'));
    }
}
