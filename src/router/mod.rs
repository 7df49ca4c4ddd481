//! Router: free-text query → ranked tool list.
//!
//! Pipeline: semantic cache (the Cortex) → exact LRU cache → hybrid
//! tool search with intent-scaled fusion weights → confidence profile →
//! mission brief.  Cortex writes are fire-and-forget through a bounded
//! queue; on overflow the oldest pending write is silently dropped.
//!
//! When the vector backend is unavailable the router degrades to pure
//! keyword ranking over the kernel's in-memory tool index, marking
//! results `confidence = low`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::{CortexConfig, RouterSearchConfig};
use crate::errors::{ErrorKind, OmniError};
use crate::fusion::compute_fusion_weights;
use crate::kernel::Kernel;
use crate::search::{self, FusionParams};
use crate::vector::embedder::Embedder;
use crate::vector::payloads::{Confidence, ToolSearchPayload, TOOL_SEARCH_SCHEMA_V1};
use crate::vector::VectorStore;

/// Collection of tool-index rows the router searches.
pub const TOOL_SEARCH_COLLECTION: &str = "tool_search";
/// Collection holding past routing decisions (the Cortex).
pub const CORTEX_COLLECTION: &str = "routing_experience";

/// Path fragments a mission brief must never contain — briefs are
/// goal-oriented and path-independent.
const BRIEF_PATH_MARKERS: &[&str] = &[
    "src/",
    "packages/",
    "tests/",
    "scripts/",
    "assets/",
    "node_modules/",
    "../",
];

/// The routing decision for one query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingResult {
    pub selected_tools: Vec<ToolSearchPayload>,
    pub mission_brief: String,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Confidence>,
    pub from_cache: bool,
    pub timestamp: String,
}

/// Validate a mission brief: reject hardcoded path fragments.
pub fn validate_mission_brief(brief: &str) -> Result<(), OmniError> {
    for marker in BRIEF_PATH_MARKERS {
        if brief.contains(marker) {
            return Err(OmniError::new(
                ErrorKind::RouterBriefRejected,
                format!("mission brief contains path fragment '{marker}'"),
            ));
        }
    }
    Ok(())
}

/// Commander's-Intent template: goal-oriented, no procedures, no paths.
fn mission_brief_for(query: &str, tools: &[ToolSearchPayload]) -> String {
    if tools.is_empty() {
        return format!("Goal: {query}. No specialised tooling matched; proceed manually.");
    }
    let names: Vec<&str> = tools.iter().map(|t| t.tool_name.as_str()).collect();
    format!(
        "Goal: {query}. Recommended capabilities: {}. Achieve the outcome; the approach is yours.",
        names.join(", ")
    )
}

// ── Exact cache ─────────────────────────────────────────────

/// Hash-keyed LRU over normalized query strings.
struct ExactCache {
    capacity: usize,
    map: HashMap<String, RoutingResult>,
    order: VecDeque<String>,
}

impl ExactCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &str) -> Option<RoutingResult> {
        let hit = self.map.get(key).cloned();
        if hit.is_some() {
            self.order.retain(|k| k != key);
            self.order.push_back(key.to_string());
        }
        hit
    }

    fn put(&mut self, key: String, value: RoutingResult) {
        if self.map.contains_key(&key) {
            self.order.retain(|k| k != &key);
        } else if self.map.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.map.remove(&evicted);
            }
        }
        self.order.push_back(key.clone());
        self.map.insert(key, value);
    }
}

fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

// ── Cortex write queue ──────────────────────────────────────

struct CortexWrite {
    query: String,
    result: RoutingResult,
}

/// Bounded fire-and-forget queue; overflow drops the oldest pending write.
struct CortexQueue {
    pending: Mutex<VecDeque<CortexWrite>>,
    notify: Notify,
    capacity: usize,
}

impl CortexQueue {
    fn new(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        }
    }

    fn push(&self, write: CortexWrite) {
        let mut pending = self.pending.lock().expect("cortex queue poisoned");
        if pending.len() >= self.capacity {
            pending.pop_front();
        }
        pending.push_back(write);
        drop(pending);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<CortexWrite> {
        self.pending.lock().expect("cortex queue poisoned").pop_front()
    }
}

// ── Router ──────────────────────────────────────────────────

pub struct Router {
    store: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
    kernel: Arc<Kernel>,
    config: RouterSearchConfig,
    cortex: CortexConfig,
    exact: Mutex<ExactCache>,
    queue: Arc<CortexQueue>,
}

impl Router {
    /// Create a router and spawn its cortex write drainer.
    pub fn new(
        store: Arc<VectorStore>,
        embedder: Arc<dyn Embedder>,
        kernel: Arc<Kernel>,
        config: RouterSearchConfig,
        cortex: CortexConfig,
    ) -> Arc<Self> {
        let router = Arc::new(Self {
            exact: Mutex::new(ExactCache::new(cortex.exact_capacity)),
            queue: Arc::new(CortexQueue::new(64)),
            store,
            embedder,
            kernel,
            config,
            cortex,
        });
        router.spawn_drainer();
        router
    }

    pub fn search_config(&self) -> &RouterSearchConfig {
        &self.config
    }

    fn spawn_drainer(self: &Arc<Self>) {
        let router = Arc::downgrade(self);
        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            loop {
                queue.notify.notified().await;
                while let Some(write) = queue.pop() {
                    let Some(router) = router.upgrade() else {
                        return;
                    };
                    router.persist_cortex_entry(&write.query, &write.result);
                }
                if router.upgrade().is_none() {
                    return;
                }
            }
        });
    }

    fn persist_cortex_entry(&self, query: &str, result: &RoutingResult) {
        let vector = match self.embedder.embed(&[query]).into_iter().next() {
            Some(v) => v,
            None => return,
        };
        let Ok(result_json) = serde_json::to_string(result) else {
            return;
        };
        let metadata = serde_json::json!({
            "query": query,
            "result": result_json,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        let id = crate::utils::content_hash(query.as_bytes());
        if let Err(e) = self.store.add(
            CORTEX_COLLECTION,
            &[id],
            &[vector],
            &[query.to_string()],
            &[metadata],
        ) {
            debug!(kind = e.kind.as_str(), "cortex write dropped");
        }
    }

    /// Process every queued cortex write now (tests and shutdown).
    pub fn flush_cortex(&self) {
        while let Some(write) = self.queue.pop() {
            self.persist_cortex_entry(&write.query, &write.result);
        }
    }

    // ── Route pipeline ──────────────────────────────────────

    pub async fn route(&self, query: &str) -> Result<RoutingResult, OmniError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(OmniError::new(
                ErrorKind::RouterNoResults,
                "query must be non-empty",
            ));
        }

        // 1. Semantic cache.
        if let Some(mut cached) = self.cortex_lookup(query) {
            cached.from_cache = true;
            return Ok(cached);
        }

        // 2. Exact cache.
        let norm = normalize_query(query);
        if let Some(mut cached) = self
            .exact
            .lock()
            .expect("exact cache poisoned")
            .get(&norm)
        {
            cached.from_cache = true;
            return Ok(cached);
        }

        // 3. Hybrid search with intent-scaled weights.
        let weights = compute_fusion_weights(query);
        let mut fusion = FusionParams::from(&self.config);
        fusion.semantic_weight *= weights.vector_weight;
        fusion.keyword_weight *= weights.keyword_weight;

        let (selected, degraded) = match self.hybrid_candidates(query, &fusion) {
            Ok(rows) => (rows, false),
            Err(e) => {
                warn!(kind = e.kind.as_str(), "vector backend unavailable, keyword fallback");
                (self.keyword_fallback(query), true)
            }
        };

        // 4. Confidence: low rows are dropped; when nothing remains the
        // result is the empty list with no confidence.  Degraded fallback
        // rows keep their `low` marking instead.
        let selected: Vec<ToolSearchPayload> = if degraded {
            selected
        } else {
            selected
                .into_iter()
                .filter(|t| t.confidence > Confidence::Low)
                .collect()
        };
        let confidence = selected.iter().map(|t| t.confidence).max();

        // 5. Mission brief.
        let mission_brief = mission_brief_for(query, &selected);
        validate_mission_brief(&mission_brief)?;

        let result = RoutingResult {
            reasoning: format!(
                "hybrid search over {} with intent {:?}/{:?}",
                TOOL_SEARCH_COLLECTION, weights.intent_action, weights.intent_target
            ),
            mission_brief,
            selected_tools: selected,
            confidence,
            from_cache: false,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        // Activate the winning skill so its dynamic commands surface.
        if let Some(top) = result.selected_tools.first() {
            if !top.skill_name.is_empty() {
                self.kernel.activate_skill(&top.skill_name);
            }
        }

        // 6. Learn: exact cache now, cortex asynchronously.
        self.exact
            .lock()
            .expect("exact cache poisoned")
            .put(norm, result.clone());
        self.queue.push(CortexWrite {
            query: query.to_string(),
            result: result.clone(),
        });

        Ok(result)
    }

    fn hybrid_candidates(
        &self,
        query: &str,
        fusion: &FusionParams,
    ) -> Result<Vec<ToolSearchPayload>, OmniError> {
        let vector = self
            .embedder
            .embed(&[query])
            .into_iter()
            .next()
            .ok_or_else(|| OmniError::new(ErrorKind::VectorRuntimeError, "embedder failure"))?;
        self.store.tool_search(
            TOOL_SEARCH_COLLECTION,
            query,
            &vector,
            self.config.default_limit.clamp(1, 1000),
            None,
            &self.config,
            fusion,
        )
    }

    /// Pure keyword ranking over the kernel's in-memory index.
    fn keyword_fallback(&self, query: &str) -> Vec<ToolSearchPayload> {
        let boosts = &self.config.field_boosting;
        let mut scored: Vec<(f64, ToolSearchPayload)> = self
            .kernel
            .list_commands()
            .into_iter()
            .filter_map(|command| {
                let score = search::lexical_score(
                    query,
                    &command.tool_name,
                    &command.description,
                    &[],
                    &[],
                    boosts,
                );
                if score <= 0.0 {
                    return None;
                }
                let skill = command
                    .tool_name
                    .split_once('.')
                    .map(|(s, _)| s.to_string())
                    .unwrap_or_default();
                let payload = ToolSearchPayload {
                    schema: TOOL_SEARCH_SCHEMA_V1.to_string(),
                    name: command.name.clone(),
                    description: command.description.clone(),
                    input_schema: command
                        .schema
                        .as_object()
                        .cloned()
                        .unwrap_or_default(),
                    score,
                    vector_score: None,
                    keyword_score: Some(score),
                    final_score: score,
                    confidence: Confidence::Low,
                    skill_name: skill,
                    tool_name: command.tool_name.clone(),
                    file_path: command.file_path.clone(),
                    routing_keywords: Vec::new(),
                    intents: Vec::new(),
                    category: command.category.clone(),
                };
                Some((score, payload))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.tool_name.cmp(&b.1.tool_name))
        });
        scored.truncate(self.config.default_limit);
        scored.into_iter().map(|(_, p)| p).collect()
    }

    /// Semantic-cache lookup: top hit above threshold and within TTL.
    fn cortex_lookup(&self, query: &str) -> Option<RoutingResult> {
        let vector = self.embedder.embed(&[query]).into_iter().next()?;
        let rows = self
            .store
            .search(CORTEX_COLLECTION, &vector, 1, None)
            .ok()?;
        let top = rows.first()?;
        let similarity = top.score.unwrap_or(1.0 - top.distance);
        if similarity < self.cortex.similarity_threshold {
            return None;
        }
        let timestamp = top
            .metadata
            .get("timestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())?;
        let age = chrono::Utc::now().signed_duration_since(timestamp);
        if age > chrono::Duration::days(self.cortex.ttl_days) {
            return None;
        }
        let result_json = top.metadata.get("result")?.as_str()?;
        let result: RoutingResult = serde_json::from_str(result_json).ok()?;
        debug!(similarity, "cortex hit");
        Some(result)
    }
}
