//! Persistent vector store over named collections.
//!
//! SQLite-backed: embeddings live as little-endian f32 BLOBs scanned with
//! cosine distance, and each collection carries a companion FTS5 table for
//! the BM25 keyword core of hybrid search.  Rows returned to callers are
//! validated against the canonical payload schemas before they leave the
//! store — a malformed row is an error, never a silent pass-through.

pub mod embedder;
pub mod payloads;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};
use serde::Deserialize;
use tracing::debug;

use crate::config::RouterSearchConfig;
use crate::errors::{ErrorKind, OmniError};
use crate::search::{self, FusionParams, RankKeys};
use payloads::{
    Confidence, HybridPayload, ToolSearchPayload, VectorPayload, HYBRID_SCHEMA_V1,
    TOOL_SEARCH_SCHEMA_V1, VECTOR_SCHEMA_V1,
};

// ── Search options ──────────────────────────────────────────

/// Scan tuning knobs accepted as `options_json`.
///
/// Missing fields take the scanner defaults (1024 / 4 / 16 / unlimited).
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct SearchOptions {
    /// Metadata equality filter (`{"category": "read"}`).
    #[serde(default)]
    pub where_filter: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub fragment_readahead: Option<u32>,
    #[serde(default)]
    pub batch_readahead: Option<u32>,
    #[serde(default)]
    pub scan_limit: Option<u64>,
}

impl SearchOptions {
    pub const DEFAULT_BATCH_SIZE: u32 = 1024;
    pub const DEFAULT_FRAGMENT_READAHEAD: u32 = 4;
    pub const DEFAULT_BATCH_READAHEAD: u32 = 16;

    /// Parse and bounds-check an `options_json` string.
    pub fn parse(options_json: Option<&str>, request_kind: ErrorKind) -> Result<Self, OmniError> {
        let opts: SearchOptions = match options_json {
            None => SearchOptions::default(),
            Some(raw) if raw.trim().is_empty() => SearchOptions::default(),
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| OmniError::new(request_kind, format!("options: {e}")))?,
        };
        opts.validate(request_kind)?;
        Ok(opts)
    }

    fn validate(&self, kind: ErrorKind) -> Result<(), OmniError> {
        check_range(self.batch_size, 1, 1 << 16, "batch_size", kind)?;
        check_range(self.fragment_readahead, 1, 256, "fragment_readahead", kind)?;
        check_range(self.batch_readahead, 1, 1024, "batch_readahead", kind)?;
        check_range(self.scan_limit, 1, 1_000_000, "scan_limit", kind)?;
        Ok(())
    }
}

fn check_range<T: Into<u64> + Copy>(
    value: Option<T>,
    min: u64,
    max: u64,
    name: &str,
    kind: ErrorKind,
) -> Result<(), OmniError> {
    if let Some(v) = value {
        let v: u64 = v.into();
        if v < min || v > max {
            return Err(OmniError::new(
                kind,
                format!("{name} must be in [{min}, {max}], got {v}"),
            ));
        }
    }
    Ok(())
}

/// Error kinds for one search family (plain vs. hybrid quartet).
#[derive(Clone, Copy)]
struct Kinds {
    request: ErrorKind,
    table: ErrorKind,
    runtime: ErrorKind,
}

const VECTOR_KINDS: Kinds = Kinds {
    request: ErrorKind::VectorRequestValidation,
    table: ErrorKind::VectorTableNotFound,
    runtime: ErrorKind::VectorRuntimeError,
};

const HYBRID_KINDS: Kinds = Kinds {
    request: ErrorKind::VectorHybridRequestValidation,
    table: ErrorKind::VectorHybridTableNotFound,
    runtime: ErrorKind::VectorRuntimeError,
};

// ── Store ───────────────────────────────────────────────────

/// One scanned candidate row (pre-fusion).
struct Candidate {
    id: String,
    content: String,
    metadata: serde_json::Map<String, serde_json::Value>,
    vector_sim: f64,
    bm25: f64,
}

/// Append-mostly vector store.  Writers serialize on the connection;
/// readers observe a consistent snapshot per call.
pub struct VectorStore {
    conn: Mutex<Connection>,
}

impl VectorStore {
    /// Open (or create) the store database under `dir`.
    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Self::open_path(&dir.join("vector.db"))
    }

    /// Open a database at an explicit path (useful for tests).
    pub fn open_path(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS collections (
                name TEXT PRIMARY KEY,
                dim  INTEGER NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS collections (
                name TEXT PRIMARY KEY,
                dim  INTEGER NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── Write path ──────────────────────────────────────────

    /// Append rows to a collection (created on first write).
    ///
    /// The caller supplies embeddings; all four slices must have the same
    /// length, every metadata entry must be a JSON object without the
    /// legacy `keywords` key, and vector dimensionality must match the
    /// collection's established dimension.
    pub fn add(
        &self,
        collection: &str,
        ids: &[String],
        vectors: &[Vec<f32>],
        documents: &[String],
        metadatas: &[serde_json::Value],
    ) -> Result<(), OmniError> {
        validate_collection_name(collection, VECTOR_KINDS.request)?;
        if ids.len() != vectors.len() || ids.len() != documents.len() || ids.len() != metadatas.len()
        {
            return Err(OmniError::new(
                VECTOR_KINDS.request,
                "ids, vectors, documents and metadatas must have equal length",
            ));
        }
        for meta in metadatas {
            let obj = meta.as_object().ok_or_else(|| {
                OmniError::new(VECTOR_KINDS.request, "metadata must be a JSON object")
            })?;
            if obj.contains_key("keywords") {
                return Err(OmniError::new(
                    VECTOR_KINDS.request,
                    "legacy 'keywords' metadata is forbidden; use routing_keywords",
                ));
            }
        }

        let conn = self.conn.lock().expect("vector store poisoned");

        // Establish or verify the collection dimension.
        let dim: Option<i64> = conn
            .query_row(
                "SELECT dim FROM collections WHERE name = ?1",
                params![collection],
                |r| r.get(0),
            )
            .map(Some)
            .or_else(ignore_no_rows)
            .map_err(runtime_err(VECTOR_KINDS))?;

        let incoming_dim = vectors.first().map(|v| v.len()).unwrap_or(0);
        match dim {
            Some(d) if vectors.iter().any(|v| v.len() != d as usize) => {
                return Err(OmniError::new(
                    VECTOR_KINDS.request,
                    format!("embedding dimension mismatch: collection expects {d}"),
                ));
            }
            Some(_) => {}
            None => {
                if vectors.iter().any(|v| v.len() != incoming_dim) || incoming_dim == 0 {
                    return Err(OmniError::new(
                        VECTOR_KINDS.request,
                        "embeddings must be non-empty and uniform in dimension",
                    ));
                }
                ensure_collection(&conn, collection, incoming_dim)
                    .map_err(runtime_err(VECTOR_KINDS))?;
            }
        }

        let table = table_name(collection);
        let fts = fts_name(collection);
        let tx_result: rusqlite::Result<()> = (|| {
            conn.execute_batch("BEGIN")?;
            for (((id, vector), document), metadata) in ids
                .iter()
                .zip(vectors.iter())
                .zip(documents.iter())
                .zip(metadatas.iter())
            {
                let blob = embedding_to_blob(vector);
                let meta_json = metadata.to_string();
                conn.execute(
                    &format!(
                        "INSERT OR REPLACE INTO {table} (id, content, metadata, embedding) \
                         VALUES (?1, ?2, ?3, ?4)"
                    ),
                    params![id, document, meta_json, blob],
                )?;
                conn.execute(&format!("DELETE FROM {fts} WHERE id = ?1"), params![id])?;
                conn.execute(
                    &format!("INSERT INTO {fts} (id, content) VALUES (?1, ?2)"),
                    params![id, document],
                )?;
            }
            conn.execute_batch("COMMIT")?;
            Ok(())
        })();
        tx_result.map_err(|e| {
            let _ = conn.execute_batch("ROLLBACK");
            OmniError::new(VECTOR_KINDS.runtime, e.to_string())
        })?;
        debug!(collection, rows = ids.len(), "vector rows appended");
        Ok(())
    }

    // ── Read path ───────────────────────────────────────────

    /// Nearest-neighbour search; rows come back as validated
    /// [`VectorPayload`]s with cosine distance.
    pub fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        options_json: Option<&str>,
    ) -> Result<Vec<VectorPayload>, OmniError> {
        let kinds = VECTOR_KINDS;
        validate_collection_name(collection, kinds.request)?;
        validate_limit(limit, kinds.request)?;
        let options = SearchOptions::parse(options_json, kinds.request)?;

        let conn = self.conn.lock().expect("vector store poisoned");
        require_collection(&conn, collection, kinds)?;
        let candidates = scan_candidates(&conn, collection, Some(vector), None, &options, kinds)?;

        let mut rows: Vec<&Candidate> = candidates.iter().collect();
        rows.sort_by(|a, b| {
            b.vector_sim
                .partial_cmp(&a.vector_sim)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        rows.truncate(limit);

        rows.into_iter()
            .map(|c| {
                let value = serde_json::json!({
                    "id": c.id,
                    "content": c.content,
                    "metadata": c.metadata,
                    "distance": 1.0 - c.vector_sim,
                    "score": c.vector_sim,
                    "schema": VECTOR_SCHEMA_V1,
                });
                VectorPayload::validate(&value)
            })
            .collect()
    }

    /// Hybrid (vector + BM25) search with weighted-RRF fusion.
    pub fn hybrid_search(
        &self,
        collection: &str,
        query_text: &str,
        vector: &[f32],
        limit: usize,
        options_json: Option<&str>,
        fusion: &FusionParams,
    ) -> Result<Vec<HybridPayload>, OmniError> {
        let kinds = HYBRID_KINDS;
        validate_collection_name(collection, kinds.request)?;
        validate_limit(limit, kinds.request)?;
        let options = SearchOptions::parse(options_json, kinds.request)?;

        let conn = self.conn.lock().expect("vector store poisoned");
        require_collection(&conn, collection, kinds)?;
        let candidates =
            scan_candidates(&conn, collection, Some(vector), Some(query_text), &options, kinds)?;

        let fused = fuse(&candidates, fusion);
        let mut out = Vec::new();
        for (candidate, fused_score, _final) in fused.into_iter().take(limit) {
            let value = serde_json::json!({
                "id": candidate.id,
                "content": candidate.content,
                "metadata": candidate.metadata,
                "vector_score": candidate.vector_sim.max(0.0),
                "keyword_score": candidate.bm25,
                "score": fused_score,
                "source": "hybrid",
                "schema": HYBRID_SCHEMA_V1,
            });
            out.push(HybridPayload::validate(&value)?);
        }
        Ok(out)
    }

    /// Tool search: hybrid fusion plus field boosts and confidence
    /// bucketing over a collection of tool-index rows.
    ///
    /// Rows below the active profile's `low_floor` are dropped.
    pub fn tool_search(
        &self,
        collection: &str,
        query_text: &str,
        vector: &[f32],
        limit: usize,
        options_json: Option<&str>,
        cfg: &RouterSearchConfig,
        fusion: &FusionParams,
    ) -> Result<Vec<ToolSearchPayload>, OmniError> {
        let kinds = VECTOR_KINDS;
        validate_collection_name(collection, kinds.request)?;
        validate_limit(limit, kinds.request)?;
        let options = SearchOptions::parse(options_json, kinds.request)?;

        let conn = self.conn.lock().expect("vector store poisoned");
        require_collection(&conn, collection, kinds)?;
        let candidates =
            scan_candidates(&conn, collection, Some(vector), Some(query_text), &options, kinds)?;
        drop(conn);

        let fused = fuse(&candidates, fusion);
        let profile = cfg.active();

        let mut hits: Vec<(ToolSearchPayload, RankKeys)> = Vec::new();
        for (candidate, fused_score, _blend) in fused {
            let meta = &candidate.metadata;
            let tool_name = meta
                .get("tool_name")
                .and_then(|v| v.as_str())
                .unwrap_or(&candidate.id)
                .to_string();
            let routing_keywords = string_list(meta.get("routing_keywords"));
            let intents = string_list(meta.get("intents"));
            let description = meta
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();

            let lexical = search::lexical_score(
                query_text,
                &tool_name,
                &description,
                &routing_keywords,
                &intents,
                &fusion.field_boosting,
            );
            let vector_score = candidate.vector_sim.max(0.0);
            let total_weight = fusion.semantic_weight + fusion.keyword_weight;
            let final_score = if total_weight > 0.0 {
                ((fusion.semantic_weight * vector_score + fusion.keyword_weight * lexical)
                    / total_weight)
                    .clamp(0.0, 1.0)
            } else {
                0.0
            };

            let Some(confidence) = search::bucket_confidence(final_score, &profile) else {
                continue;
            };

            let value = serde_json::json!({
                "schema": TOOL_SEARCH_SCHEMA_V1,
                "name": meta.get("name").and_then(|v| v.as_str())
                    .unwrap_or_else(|| tool_name.split('.').next_back().unwrap_or(&tool_name)),
                "description": description,
                "input_schema": meta.get("input_schema").cloned()
                    .unwrap_or_else(|| serde_json::json!({})),
                "score": fused_score,
                "vector_score": vector_score,
                "keyword_score": lexical,
                "final_score": final_score,
                "confidence": confidence,
                "skill_name": meta.get("skill_name").and_then(|v| v.as_str()).unwrap_or_default(),
                "tool_name": tool_name,
                "file_path": meta.get("file_path").and_then(|v| v.as_str()).unwrap_or_default(),
                "routing_keywords": routing_keywords,
                "intents": intents,
                "category": meta.get("category").and_then(|v| v.as_str()).unwrap_or_default(),
            });
            let payload = ToolSearchPayload::validate(&value)?;
            let keys = RankKeys {
                final_score,
                lexical,
                vector: vector_score,
                tool_name: payload.tool_name.clone(),
            };
            hits.push((payload, keys));
        }

        hits.sort_by(|a, b| search::compare_hits(&a.1, &b.1));
        hits.truncate(limit);
        Ok(hits.into_iter().map(|(p, _)| p).collect())
    }

    /// Delete rows by id.
    pub fn delete(&self, collection: &str, ids: &[String]) -> Result<usize, OmniError> {
        validate_collection_name(collection, VECTOR_KINDS.request)?;
        let conn = self.conn.lock().expect("vector store poisoned");
        require_collection(&conn, collection, VECTOR_KINDS)?;
        let table = table_name(collection);
        let fts = fts_name(collection);
        let mut deleted = 0usize;
        for id in ids {
            deleted += conn
                .execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![id])
                .map_err(runtime_err(VECTOR_KINDS))?;
            conn.execute(&format!("DELETE FROM {fts} WHERE id = ?1"), params![id])
                .map_err(runtime_err(VECTOR_KINDS))?;
        }
        Ok(deleted)
    }

    /// Row count for a collection.
    pub fn count(&self, collection: &str) -> Result<usize, OmniError> {
        validate_collection_name(collection, VECTOR_KINDS.request)?;
        let conn = self.conn.lock().expect("vector store poisoned");
        require_collection(&conn, collection, VECTOR_KINDS)?;
        let table = table_name(collection);
        let count: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            .map_err(runtime_err(VECTOR_KINDS))?;
        Ok(count as usize)
    }

    /// Optimize the collection's FTS index.
    pub fn create_index(&self, collection: &str) -> Result<(), OmniError> {
        validate_collection_name(collection, VECTOR_KINDS.request)?;
        let conn = self.conn.lock().expect("vector store poisoned");
        require_collection(&conn, collection, VECTOR_KINDS)?;
        let fts = fts_name(collection);
        conn.execute(
            &format!("INSERT INTO {fts} ({fts}) VALUES ('optimize')"),
            [],
        )
        .map_err(runtime_err(VECTOR_KINDS))?;
        Ok(())
    }

    /// Drop a collection and its FTS companion.
    pub fn drop_table(&self, collection: &str) -> Result<(), OmniError> {
        validate_collection_name(collection, VECTOR_KINDS.request)?;
        let conn = self.conn.lock().expect("vector store poisoned");
        require_collection(&conn, collection, VECTOR_KINDS)?;
        let table = table_name(collection);
        let fts = fts_name(collection);
        conn.execute_batch(&format!(
            "DROP TABLE IF EXISTS {table}; DROP TABLE IF EXISTS {fts};"
        ))
        .map_err(runtime_err(VECTOR_KINDS))?;
        conn.execute(
            "DELETE FROM collections WHERE name = ?1",
            params![collection],
        )
        .map_err(runtime_err(VECTOR_KINDS))?;
        Ok(())
    }

    /// Every row in a collection as a validated [`VectorPayload`]
    /// (distance 0 — no query vector involved).
    pub fn list_all(&self, collection: &str) -> Result<Vec<VectorPayload>, OmniError> {
        validate_collection_name(collection, VECTOR_KINDS.request)?;
        let conn = self.conn.lock().expect("vector store poisoned");
        require_collection(&conn, collection, VECTOR_KINDS)?;
        let options = SearchOptions::default();
        let candidates = scan_candidates(&conn, collection, None, None, &options, VECTOR_KINDS)?;
        candidates
            .into_iter()
            .map(|c| {
                let value = serde_json::json!({
                    "id": c.id,
                    "content": c.content,
                    "metadata": c.metadata,
                    "distance": 0.0,
                    "schema": VECTOR_SCHEMA_V1,
                });
                VectorPayload::validate(&value)
            })
            .collect()
    }

    /// Raw metadata audit: ids of rows carrying the forbidden legacy
    /// `keywords` key.  Bypasses the write-path validation on purpose —
    /// this is how `omni db validate-schema` finds historical violations.
    pub fn audit_legacy_keywords(&self, collection: &str) -> Result<Vec<String>, OmniError> {
        validate_collection_name(collection, VECTOR_KINDS.request)?;
        let conn = self.conn.lock().expect("vector store poisoned");
        require_collection(&conn, collection, VECTOR_KINDS)?;
        let options = SearchOptions::default();
        let candidates = scan_candidates(&conn, collection, None, None, &options, VECTOR_KINDS)?;
        Ok(candidates
            .into_iter()
            .filter(|c| c.metadata.contains_key("keywords"))
            .map(|c| c.id)
            .collect())
    }

    /// True when the collection has been created.
    pub fn collection_exists(&self, collection: &str) -> bool {
        let conn = self.conn.lock().expect("vector store poisoned");
        conn.query_row(
            "SELECT 1 FROM collections WHERE name = ?1",
            params![collection],
            |_| Ok(()),
        )
        .is_ok()
    }
}

// ── Internals ───────────────────────────────────────────────

fn validate_collection_name(name: &str, kind: ErrorKind) -> Result<(), OmniError> {
    if name.is_empty() {
        return Err(OmniError::new(kind, "collection name must be non-empty"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(OmniError::new(
            kind,
            format!("collection name must be [A-Za-z0-9_]: {name}"),
        ));
    }
    Ok(())
}

fn validate_limit(limit: usize, kind: ErrorKind) -> Result<(), OmniError> {
    if !(1..=1000).contains(&limit) {
        return Err(OmniError::new(
            kind,
            format!("n_results must be in [1, 1000], got {limit}"),
        ));
    }
    Ok(())
}

fn table_name(collection: &str) -> String {
    format!("coll_{collection}")
}

fn fts_name(collection: &str) -> String {
    format!("coll_{collection}_fts")
}

fn ensure_collection(conn: &Connection, collection: &str, dim: usize) -> rusqlite::Result<()> {
    let table = table_name(collection);
    let fts = fts_name(collection);
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id        TEXT PRIMARY KEY,
            content   TEXT NOT NULL,
            metadata  TEXT NOT NULL DEFAULT '{{}}',
            embedding BLOB NOT NULL
        );
        CREATE VIRTUAL TABLE IF NOT EXISTS {fts} USING fts5(id UNINDEXED, content);"
    ))?;
    conn.execute(
        "INSERT OR REPLACE INTO collections (name, dim) VALUES (?1, ?2)",
        params![collection, dim as i64],
    )?;
    Ok(())
}

fn require_collection(conn: &Connection, collection: &str, kinds: Kinds) -> Result<(), OmniError> {
    let exists: bool = conn
        .query_row(
            "SELECT 1 FROM collections WHERE name = ?1",
            params![collection],
            |_| Ok(true),
        )
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(false),
            other => Err(other),
        })
        .map_err(runtime_err(kinds))?;
    if !exists {
        return Err(OmniError::new(
            kinds.table,
            format!("no such collection: {collection}"),
        ));
    }
    Ok(())
}

fn runtime_err(kinds: Kinds) -> impl Fn(rusqlite::Error) -> OmniError {
    move |e| OmniError::new(kinds.runtime, e.to_string())
}

fn ignore_no_rows<T>(e: rusqlite::Error) -> rusqlite::Result<Option<T>> {
    match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    }
}

/// Scan a collection: cosine similarity against `vector` (when given) and
/// BM25 ranks for `query_text` (when given), with the metadata filter and
/// scan limit applied.
fn scan_candidates(
    conn: &Connection,
    collection: &str,
    vector: Option<&[f32]>,
    query_text: Option<&str>,
    options: &SearchOptions,
    kinds: Kinds,
) -> Result<Vec<Candidate>, OmniError> {
    let table = table_name(collection);
    let scan_limit = options.scan_limit.unwrap_or(u64::MAX);

    // BM25 pass first: id → normalized keyword score.
    let mut bm25: HashMap<String, f64> = HashMap::new();
    if let Some(query) = query_text {
        let fts = fts_name(collection);
        let fts_query = fts_sanitize(query);
        if !fts_query.is_empty() {
            let sql = format!(
                "SELECT id, bm25({fts}) FROM {fts} WHERE {fts} MATCH ?1 ORDER BY bm25({fts}) LIMIT 256"
            );
            let mut stmt = conn.prepare(&sql).map_err(runtime_err(kinds))?;
            let rows = stmt
                .query_map(params![fts_query], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
                })
                .map_err(runtime_err(kinds))?;
            let mut raw: Vec<(String, f64)> = Vec::new();
            for row in rows {
                let (id, rank) = row.map_err(runtime_err(kinds))?;
                raw.push((id, -rank)); // bm25() is lower-is-better
            }
            let max = raw.iter().map(|(_, s)| *s).fold(0.0f64, f64::max);
            if max > 0.0 {
                for (id, s) in raw {
                    bm25.insert(id, (s / max).clamp(0.0, 1.0));
                }
            }
        }
    }

    let sql = format!("SELECT id, content, metadata, embedding FROM {table} LIMIT ?1");
    let mut stmt = conn.prepare(&sql).map_err(runtime_err(kinds))?;
    let rows = stmt
        .query_map(params![scan_limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Vec<u8>>(3)?,
            ))
        })
        .map_err(runtime_err(kinds))?;

    let mut out = Vec::new();
    for row in rows {
        let (id, content, meta_json, blob) = row.map_err(runtime_err(kinds))?;
        let metadata: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&meta_json).unwrap_or_default();

        if let Some(filter) = &options.where_filter {
            let matches = filter.iter().all(|(k, v)| metadata.get(k) == Some(v));
            if !matches {
                continue;
            }
        }

        let vector_sim = match vector {
            Some(q) => {
                let emb = blob_to_embedding(&blob);
                embedder::cosine_similarity(q, &emb)
            }
            None => 0.0,
        };
        let keyword = bm25.get(&id).copied().unwrap_or(0.0);
        out.push(Candidate {
            id,
            content,
            metadata,
            vector_sim,
            bm25: keyword,
        });
    }
    Ok(out)
}

/// Weighted-RRF fusion of the vector and keyword rankings.
///
/// Returns `(candidate, fused_score ∈ [0,1], blend)` sorted by fused score
/// descending.
fn fuse(candidates: &[Candidate], fusion: &FusionParams) -> Vec<(Candidate, f64, f64)> {
    let mut by_vector: Vec<&Candidate> = candidates.iter().collect();
    by_vector.sort_by(|a, b| {
        b.vector_sim
            .partial_cmp(&a.vector_sim)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    let mut by_keyword: Vec<&Candidate> = candidates.iter().filter(|c| c.bm25 > 0.0).collect();
    by_keyword.sort_by(|a, b| {
        b.bm25
            .partial_cmp(&a.bm25)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });

    let lists = vec![
        (
            fusion.semantic_weight,
            by_vector.iter().map(|c| c.id.clone()).collect::<Vec<_>>(),
        ),
        (
            fusion.keyword_weight,
            by_keyword.iter().map(|c| c.id.clone()).collect::<Vec<_>>(),
        ),
    ];
    let fused = search::rrf_fuse(&lists, fusion.rrf_k);
    let max = search::rrf_max(&lists, fusion.rrf_k);

    let by_id: HashMap<&str, &Candidate> =
        candidates.iter().map(|c| (c.id.as_str(), c)).collect();
    let mut scored: Vec<(Candidate, f64, f64)> = fused
        .into_iter()
        .filter_map(|(id, raw)| {
            let c = by_id.get(id.as_str())?;
            let normalized = if max > 0.0 { raw / max } else { 0.0 };
            let blend = (c.vector_sim.max(0.0) + c.bm25) / 2.0;
            Some((clone_candidate(c), normalized, blend))
        })
        .collect();
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.id.cmp(&b.0.id))
    });
    scored
}

fn clone_candidate(c: &Candidate) -> Candidate {
    Candidate {
        id: c.id.clone(),
        content: c.content.clone(),
        metadata: c.metadata.clone(),
        vector_sim: c.vector_sim,
        bm25: c.bm25,
    }
}

/// Quote each term for FTS5 with prefix matching.
fn fts_sanitize(query: &str) -> String {
    query
        .split_whitespace()
        .map(|w| {
            let clean: String = w.chars().filter(|c| c.is_alphanumeric()).collect();
            format!("\"{clean}\" OR \"{clean}\"*")
        })
        .filter(|s| s.len() > 9) // skip terms that sanitized to nothing
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

/// Serialize an f32 slice to a compact little-endian byte blob.
fn embedding_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Deserialize a byte blob back to an f32 vector.
fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Build the tool-index document + metadata for a [`ToolRecord`].
///
/// Content is the embedding text; metadata carries the canonical
/// tool-search row fields.
pub fn tool_index_row(record: &crate::skills::ToolRecord) -> (String, serde_json::Value) {
    let content = format!(
        "Tool: {} | Description: {} | Keywords: {} | Intents: {}",
        record.tool_name,
        record.description,
        record.routing_keywords.join(" "),
        record.intents.join(" "),
    );
    let metadata = serde_json::json!({
        "name": record.command(),
        "tool_name": record.tool_name,
        "skill_name": record.skill_name,
        "description": record.description,
        "input_schema": record.input_schema,
        "file_path": record.file_path,
        "routing_keywords": record.routing_keywords,
        "intents": record.intents,
        "category": record.category,
    });
    (content, metadata)
}

/// Used by callers that only need distinct confidences for display.
pub fn confidence_label(c: Confidence) -> &'static str {
    match c {
        Confidence::High => "high",
        Confidence::Medium => "medium",
        Confidence::Low => "low",
    }
}
