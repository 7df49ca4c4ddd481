//! Checkpoint persistence: workflow state blobs and chunked sessions.
//!
//! Both stores are plain JSON files under the checkpoint directory.
//! Workflow state is an opaque map keyed by `(workflow_type,
//! workflow_id)`; chunked sessions split an oversized payload into
//! fixed-size batches served one at a time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{ErrorKind, OmniError};

/// Default characters per session batch.
pub const DEFAULT_BATCH_SIZE: usize = 28_000;

// ── Workflow state ──────────────────────────────────────────

/// Opaque per-workflow checkpoint store.
pub struct WorkflowStateStore {
    dir: PathBuf,
}

impl WorkflowStateStore {
    /// A store scoped to one workflow type.
    pub fn new(checkpoint_root: &Path, workflow_type: &str) -> Self {
        Self {
            dir: checkpoint_root.join(workflow_type),
        }
    }

    fn path_for(&self, workflow_id: &str) -> PathBuf {
        self.dir.join(format!("{workflow_id}.json"))
    }

    pub fn save(
        &self,
        workflow_id: &str,
        state: &HashMap<String, serde_json::Value>,
    ) -> Result<(), OmniError> {
        std::fs::create_dir_all(&self.dir).map_err(io_err)?;
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| OmniError::new(ErrorKind::VectorRuntimeError, e.to_string()))?;
        std::fs::write(self.path_for(workflow_id), json).map_err(io_err)?;
        debug!(workflow = workflow_id, "workflow state saved");
        Ok(())
    }

    pub fn load(&self, workflow_id: &str) -> Result<HashMap<String, serde_json::Value>, OmniError> {
        let path = self.path_for(workflow_id);
        let raw = std::fs::read_to_string(&path).map_err(|_| {
            OmniError::new(
                ErrorKind::WorkflowStateMissing,
                format!("no checkpoint for workflow {workflow_id}"),
            )
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            OmniError::new(
                ErrorKind::WorkflowStateMissing,
                format!("corrupt checkpoint for {workflow_id}: {e}"),
            )
        })
    }

    /// Delete a checkpoint; deleting a missing one is a no-op success.
    pub fn delete(&self, workflow_id: &str) -> Result<(), OmniError> {
        match std::fs::remove_file(self.path_for(workflow_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(e)),
        }
    }
}

fn io_err(e: std::io::Error) -> OmniError {
    OmniError::new(ErrorKind::VectorRuntimeError, format!("checkpoint io: {e}"))
}

// ── Chunked sessions ────────────────────────────────────────

/// A payload split into fixed-size batches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkedSession {
    pub session_id: String,
    pub batches: Vec<String>,
    pub batch_size: usize,
    pub total_chars: usize,
}

/// Serves oversized payloads batch by batch.
pub struct ChunkedSessionStore {
    dir: PathBuf,
    batch_size: usize,
}

impl ChunkedSessionStore {
    pub fn new(checkpoint_root: &Path) -> Self {
        Self {
            dir: checkpoint_root.join("chunked_sessions"),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }

    /// Split `content` into batches and persist the session.
    pub fn create(&self, content: &str) -> Result<ChunkedSession, OmniError> {
        let session_id = crate::utils::generate_nonce();
        let mut batches = Vec::new();
        let chars: Vec<char> = content.chars().collect();
        for chunk in chars.chunks(self.batch_size) {
            batches.push(chunk.iter().collect::<String>());
        }
        if batches.is_empty() {
            batches.push(String::new());
        }
        let session = ChunkedSession {
            session_id: session_id.clone(),
            total_chars: chars.len(),
            batch_size: self.batch_size,
            batches,
        };

        std::fs::create_dir_all(&self.dir).map_err(io_err)?;
        let json = serde_json::to_string(&session)
            .map_err(|e| OmniError::new(ErrorKind::VectorRuntimeError, e.to_string()))?;
        std::fs::write(self.path_for(&session_id), json).map_err(io_err)?;
        debug!(session = %session_id, batches = session.batches.len(), "chunked session created");
        Ok(session)
    }

    fn load(&self, session_id: &str) -> Option<ChunkedSession> {
        let raw = std::fs::read_to_string(self.path_for(session_id)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Serve `action=start`: batch 0 plus session totals.
    pub fn start(&self, session_id: &str) -> serde_json::Value {
        match self.load(session_id) {
            Some(session) => serde_json::json!({
                "session_id": session.session_id,
                "action": "start",
                "batch_index": 0,
                "batch_count": session.batches.len(),
                "total_chars": session.total_chars,
                "content": session.batches.first().cloned().unwrap_or_default(),
            }),
            None => unknown_session(session_id),
        }
    }

    /// Serve `action=batch(n)`.
    pub fn batch(&self, session_id: &str, index: usize) -> serde_json::Value {
        let Some(session) = self.load(session_id) else {
            return unknown_session(session_id);
        };
        match session.batches.get(index) {
            Some(content) => serde_json::json!({
                "session_id": session.session_id,
                "action": "batch",
                "batch_index": index,
                "batch_count": session.batches.len(),
                "content": content,
            }),
            None => serde_json::json!({
                "error": {
                    "kind": "BATCH_OUT_OF_RANGE",
                    "message": format!(
                        "batch {index} out of range (0..{})",
                        session.batches.len()
                    ),
                }
            }),
        }
    }
}

fn unknown_session(session_id: &str) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "kind": "UNKNOWN_SESSION",
            "message": format!("no chunked session {session_id}"),
        }
    })
}
