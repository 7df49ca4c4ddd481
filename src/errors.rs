//! Uniform error taxonomy surfaced across public boundaries.
//!
//! Every fallible public operation returns [`OmniError`] carrying a stable
//! [`ErrorKind`] identifier plus a short human message.  Internal plumbing
//! keeps using `anyhow`; the conversion happens at the boundary so raw
//! internal errors never leak.

use serde::{Deserialize, Serialize};

/// Stable error identifiers.  The serialized form (`SCREAMING_SNAKE_CASE`)
/// is part of the wire contract — renaming a variant is a breaking change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ManifestInvalid,
    SkillLoadFailed,
    SkillNotFound,
    CommandNotFound,
    ToolExecFailed,
    VectorRequestValidation,
    VectorBindingApiMissing,
    VectorPayloadValidation,
    VectorTableNotFound,
    VectorRuntimeError,
    VectorHybridRequestValidation,
    VectorHybridBindingApiMissing,
    VectorHybridPayloadValidation,
    VectorHybridTableNotFound,
    RouterNoResults,
    RouterBriefRejected,
    ContextBudgetExceeded,
    MemoryWriteFailed,
    MemoryRecallFailed,
    EvolutionStagnation,
    ImmuneBlocked,
    HomeostasisConflict,
    WorkflowStateMissing,
}

impl ErrorKind {
    /// The stable string identifier (same text as the serde form).
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ManifestInvalid => "MANIFEST_INVALID",
            ErrorKind::SkillLoadFailed => "SKILL_LOAD_FAILED",
            ErrorKind::SkillNotFound => "SKILL_NOT_FOUND",
            ErrorKind::CommandNotFound => "COMMAND_NOT_FOUND",
            ErrorKind::ToolExecFailed => "TOOL_EXEC_FAILED",
            ErrorKind::VectorRequestValidation => "VECTOR_REQUEST_VALIDATION",
            ErrorKind::VectorBindingApiMissing => "VECTOR_BINDING_API_MISSING",
            ErrorKind::VectorPayloadValidation => "VECTOR_PAYLOAD_VALIDATION",
            ErrorKind::VectorTableNotFound => "VECTOR_TABLE_NOT_FOUND",
            ErrorKind::VectorRuntimeError => "VECTOR_RUNTIME_ERROR",
            ErrorKind::VectorHybridRequestValidation => "VECTOR_HYBRID_REQUEST_VALIDATION",
            ErrorKind::VectorHybridBindingApiMissing => "VECTOR_HYBRID_BINDING_API_MISSING",
            ErrorKind::VectorHybridPayloadValidation => "VECTOR_HYBRID_PAYLOAD_VALIDATION",
            ErrorKind::VectorHybridTableNotFound => "VECTOR_HYBRID_TABLE_NOT_FOUND",
            ErrorKind::RouterNoResults => "ROUTER_NO_RESULTS",
            ErrorKind::RouterBriefRejected => "ROUTER_BRIEF_REJECTED",
            ErrorKind::ContextBudgetExceeded => "CONTEXT_BUDGET_EXCEEDED",
            ErrorKind::MemoryWriteFailed => "MEMORY_WRITE_FAILED",
            ErrorKind::MemoryRecallFailed => "MEMORY_RECALL_FAILED",
            ErrorKind::EvolutionStagnation => "EVOLUTION_STAGNATION",
            ErrorKind::ImmuneBlocked => "IMMUNE_BLOCKED",
            ErrorKind::HomeostasisConflict => "HOMEOSTASIS_CONFLICT",
            ErrorKind::WorkflowStateMissing => "WORKFLOW_STATE_MISSING",
        }
    }
}

/// Structured error crossing a public boundary.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{}: {message}", .kind.as_str())]
pub struct OmniError {
    pub kind: ErrorKind,
    pub message: String,
}

impl OmniError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Serialize to the `{"error": {"kind", "message"}}` JSON envelope used
    /// by tool results and CLI output.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "kind": self.kind.as_str(),
                "message": self.message,
            }
        })
    }
}

/// Boundary result alias.
pub type OmniResult<T> = Result<T, OmniError>;
