//! Canonical schema contracts for persisted / on-wire vector payloads.
//!
//! Every payload carries its `schema` string; readers reject unrecognized
//! schemas and unknown fields (fail closed).  The derived JSON Schemas are
//! the single source of truth — changing a shape requires a new identifier.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::errors::{ErrorKind, OmniError};

pub const VECTOR_SCHEMA_V1: &str = "omni.vector.search.v1";
pub const HYBRID_SCHEMA_V1: &str = "omni.vector.hybrid.v1";
pub const TOOL_SEARCH_SCHEMA_V1: &str = "omni.vector.tool_search.v1";
pub const ROUTE_TEST_SCHEMA_V1: &str = "omni.router.route_test.v1";

/// Confidence bucket derived from a fused score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Plain vector-search row (`omni.vector.search.v1`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct VectorPayload {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Cosine distance (lower is closer).
    pub distance: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub schema: String,
}

/// Hybrid-search row (`omni.vector.hybrid.v1`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HybridPayload {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword_score: Option<f64>,
    pub score: f64,
    pub source: String,
    pub schema: String,
}

/// Canonical tool-search row (`omni.vector.tool_search.v1`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ToolSearchPayload {
    pub schema: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: serde_json::Map<String, serde_json::Value>,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword_score: Option<f64>,
    pub final_score: f64,
    pub confidence: Confidence,
    #[serde(default)]
    pub skill_name: String,
    pub tool_name: String,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub routing_keywords: Vec<String>,
    #[serde(default)]
    pub intents: Vec<String>,
    #[serde(default)]
    pub category: String,
}

// ── Validation ──────────────────────────────────────────────

fn payload_err(detail: impl std::fmt::Display) -> OmniError {
    OmniError::new(ErrorKind::VectorPayloadValidation, detail.to_string())
}

/// The legacy `keywords` field is forbidden on vector/hybrid rows —
/// routing keywords belong to `tool_search` only.
fn reject_legacy_keywords(
    metadata: &serde_json::Map<String, serde_json::Value>,
) -> Result<(), OmniError> {
    if metadata.contains_key("keywords") {
        return Err(payload_err(
            "legacy 'keywords' field is forbidden; use routing_keywords in tool_search",
        ));
    }
    Ok(())
}

impl VectorPayload {
    /// Strict validation: schema string, non-empty id/content, no legacy
    /// `keywords` metadata.
    pub fn validate(value: &serde_json::Value) -> Result<Self, OmniError> {
        let payload: VectorPayload =
            serde_json::from_value(value.clone()).map_err(payload_err)?;
        if payload.schema != VECTOR_SCHEMA_V1 {
            return Err(payload_err(format!(
                "unsupported vector schema: {}",
                payload.schema
            )));
        }
        if payload.id.is_empty() || payload.content.is_empty() {
            return Err(payload_err("id and content must be non-empty"));
        }
        reject_legacy_keywords(&payload.metadata)?;
        Ok(payload)
    }
}

impl HybridPayload {
    pub fn validate(value: &serde_json::Value) -> Result<Self, OmniError> {
        let payload: HybridPayload = serde_json::from_value(value.clone()).map_err(|e| {
            OmniError::new(ErrorKind::VectorHybridPayloadValidation, e.to_string())
        })?;
        if payload.schema != HYBRID_SCHEMA_V1 {
            return Err(OmniError::new(
                ErrorKind::VectorHybridPayloadValidation,
                format!("unsupported hybrid schema: {}", payload.schema),
            ));
        }
        if payload.id.is_empty() || payload.content.is_empty() {
            return Err(OmniError::new(
                ErrorKind::VectorHybridPayloadValidation,
                "id and content must be non-empty",
            ));
        }
        if payload.source != "hybrid" {
            return Err(OmniError::new(
                ErrorKind::VectorHybridPayloadValidation,
                format!("unexpected source: {}", payload.source),
            ));
        }
        if payload.metadata.contains_key("keywords") {
            return Err(OmniError::new(
                ErrorKind::VectorHybridPayloadValidation,
                "legacy 'keywords' field is forbidden; use routing_keywords in tool_search",
            ));
        }
        Ok(payload)
    }
}

impl ToolSearchPayload {
    pub fn validate(value: &serde_json::Value) -> Result<Self, OmniError> {
        let payload: ToolSearchPayload =
            serde_json::from_value(value.clone()).map_err(payload_err)?;
        if payload.schema != TOOL_SEARCH_SCHEMA_V1 {
            return Err(payload_err(format!(
                "unsupported tool search schema: {}",
                payload.schema
            )));
        }
        if payload.name.is_empty() || payload.tool_name.is_empty() {
            return Err(payload_err("name and tool_name must be non-empty"));
        }
        Ok(payload)
    }
}

/// JSON Schema for a payload kind (the `omni db validate-schema` anchor).
pub fn payload_json_schema(kind: &str) -> Option<serde_json::Value> {
    let schema = match kind {
        VECTOR_SCHEMA_V1 => schemars::schema_for!(VectorPayload),
        HYBRID_SCHEMA_V1 => schemars::schema_for!(HybridPayload),
        TOOL_SEARCH_SCHEMA_V1 => schemars::schema_for!(ToolSearchPayload),
        _ => return None,
    };
    serde_json::to_value(schema).ok()
}
