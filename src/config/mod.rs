//! Kernel configuration loaded from `config.yaml`.
//!
//! Covers the skills root, router search tuning (fusion weights, confidence
//! profiles), cortex cache knobs, agent-loop limits, evolution thresholds and
//! homeostasis policy.  Unknown top-level keys are rejected so typos fail
//! loudly instead of silently falling back to defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ── Router search ────────────────────────────────────────────

/// Field boosts applied by the lexical scorer.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FieldBoosting {
    /// Boost when a query token matches a token of the tool name.
    #[serde(default = "default_name_token_boost")]
    pub name_token_boost: f64,
    /// Boost when the whole query matches the tool name exactly.
    #[serde(default = "default_exact_phrase_boost")]
    pub exact_phrase_boost: f64,
}

fn default_name_token_boost() -> f64 {
    2.0
}
fn default_exact_phrase_boost() -> f64 {
    4.0
}

impl Default for FieldBoosting {
    fn default() -> Self {
        Self {
            name_token_boost: default_name_token_boost(),
            exact_phrase_boost: default_exact_phrase_boost(),
        }
    }
}

/// A named confidence profile: thresholds on the fused final score.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ConfidenceProfile {
    pub high_threshold: f64,
    pub medium_threshold: f64,
    pub low_floor: f64,
}

impl Default for ConfidenceProfile {
    fn default() -> Self {
        Self {
            high_threshold: 0.75,
            medium_threshold: 0.45,
            low_floor: 0.15,
        }
    }
}

/// Router search tuning (fusion weights, RRF constant, profiles).
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RouterSearchConfig {
    /// Name of the active confidence profile.
    #[serde(default = "default_profile_name")]
    pub active_profile: String,
    /// Default number of rows a route query returns.
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    /// Default score threshold when a profile is missing.
    #[serde(default = "default_threshold")]
    pub default_threshold: f64,
    /// Named confidence profiles.
    #[serde(default = "default_profiles")]
    pub profiles: HashMap<String, ConfidenceProfile>,
    /// Weight of the semantic (vector) ranking in RRF fusion.
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f64,
    /// Weight of the lexical (BM25/keyword) ranking in RRF fusion.
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,
    /// RRF rank constant `k` in `w / (k + rank)`.
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    #[serde(default)]
    pub field_boosting: FieldBoosting,
}

fn default_profile_name() -> String {
    "balanced".into()
}
fn default_limit() -> usize {
    5
}
fn default_threshold() -> f64 {
    0.15
}
fn default_semantic_weight() -> f64 {
    1.0
}
fn default_keyword_weight() -> f64 {
    1.0
}
fn default_rrf_k() -> f64 {
    60.0
}
fn default_profiles() -> HashMap<String, ConfidenceProfile> {
    let mut m = HashMap::new();
    m.insert("balanced".to_string(), ConfidenceProfile::default());
    m.insert(
        "strict".to_string(),
        ConfidenceProfile {
            high_threshold: 0.85,
            medium_threshold: 0.6,
            low_floor: 0.3,
        },
    );
    m
}

impl Default for RouterSearchConfig {
    fn default() -> Self {
        Self {
            active_profile: default_profile_name(),
            default_limit: default_limit(),
            default_threshold: default_threshold(),
            profiles: default_profiles(),
            semantic_weight: default_semantic_weight(),
            keyword_weight: default_keyword_weight(),
            rrf_k: default_rrf_k(),
            field_boosting: FieldBoosting::default(),
        }
    }
}

impl RouterSearchConfig {
    /// Resolve the active profile, falling back to the built-in default
    /// thresholds when the configured name is missing.
    pub fn active(&self) -> ConfidenceProfile {
        self.profiles
            .get(&self.active_profile)
            .cloned()
            .unwrap_or_default()
    }

    /// JSON Schema for this config, printed by `omni route schema`.
    pub fn json_schema() -> serde_json::Value {
        let schema = schemars::schema_for!(RouterSearchConfig);
        serde_json::to_value(schema).unwrap_or_default()
    }
}

// ── Cortex (semantic routing cache) ──────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CortexConfig {
    /// Cosine similarity above which a past routing decision is reused.
    #[serde(default = "default_cortex_threshold")]
    pub similarity_threshold: f64,
    /// Cached decisions older than this are ignored.
    #[serde(default = "default_cortex_ttl_days")]
    pub ttl_days: i64,
    /// Capacity of the exact-match LRU in front of the semantic cache.
    #[serde(default = "default_exact_capacity")]
    pub exact_capacity: usize,
}

fn default_cortex_threshold() -> f64 {
    0.75
}
fn default_cortex_ttl_days() -> i64 {
    7
}
fn default_exact_capacity() -> usize {
    256
}

impl Default for CortexConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_cortex_threshold(),
            ttl_days: default_cortex_ttl_days(),
            exact_capacity: default_exact_capacity(),
        }
    }
}

// ── Agent loop ───────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Context window in tokens.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Tokens reserved for the model's output.
    #[serde(default = "default_output_reserve")]
    pub output_reserve: usize,
    /// Full user/assistant pairs retained before pruning.
    #[serde(default = "default_retained_turns")]
    pub retained_turns: usize,
    /// Tool invocations allowed per task.
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: usize,
    /// Consecutive tool failures before the task aborts.
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: usize,
    /// Tool schemas passed to the LLM per call.
    #[serde(default = "default_max_tool_schemas")]
    pub max_tool_schemas: usize,
    /// Hide single-purpose atomic tools from the schema list.
    #[serde(default = "default_true")]
    pub suppress_atomic_tools: bool,
    /// Replace pruned turns with an LLM-generated summary turn.
    #[serde(default)]
    pub auto_summarize: bool,
}

fn default_max_tokens() -> usize {
    128_000
}
fn default_output_reserve() -> usize {
    4_096
}
fn default_retained_turns() -> usize {
    10
}
fn default_max_tool_calls() -> usize {
    20
}
fn default_max_consecutive_errors() -> usize {
    3
}
fn default_max_tool_schemas() -> usize {
    20
}
fn default_true() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            output_reserve: default_output_reserve(),
            retained_turns: default_retained_turns(),
            max_tool_calls: default_max_tool_calls(),
            max_consecutive_errors: default_max_consecutive_errors(),
            max_tool_schemas: default_max_tool_schemas(),
            suppress_atomic_tools: true,
            auto_summarize: false,
        }
    }
}

// ── Evolution ────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EvolutionConfig {
    /// Minimum traces sharing a pattern before it becomes a candidate.
    #[serde(default = "default_min_trace_frequency")]
    pub min_trace_frequency: usize,
    /// Minimum success rate for a candidate.
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,
    /// Trace retention window in hours.
    #[serde(default = "default_trace_ttl_hours")]
    pub trace_ttl_hours: i64,
    /// Hard cap on retained traces (newest win).
    #[serde(default = "default_max_traces")]
    pub max_traces: usize,
    /// Synthesize quarantine skills automatically.
    #[serde(default)]
    pub auto_crystallize: bool,
}

fn default_min_trace_frequency() -> usize {
    3
}
fn default_min_success_rate() -> f64 {
    0.8
}
fn default_trace_ttl_hours() -> i64 {
    24
}
fn default_max_traces() -> usize {
    1000
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            min_trace_frequency: default_min_trace_frequency(),
            min_success_rate: default_min_success_rate(),
            trace_ttl_hours: default_trace_ttl_hours(),
            max_traces: default_max_traces(),
            auto_crystallize: false,
        }
    }
}

// ── Homeostasis ──────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HomeostasisConfig {
    /// Branch merged from / rolled back to.
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default = "default_true")]
    pub auto_merge_on_success: bool,
    #[serde(default = "default_true")]
    pub auto_rollback_on_failure: bool,
}

fn default_base_branch() -> String {
    "main".into()
}

impl Default for HomeostasisConfig {
    fn default() -> Self {
        Self {
            base_branch: default_base_branch(),
            auto_merge_on_success: true,
            auto_rollback_on_failure: true,
        }
    }
}

// ── Top-level config ─────────────────────────────────────────

/// Top-level configuration loaded from `config.yaml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Skills tree root (default `assets/skills`).
    #[serde(default = "default_skills_path")]
    pub skills_path: PathBuf,
    /// Quarantine directory for crystallized candidate skills.
    #[serde(default = "default_quarantine_path")]
    pub quarantine_path: PathBuf,
    /// Vector store directory.
    #[serde(default = "default_vector_path")]
    pub vector_path: PathBuf,
    /// Checkpoint directory for workflow state.
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,
    /// Parallel skill loads during `load_all`.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_loads: usize,
    #[serde(default)]
    pub router: RouterSearchConfig,
    #[serde(default)]
    pub cortex: CortexConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub evolution: EvolutionConfig,
    #[serde(default)]
    pub homeostasis: HomeostasisConfig,
}

fn default_skills_path() -> PathBuf {
    PathBuf::from("assets/skills")
}
fn default_quarantine_path() -> PathBuf {
    PathBuf::from("assets/quarantine")
}
fn default_vector_path() -> PathBuf {
    PathBuf::from("data/vector")
}
fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("data/checkpoints")
}
fn default_max_concurrent() -> usize {
    4
}

impl Default for Config {
    fn default() -> Self {
        Self {
            skills_path: default_skills_path(),
            quarantine_path: default_quarantine_path(),
            vector_path: default_vector_path(),
            checkpoint_path: default_checkpoint_path(),
            max_concurrent_loads: default_max_concurrent(),
            router: RouterSearchConfig::default(),
            cortex: CortexConfig::default(),
            agent: AgentConfig::default(),
            evolution: EvolutionConfig::default(),
            homeostasis: HomeostasisConfig::default(),
        }
    }
}

impl Config {
    /// Read and parse a YAML configuration file.
    ///
    /// A missing file falls back to `<omni_home>/config.yaml` when the path
    /// is the relative default, then to built-in defaults.
    pub async fn load(path: &Path) -> anyhow::Result<Config> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let filename = path.file_name().and_then(|f| f.to_str());
                if filename == Some("config.yaml") && path.is_relative() {
                    let home_path = crate::omni_home().join("config.yaml");
                    match tokio::fs::read_to_string(&home_path).await {
                        Ok(c) => {
                            tracing::debug!(
                                attempted = %path.display(),
                                found = %home_path.display(),
                                "config file not found, falling back to omni home"
                            );
                            c
                        }
                        Err(_) => {
                            tracing::debug!("no config file found, using defaults");
                            return Ok(Config::default());
                        }
                    }
                } else {
                    tracing::debug!(path = %path.display(), "no config file found, using defaults");
                    return Ok(Config::default());
                }
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let cfg: Config = serde_yaml_ng::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.max_concurrent_loads, 4);
        assert_eq!(cfg.agent.max_tool_calls, 20);
        assert_eq!(cfg.agent.max_consecutive_errors, 3);
        assert_eq!(cfg.cortex.similarity_threshold, 0.75);
        assert_eq!(cfg.cortex.ttl_days, 7);
        assert_eq!(cfg.evolution.min_trace_frequency, 3);
        assert!((cfg.evolution.min_success_rate - 0.8).abs() < 1e-9);
        assert_eq!(cfg.homeostasis.base_branch, "main");
    }

    #[test]
    fn active_profile_falls_back_when_missing() {
        let mut rc = RouterSearchConfig::default();
        rc.active_profile = "nonexistent".into();
        let p = rc.active();
        assert!((p.high_threshold - 0.75).abs() < 1e-9);
    }

    #[test]
    fn yaml_roundtrip() {
        let yaml = r#"
skills_path: my/skills
router:
  active_profile: strict
  semantic_weight: 1.5
agent:
  max_tool_calls: 7
"#;
        let cfg: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(cfg.skills_path, PathBuf::from("my/skills"));
        assert_eq!(cfg.router.active_profile, "strict");
        assert!((cfg.router.semantic_weight - 1.5).abs() < 1e-9);
        assert_eq!(cfg.agent.max_tool_calls, 7);
        // Unset sections keep defaults.
        assert_eq!(cfg.agent.max_tool_schemas, 20);
    }

    #[test]
    fn unknown_top_level_key_rejected() {
        let yaml = "skills_path: x\nbogus_key: 1\n";
        assert!(serde_yaml_ng::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn route_schema_has_properties() {
        let schema = RouterSearchConfig::json_schema();
        let props = schema.get("properties").unwrap();
        assert!(props.get("semantic_weight").is_some());
        assert!(props.get("rrf_k").is_some());
        assert!(props.get("field_boosting").is_some());
    }

    #[test]
    fn strict_profile_present_by_default() {
        let rc = RouterSearchConfig::default();
        let strict = rc.profiles.get("strict").unwrap();
        assert!(strict.high_threshold > rc.profiles.get("balanced").unwrap().high_threshold);
    }
}
