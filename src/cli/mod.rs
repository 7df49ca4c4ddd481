//! CLI subcommand handlers.
//!
//! Keeps `main.rs` slim: clap parsing stays there, heavy logic lives
//! here.  All JSON output is schema-stamped (`omni.router.route_test.v1`
//! for route tests) and stable.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::debug;

use crate::config::Config;
use crate::kernel::Kernel;
use crate::router::{Router, RoutingResult, TOOL_SEARCH_COLLECTION};
use crate::skills::marketplace::SkillDiscovery;
use crate::vector::embedder::{Embedder, HashEmbedder};
use crate::vector::payloads::ROUTE_TEST_SCHEMA_V1;
use crate::vector::{tool_index_row, VectorStore};

/// Exit code for runtime failures (usage errors exit 2 via clap).
pub const EXIT_RUNTIME: i32 = 1;

// ── Shared wiring ───────────────────────────────────────────

/// Load skills, index their tools, and build a router over them.
async fn build_router(cfg: &Config) -> anyhow::Result<Arc<Router>> {
    let store = Arc::new(VectorStore::open(&cfg.vector_path)?);
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::default());
    let kernel = Arc::new(Kernel::new(&cfg.skills_path, cfg.max_concurrent_loads));
    kernel.load_all().await;
    let outcome = crate::skills::scanner::scan_tree(&cfg.skills_path);
    let records = outcome.tool_records();
    sync_tool_index(&store, embedder.as_ref(), &records)?;
    register_tool_entities(&records);
    Ok(Router::new(
        store,
        embedder,
        kernel,
        cfg.router.clone(),
        cfg.cortex.clone(),
    ))
}

/// Write scanned tool records into the `tool_search` collection.
pub fn sync_tool_index(
    store: &VectorStore,
    embedder: &dyn Embedder,
    records: &[crate::skills::ToolRecord],
) -> anyhow::Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    let mut ids = Vec::new();
    let mut docs = Vec::new();
    let mut metas = Vec::new();
    for record in records {
        let (content, meta) = tool_index_row(record);
        ids.push(record.tool_name.clone());
        docs.push(content);
        metas.push(meta);
    }
    let refs: Vec<&str> = docs.iter().map(|s| s.as_str()).collect();
    let vectors = embedder.embed(&refs);
    store
        .add(TOOL_SEARCH_COLLECTION, &ids, &vectors, &docs, &metas)
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    debug!(tools = ids.len(), "tool index synced");
    Ok(())
}

/// Register skills/tools/keywords in the knowledge graph and enrich
/// tool relationships via shared entities.  Runs on every index sync;
/// registration is idempotent.
fn register_tool_entities(records: &[crate::skills::ToolRecord]) {
    use crate::fusion::knowledge::KnowledgeGraph;
    use crate::fusion::{enrich_tool_graph, register_skill_entities, SkillDoc};

    let mut by_skill: std::collections::BTreeMap<String, SkillDoc> =
        std::collections::BTreeMap::new();
    for record in records {
        let doc = by_skill
            .entry(record.skill_name.clone())
            .or_insert_with(|| SkillDoc {
                skill_name: record.skill_name.clone(),
                tool_names: Vec::new(),
                keywords: Vec::new(),
            });
        doc.tool_names.push(record.tool_name.clone());
        for keyword in &record.routing_keywords {
            if !doc.keywords.contains(keyword) {
                doc.keywords.push(keyword.clone());
            }
        }
    }
    let docs: Vec<SkillDoc> = by_skill.into_values().collect();
    let mut kg = KnowledgeGraph::new();
    let added = register_skill_entities(&mut kg, &docs);
    let tool_ids: Vec<String> = records.iter().map(|r| r.tool_name.clone()).collect();
    let edges = enrich_tool_graph(&mut kg, &tool_ids);
    debug!(entities = added, enriched_edges = edges, "knowledge graph synced");
}

// ── route test ──────────────────────────────────────────────

/// Canonical `omni.router.route_test.v1` payload.
pub fn route_test_payload(
    query: &str,
    result: &RoutingResult,
    cfg: &Config,
) -> serde_json::Value {
    let results: Vec<serde_json::Value> = result
        .selected_tools
        .iter()
        .map(|t| {
            let command = t
                .tool_name
                .split_once('.')
                .map(|(_, c)| c)
                .unwrap_or(&t.tool_name);
            serde_json::json!({
                "id": t.tool_name,
                "name": t.name,
                "description": t.description,
                "input_schema": t.input_schema,
                "score": t.score,
                "final_score": t.final_score,
                "confidence": t.confidence,
                "skill_name": t.skill_name,
                "tool_name": t.tool_name,
                "command": command,
                "routing_keywords": t.routing_keywords,
                "intents": t.intents,
                "category": t.category,
                "payload": {
                    "type": "command",
                    "description": t.description,
                    "metadata": {
                        "skill_name": t.skill_name,
                        "command": command,
                        "tool_name": t.tool_name,
                        "file_path": t.file_path,
                        "routing_keywords": t.routing_keywords,
                        "intents": t.intents,
                        "category": t.category,
                        "input_schema": t.input_schema,
                    },
                },
            })
        })
        .collect();
    serde_json::json!({
        "schema": ROUTE_TEST_SCHEMA_V1,
        "query": query,
        "count": results.len(),
        "results": results,
        "confidence_profile": cfg.router.active_profile,
        "stats": {
            "semantic_weight": cfg.router.semantic_weight,
            "keyword_weight": cfg.router.keyword_weight,
            "rrf_k": cfg.router.rrf_k,
            "strategy": "weighted_rrf_field_boosting",
            "from_cache": result.from_cache,
        },
    })
}

/// `omni route test <query> [--json] [--debug] [--confidence-profile]`
pub async fn route_test(
    cfg: &mut Config,
    query: &str,
    json: bool,
    debug: bool,
    confidence_profile: Option<String>,
) -> anyhow::Result<i32> {
    if let Some(profile) = confidence_profile {
        cfg.router.active_profile = profile;
    }
    let router = build_router(cfg).await?;
    let result = match router.route(query).await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{e}");
            return Ok(EXIT_RUNTIME);
        }
    };

    if json {
        let payload = route_test_payload(query, &result, cfg);
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(0);
    }

    println!("query: {query}");
    println!("confidence: {:?}  cache: {}", result.confidence, result.from_cache);
    println!("brief: {}", result.mission_brief);
    for tool in &result.selected_tools {
        if debug {
            println!(
                "  {:<40} raw={:.3} | final={:.3}",
                tool.tool_name, tool.score, tool.final_score
            );
        } else {
            println!(
                "  {:<40} [{:?}] {}",
                tool.tool_name,
                tool.confidence,
                crate::utils::truncate_str(&tool.description, 60)
            );
        }
    }
    if result.selected_tools.is_empty() {
        println!("  (no tools matched)");
    }
    Ok(0)
}

/// `omni route stats`
pub fn route_stats(cfg: &Config) -> i32 {
    let r = &cfg.router;
    println!("active_profile: {}", r.active_profile);
    if let Some(profile) = r.profiles.get(&r.active_profile) {
        println!(
            "  high={} medium={} low_floor={}",
            profile.high_threshold, profile.medium_threshold, profile.low_floor
        );
    }
    println!("semantic_weight: {}", r.semantic_weight);
    println!("keyword_weight: {}", r.keyword_weight);
    println!("rrf_k: {}", r.rrf_k);
    println!(
        "field_boosting: name_token={} exact_phrase={}",
        r.field_boosting.name_token_boost, r.field_boosting.exact_phrase_boost
    );
    0
}

/// `omni route schema [--json|--stdout]`
pub fn route_schema(json: bool, stdout: bool) -> anyhow::Result<i32> {
    let schema = crate::config::RouterSearchConfig::json_schema();
    if stdout || !json {
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(0);
    }
    let dir = crate::omni_home().join("schemas");
    std::fs::create_dir_all(&dir).context("creating schema dir")?;
    let path = dir.join("router.search.schema.json");
    std::fs::write(&path, serde_json::to_string_pretty(&schema)?)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("{}", serde_json::json!({ "path": path }));
    Ok(0)
}

// ── db ──────────────────────────────────────────────────────

/// `omni db validate-schema`: audit the tool-search collection for rows
/// carrying the forbidden legacy `keywords` field.
pub fn db_validate_schema(cfg: &Config) -> anyhow::Result<i32> {
    let store = VectorStore::open(&cfg.vector_path)?;
    let violations = match store.audit_legacy_keywords(TOOL_SEARCH_COLLECTION) {
        Ok(v) => v,
        Err(e) => {
            // A missing collection means nothing to audit.
            println!("collection absent, nothing to audit ({})", e.kind.as_str());
            return Ok(0);
        }
    };
    if violations.is_empty() {
        println!("ok: no rows carry the legacy 'keywords' field");
        Ok(0)
    } else {
        println!("{} row(s) violate the schema contract:", violations.len());
        for id in &violations {
            println!("  {id}  (has 'keywords'; must use routing_keywords)");
        }
        Ok(EXIT_RUNTIME)
    }
}

// ── skill marketplace ───────────────────────────────────────

fn index_path() -> PathBuf {
    crate::omni_home().join("skills-index.json")
}

pub fn skill_discover(query: Option<&str>, limit: usize) -> anyhow::Result<i32> {
    let discovery = SkillDiscovery::new(index_path());
    let hits = discovery.discover(query.unwrap_or(""), limit)?;
    if hits.is_empty() {
        println!("no skills matched");
        return Ok(0);
    }
    for hit in hits {
        println!("{:<24} {:.1}  {}", hit.id, hit.score, hit.description);
    }
    Ok(0)
}

pub fn skill_suggest(task: &str) -> anyhow::Result<i32> {
    let discovery = SkillDiscovery::new(index_path());
    match discovery.suggest(task)? {
        Some(s) => {
            println!("{}: {}", s.id, s.rationale);
            Ok(0)
        }
        None => {
            println!("no suggestion for this task");
            Ok(0)
        }
    }
}

pub async fn skill_jit_install(cfg: &Config, id: &str) -> anyhow::Result<i32> {
    let discovery = SkillDiscovery::new(index_path());
    let path = discovery.jit_install(id, &cfg.skills_path).await?;
    println!("installed: {}", path.display());
    Ok(0)
}

pub fn skill_list_index() -> anyhow::Result<i32> {
    let discovery = SkillDiscovery::new(index_path());
    let index = discovery.load_index()?;
    println!("index version {} — {} skills", index.version, index.skills.len());
    for entry in index.skills {
        println!("{:<24} {}", entry.id, entry.url);
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::payloads::{Confidence, ToolSearchPayload, TOOL_SEARCH_SCHEMA_V1};

    fn sample_result() -> RoutingResult {
        RoutingResult {
            selected_tools: vec![ToolSearchPayload {
                schema: TOOL_SEARCH_SCHEMA_V1.into(),
                name: "commit".into(),
                description: "Commit changes".into(),
                input_schema: serde_json::Map::new(),
                score: 0.82,
                vector_score: Some(0.8),
                keyword_score: Some(0.9),
                final_score: 0.91,
                confidence: Confidence::High,
                skill_name: "git".into(),
                tool_name: "git.commit".into(),
                file_path: "scripts/main.py".into(),
                routing_keywords: vec!["git".into(), "commit".into()],
                intents: vec![],
                category: "write".into(),
            }],
            mission_brief: "Goal: commit".into(),
            reasoning: String::new(),
            confidence: Some(Confidence::High),
            from_cache: false,
            timestamp: String::new(),
        }
    }

    #[test]
    fn route_test_payload_is_canonical() {
        let cfg = Config::default();
        let payload = route_test_payload("git commit", &sample_result(), &cfg);
        assert_eq!(payload["schema"], "omni.router.route_test.v1");
        assert_eq!(payload["query"], "git commit");
        assert_eq!(payload["count"], 1);
        let row = &payload["results"][0];
        assert_eq!(row["id"], "git.commit");
        assert_eq!(row["tool_name"], "git.commit");
        assert_eq!(row["command"], "commit");
        assert_eq!(row["routing_keywords"][0], "git");
        assert_eq!(row["payload"]["metadata"]["tool_name"], "git.commit");
        assert_eq!(
            row["payload"]["metadata"]["routing_keywords"],
            serde_json::json!(["git", "commit"])
        );
        assert_eq!(payload["stats"]["strategy"], "weighted_rrf_field_boosting");
        assert_eq!(payload["confidence_profile"], "balanced");
    }

    #[test]
    fn route_test_payload_roundtrips_as_json() {
        let cfg = Config::default();
        let payload = route_test_payload("q", &sample_result(), &cfg);
        let text = serde_json::to_string(&payload).unwrap();
        let back: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(payload, back);
    }
}
