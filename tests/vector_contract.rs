//! Vector store contract: payload validation, bounds, and scan laws.

use omni_kernel::errors::ErrorKind;
use omni_kernel::search::FusionParams;
use omni_kernel::skills::{diff, ExecutionMode, ToolRecord};
use omni_kernel::vector::embedder::{Embedder, HashEmbedder};
use omni_kernel::vector::payloads::{HybridPayload, VectorPayload, HYBRID_SCHEMA_V1, VECTOR_SCHEMA_V1};
use omni_kernel::vector::VectorStore;

fn seeded_store() -> (VectorStore, HashEmbedder) {
    let store = VectorStore::open_in_memory().unwrap();
    let embedder = HashEmbedder::new(64);
    let docs = vec![
        ("run_tests".to_string(), "run the unit tests".to_string()),
        ("git_commit".to_string(), "commit staged changes".to_string()),
    ];
    let ids: Vec<String> = docs.iter().map(|(id, _)| id.clone()).collect();
    let contents: Vec<String> = docs.iter().map(|(_, d)| d.clone()).collect();
    let refs: Vec<&str> = contents.iter().map(|s| s.as_str()).collect();
    let vectors = embedder.embed(&refs);
    let metas = vec![serde_json::json!({}), serde_json::json!({})];
    store.add("tools", &ids, &vectors, &contents, &metas).unwrap();
    (store, embedder)
}

#[test]
fn every_returned_payload_validates_against_its_schema() {
    let (store, embedder) = seeded_store();
    let query = &embedder.embed(&["run tests"])[0];

    for row in store.search("tools", query, 2, None).unwrap() {
        let value = serde_json::to_value(&row).unwrap();
        let validated = VectorPayload::validate(&value).unwrap();
        assert_eq!(validated.schema, VECTOR_SCHEMA_V1);
        assert!(!validated.metadata.contains_key("keywords"));
    }

    for row in store
        .hybrid_search("tools", "run tests", query, 2, None, &FusionParams::default())
        .unwrap()
    {
        let value = serde_json::to_value(&row).unwrap();
        let validated = HybridPayload::validate(&value).unwrap();
        assert_eq!(validated.schema, HYBRID_SCHEMA_V1);
        assert!(!validated.metadata.contains_key("keywords"));
    }
}

#[test]
fn n_results_bounds_are_request_validation() {
    let (store, _) = seeded_store();
    let err = store.search("tools", &[0.0; 64], 0, None).unwrap_err();
    assert_eq!(err.kind, ErrorKind::VectorRequestValidation);
    let err = store.search("tools", &[0.0; 64], 1001, None).unwrap_err();
    assert_eq!(err.kind, ErrorKind::VectorRequestValidation);
}

#[test]
fn legacy_keywords_rejected_on_write_and_found_by_audit() {
    let (store, embedder) = seeded_store();
    let vector = embedder.embed(&["x"]).remove(0);
    let err = store
        .add(
            "tools",
            &["bad".to_string()],
            &[vector],
            &["doc".to_string()],
            &[serde_json::json!({"keywords": ["a"]})],
        )
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::VectorRequestValidation);

    // Clean collections audit clean.
    assert!(store.audit_legacy_keywords("tools").unwrap().is_empty());
}

#[test]
fn scanner_diff_identity_law() {
    let record = |name: &str| ToolRecord {
        tool_name: name.to_string(),
        skill_name: "s".into(),
        function_name: "f".into(),
        file_path: "scripts/f.py".into(),
        description: String::new(),
        routing_keywords: vec![],
        intents: vec![],
        category: "general".into(),
        input_schema: serde_json::json!({"type": "object"}),
        file_hash: "abc".into(),
        execution_mode: ExecutionMode::Script,
    };
    let scan = vec![record("s.a"), record("s.b")];
    let d = diff(&scan, &scan);
    assert!(d.added.is_empty());
    assert!(d.updated.is_empty());
    assert!(d.deleted.is_empty());
    assert_eq!(d.unchanged.len(), 2);
}

#[test]
fn missing_table_is_table_not_found() {
    let store = VectorStore::open_in_memory().unwrap();
    let err = store.count("ghost").unwrap_err();
    assert_eq!(err.kind, ErrorKind::VectorTableNotFound);
    let err = store
        .hybrid_search("ghost", "q", &[0.0; 8], 3, None, &FusionParams::default())
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::VectorHybridTableNotFound);
}

#[test]
fn persistence_across_reopen() {
    let tmp = tempfile::TempDir::new().unwrap();
    let embedder = HashEmbedder::new(32);
    {
        let store = VectorStore::open(tmp.path()).unwrap();
        let vectors = embedder.embed(&["persistent doc"]);
        store
            .add(
                "notes",
                &["n1".to_string()],
                &vectors,
                &["persistent doc".to_string()],
                &[serde_json::json!({})],
            )
            .unwrap();
    }
    let store = VectorStore::open(tmp.path()).unwrap();
    assert_eq!(store.count("notes").unwrap(), 1);
}
