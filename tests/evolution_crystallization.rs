//! Evolution acceptance: crystallization thresholds and the immune gate.

use std::sync::Arc;

use chrono::Utc;
use omni_kernel::config::EvolutionConfig;
use omni_kernel::evolution::immune::ImmuneSystem;
use omni_kernel::evolution::{EvolutionManager, ExecutionTrace, TraceCollector};
use tempfile::TempDir;

fn trace(description: &str, commands: &[&str], success: bool) -> ExecutionTrace {
    ExecutionTrace {
        task_id: uuid::Uuid::new_v4().to_string(),
        task_description: description.into(),
        commands: commands.iter().map(|s| s.to_string()).collect(),
        outputs: vec![],
        success,
        exit_code: Some(if success { 0 } else { 1 }),
        duration_ms: 25,
        timestamp: Utc::now(),
    }
}

/// Scenario: five identical successful "list files" traces produce one
/// candidate with the full stats; a 1-in-3 success group under a 0.7
/// threshold produces none.
#[test]
fn crystallization_honours_thresholds() {
    let tmp = TempDir::new().unwrap();
    let collector = Arc::new(TraceCollector::new());
    let manager = EvolutionManager::new(
        Arc::clone(&collector),
        EvolutionConfig::default(),
        tmp.path(),
        ImmuneSystem::new(vec![]),
    );

    for _ in 0..5 {
        collector.record(trace("list files", &["ls"], true));
    }
    let candidates = manager.check_crystallization();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].trace_count, 5);
    assert_eq!(candidates[0].success_rate, 1.0);
    assert_eq!(candidates[0].command_pattern, vec!["ls"]);

    // 1 success / 2 failures at threshold 0.7 → no candidate.
    let tmp2 = TempDir::new().unwrap();
    let collector2 = Arc::new(TraceCollector::new());
    let manager2 = EvolutionManager::new(
        Arc::clone(&collector2),
        EvolutionConfig {
            min_success_rate: 0.7,
            ..Default::default()
        },
        tmp2.path(),
        ImmuneSystem::new(vec![]),
    );
    collector2.record(trace("flaky task", &["x"], true));
    collector2.record(trace("flaky task", &["x"], false));
    collector2.record(trace("flaky task", &["x"], false));
    assert!(manager2.check_crystallization().is_empty());
}

#[test]
fn crystallized_skill_passes_immune_gate_and_scans() {
    let tmp = TempDir::new().unwrap();
    let collector = Arc::new(TraceCollector::new());
    let manager = EvolutionManager::new(
        Arc::clone(&collector),
        EvolutionConfig::default(),
        tmp.path(),
        ImmuneSystem::new(vec![]),
    );
    for _ in 0..3 {
        collector.record(trace("list files", &["ls"], true));
    }
    let candidates = manager.check_crystallization();
    let outcome = manager.crystallize(&candidates[0]).unwrap();
    assert_eq!(outcome.status, "quarantined");
    let report = outcome.immune.unwrap();
    assert!(report.promoted);
    assert!(!report.is_trusted, "quarantined skills are never trusted");

    let scanned = omni_kernel::skills::scanner::scan_skill(&outcome.path.unwrap()).unwrap();
    assert_eq!(scanned.tools[0].tool_name, "list_files.run");
}

#[test]
fn dangerous_candidate_is_blocked() {
    let tmp = TempDir::new().unwrap();
    let collector = Arc::new(TraceCollector::new());
    let manager = EvolutionManager::new(
        Arc::clone(&collector),
        EvolutionConfig::default(),
        tmp.path(),
        ImmuneSystem::new(vec![]),
    );
    for _ in 0..3 {
        collector.record(trace("clean disk", &["sudo rm -rf /tmp/cache"], true));
    }
    let candidates = manager.check_crystallization();
    let outcome = manager.crystallize(&candidates[0]).unwrap();
    assert_eq!(outcome.status, "blocked");
    let report = outcome.immune.unwrap();
    assert!(!report.promoted);
    assert!(report.rejection_reason.is_some());
}

#[test]
fn dry_run_computes_without_writing() {
    let tmp = TempDir::new().unwrap();
    let collector = Arc::new(TraceCollector::new());
    let mut manager = EvolutionManager::new(
        Arc::clone(&collector),
        EvolutionConfig::default(),
        tmp.path(),
        ImmuneSystem::new(vec![]),
    );
    manager.dry_run = true;
    for _ in 0..3 {
        collector.record(trace("list files", &["ls"], true));
    }
    let candidates = manager.check_crystallization();
    let outcome = manager.crystallize(&candidates[0]).unwrap();
    assert_eq!(outcome.status, "dry_run");
    assert!(std::fs::read_dir(tmp.path()).unwrap().next().is_none());
}
