//! Evolution: trace capture, pattern detection and crystallization.
//!
//! The trace collector records every executed task; the evolution
//! manager groups recent traces by normalized task description and
//! promotes recurring successful patterns into candidate skills.
//! Candidates land in a quarantine directory and only pass into the live
//! skills tree through the [`immune`] gate.

pub mod immune;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::EvolutionConfig;
use crate::errors::{ErrorKind, OmniError};
use immune::ImmuneSystem;

// ── Traces ──────────────────────────────────────────────────

/// One executed task, as captured by the agent loop.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionTrace {
    pub task_id: String,
    pub task_description: String,
    pub commands: Vec<String>,
    pub outputs: Vec<String>,
    pub success: bool,
    /// Exit code of the underlying runner when one was recorded.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Classify a run: exit code first, output patterns only as fallback.
pub fn classify_success(exit_code: Option<i32>, output: &str) -> bool {
    match exit_code {
        Some(code) => code == 0,
        None => {
            let lower = output.to_lowercase();
            if lower.contains("failed") || lower.contains("error") {
                false
            } else {
                lower.contains("passed") || lower.contains("ok")
            }
        }
    }
}

/// Append-only trace log.  Single writer (the agent loop), many readers;
/// cleanup atomically replaces the list.
#[derive(Default)]
pub struct TraceCollector {
    traces: Mutex<Vec<ExecutionTrace>>,
}

impl TraceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, trace: ExecutionTrace) {
        self.traces.lock().expect("trace log poisoned").push(trace);
    }

    /// Traces younger than `max_age_hours`.
    pub fn recent(&self, max_age_hours: i64) -> Vec<ExecutionTrace> {
        let cutoff = Utc::now() - chrono::Duration::hours(max_age_hours);
        self.traces
            .lock()
            .expect("trace log poisoned")
            .iter()
            .filter(|t| t.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.traces.lock().expect("trace log poisoned").len()
    }

    /// Age off old traces and cap the list at `max_traces` (newest win).
    pub fn cleanup(&self, max_age_hours: i64, max_traces: usize) {
        let cutoff = Utc::now() - chrono::Duration::hours(max_age_hours);
        let mut traces = self.traces.lock().expect("trace log poisoned");
        let mut kept: Vec<ExecutionTrace> = traces
            .iter()
            .filter(|t| t.timestamp >= cutoff)
            .cloned()
            .collect();
        if kept.len() > max_traces {
            kept.sort_by_key(|t| t.timestamp);
            kept = kept.split_off(kept.len() - max_traces);
        }
        *traces = kept;
    }
}

// ── Candidates ──────────────────────────────────────────────

/// A recurring successful pattern eligible for crystallization.
#[derive(Debug, Clone, Serialize)]
pub struct CrystallizationCandidate {
    pub task_pattern: String,
    pub trace_count: usize,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    /// First-seen order, unique by command.
    pub command_pattern: Vec<String>,
    pub sample_traces: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Manager state snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvolutionState {
    pub last_check: Option<DateTime<Utc>>,
    pub total_traces: usize,
    pub total_skills_crystallized: usize,
    pub pending_candidates: usize,
    pub last_error: Option<String>,
    pub is_active: bool,
}

/// Outcome of crystallizing one candidate.
#[derive(Debug, Clone, Serialize)]
pub struct CrystallizeOutcome {
    pub status: String,
    pub candidate: String,
    pub skill_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub immune: Option<immune::ImmuneReport>,
}

// ── Manager ─────────────────────────────────────────────────

pub struct EvolutionManager {
    collector: std::sync::Arc<TraceCollector>,
    config: EvolutionConfig,
    quarantine_dir: PathBuf,
    immune: ImmuneSystem,
    state: Mutex<EvolutionState>,
    /// When set, candidates and artifacts are computed but nothing is
    /// written or promoted.
    pub dry_run: bool,
}

impl EvolutionManager {
    pub fn new(
        collector: std::sync::Arc<TraceCollector>,
        config: EvolutionConfig,
        quarantine_dir: impl Into<PathBuf>,
        immune: ImmuneSystem,
    ) -> Self {
        Self {
            collector,
            config,
            quarantine_dir: quarantine_dir.into(),
            immune,
            state: Mutex::new(EvolutionState::default()),
            dry_run: false,
        }
    }

    pub fn state(&self) -> EvolutionState {
        self.state.lock().expect("evolution state poisoned").clone()
    }

    /// Group recent traces and emit candidates that clear both
    /// thresholds.
    pub fn check_crystallization(&self) -> Vec<CrystallizationCandidate> {
        let traces = self.collector.recent(self.config.trace_ttl_hours);
        let mut groups: std::collections::BTreeMap<String, Vec<&ExecutionTrace>> =
            std::collections::BTreeMap::new();
        for trace in &traces {
            groups
                .entry(trace.task_description.to_lowercase())
                .or_default()
                .push(trace);
        }

        let mut candidates = Vec::new();
        for (pattern, group) in groups {
            let total = group.len();
            if total < self.config.min_trace_frequency {
                continue;
            }
            let successes = group.iter().filter(|t| t.success).count();
            let success_rate = successes as f64 / total as f64;
            if success_rate < self.config.min_success_rate {
                continue;
            }
            let avg_duration_ms =
                group.iter().map(|t| t.duration_ms as f64).sum::<f64>() / total as f64;

            let mut seen = HashSet::new();
            let mut command_pattern = Vec::new();
            for trace in &group {
                for command in &trace.commands {
                    if seen.insert(command.clone()) {
                        command_pattern.push(command.clone());
                    }
                }
            }

            candidates.push(CrystallizationCandidate {
                task_pattern: pattern,
                trace_count: total,
                success_rate,
                avg_duration_ms,
                command_pattern,
                sample_traces: group.iter().take(3).map(|t| t.task_id.clone()).collect(),
                created_at: Utc::now(),
            });
        }

        let mut state = self.state.lock().expect("evolution state poisoned");
        state.last_check = Some(Utc::now());
        state.total_traces = self.collector.count();
        state.pending_candidates = candidates.len();
        state.is_active = true;
        debug!(candidates = candidates.len(), "crystallization check complete");
        candidates
    }

    /// Synthesize a quarantine skill for a candidate and run the immune
    /// gate on it.
    pub fn crystallize(
        &self,
        candidate: &CrystallizationCandidate,
    ) -> Result<CrystallizeOutcome, OmniError> {
        let skill_name = sanitize_name(&candidate.task_pattern);
        if self.dry_run {
            // Compute the artifact without touching disk.
            let _ = skill_artifacts(&skill_name, candidate);
            return Ok(CrystallizeOutcome {
                status: "dry_run".into(),
                candidate: candidate.task_pattern.clone(),
                skill_name,
                path: None,
                immune: None,
            });
        }

        let dir = self.quarantine_dir.join(&skill_name);
        let (manifest, script) = skill_artifacts(&skill_name, candidate);
        std::fs::create_dir_all(dir.join("scripts")).map_err(write_err)?;
        std::fs::write(dir.join("SKILL.md"), manifest).map_err(write_err)?;
        std::fs::write(dir.join("scripts").join("main.py"), script).map_err(write_err)?;

        let report = self.immune.gate(&dir);
        if report.promoted {
            let mut state = self.state.lock().expect("evolution state poisoned");
            state.total_skills_crystallized += 1;
        }
        info!(skill = %skill_name, promoted = report.promoted, "candidate crystallized");
        Ok(CrystallizeOutcome {
            status: if report.promoted {
                "quarantined".into()
            } else {
                "blocked".into()
            },
            candidate: candidate.task_pattern.clone(),
            skill_name,
            path: Some(dir),
            immune: Some(report),
        })
    }

    /// Full cycle: cleanup, check, optional auto-crystallize.
    pub fn run_cycle(&self) -> serde_json::Value {
        let started = Utc::now();
        self.collector
            .cleanup(self.config.trace_ttl_hours, self.config.max_traces);
        let candidates = self.check_crystallization();

        let mut crystallized = 0usize;
        let mut blocked = 0usize;
        if self.config.auto_crystallize {
            for candidate in &candidates {
                match self.crystallize(candidate) {
                    Ok(outcome) if outcome.status == "blocked" => blocked += 1,
                    Ok(_) => crystallized += 1,
                    Err(e) => {
                        self.state
                            .lock()
                            .expect("evolution state poisoned")
                            .last_error = Some(e.message.clone());
                    }
                }
            }
        }
        serde_json::json!({
            "cycle_started": started.to_rfc3339(),
            "cycle_completed": Utc::now().to_rfc3339(),
            "duration_ms": (Utc::now() - started).num_milliseconds(),
            "candidates_found": candidates.len(),
            "crystallized": crystallized,
            "blocked": blocked,
        })
    }
}

fn write_err(e: std::io::Error) -> OmniError {
    OmniError::new(ErrorKind::SkillLoadFailed, format!("quarantine write: {e}"))
}

/// `"List  Files!"` → `"list_files"`
fn sanitize_name(pattern: &str) -> String {
    let mut name: String = pattern
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    while name.contains("__") {
        name = name.replace("__", "_");
    }
    name.trim_matches('_').to_string()
}

/// Templated SKILL.md + script for a crystallized candidate.
fn skill_artifacts(skill_name: &str, candidate: &CrystallizationCandidate) -> (String, String) {
    let manifest = format!(
        "---\nname: {skill_name}\nversion: 0.1.0\ndescription: Crystallized from {count} successful runs of '{pattern}'\nrouting_keywords: [{keywords}]\n---\n\n# {skill_name}\n\nAutomates: {pattern}\n",
        count = candidate.trace_count,
        pattern = candidate.task_pattern,
        keywords = candidate
            .task_pattern
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(", "),
    );
    let commands_list = candidate
        .command_pattern
        .iter()
        .map(|c| format!("        {c:?},"))
        .collect::<Vec<_>>()
        .join("\n");
    let script = format!(
        r#"import subprocess

from agent.skills.decorators import skill_command


@skill_command(
    name="run",
    category="write",
    description="Replays the proven command sequence for: {pattern}",
)
def run() -> str:
    commands = [
{commands_list}
    ]
    outputs = []
    for command in commands:
        result = subprocess.run(command, shell=True, capture_output=True, text=True)
        if result.returncode != 0:
            return f"failed at {{command}}: {{result.stderr}}"
        outputs.append(result.stdout)
    return "\n".join(outputs)
"#,
        pattern = candidate.task_pattern,
    );
    (manifest, script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn trace(description: &str, commands: &[&str], success: bool) -> ExecutionTrace {
        ExecutionTrace {
            task_id: uuid::Uuid::new_v4().to_string(),
            task_description: description.into(),
            commands: commands.iter().map(|s| s.to_string()).collect(),
            outputs: vec![],
            success,
            exit_code: Some(if success { 0 } else { 1 }),
            duration_ms: 40,
            timestamp: Utc::now(),
        }
    }

    fn manager(config: EvolutionConfig, quarantine: &std::path::Path) -> EvolutionManager {
        EvolutionManager::new(
            Arc::new(TraceCollector::new()),
            config,
            quarantine,
            ImmuneSystem::new(vec![]),
        )
    }

    #[test]
    fn classify_prefers_exit_code() {
        assert!(classify_success(Some(0), "everything failed horribly"));
        assert!(!classify_success(Some(1), "all tests passed"));
        assert!(classify_success(None, "5 passed in 0.2s"));
        assert!(!classify_success(None, "2 failed, 3 passed"));
    }

    #[test]
    fn no_traces_no_candidates() {
        let tmp = TempDir::new().unwrap();
        let m = manager(EvolutionConfig::default(), tmp.path());
        assert!(m.check_crystallization().is_empty());
        assert!(m.state().is_active);
    }

    #[test]
    fn candidate_requires_frequency_and_success_rate() {
        let tmp = TempDir::new().unwrap();
        let m = manager(EvolutionConfig::default(), tmp.path());

        // Below frequency: 2 < 3.
        for _ in 0..2 {
            m.collector.record(trace("list files", &["ls"], true));
        }
        assert!(m.check_crystallization().is_empty());

        // Third trace crosses the threshold.
        m.collector.record(trace("list files", &["ls"], true));
        let candidates = m.check_crystallization();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].task_pattern, "list files");
        assert_eq!(candidates[0].trace_count, 3);
        assert_eq!(candidates[0].success_rate, 1.0);
    }

    #[test]
    fn five_identical_successes_yield_one_candidate() {
        let tmp = TempDir::new().unwrap();
        let m = manager(EvolutionConfig::default(), tmp.path());
        for _ in 0..5 {
            m.collector.record(trace("List Files", &["ls"], true));
        }
        let candidates = m.check_crystallization();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].trace_count, 5);
        assert_eq!(candidates[0].success_rate, 1.0);
        assert_eq!(candidates[0].command_pattern, vec!["ls"]);
    }

    #[test]
    fn low_success_rate_rejected() {
        let tmp = TempDir::new().unwrap();
        let config = EvolutionConfig {
            min_success_rate: 0.7,
            ..Default::default()
        };
        let m = manager(config, tmp.path());
        m.collector.record(trace("flaky deploy", &["make deploy"], true));
        m.collector.record(trace("flaky deploy", &["make deploy"], false));
        m.collector.record(trace("flaky deploy", &["make deploy"], false));
        assert!(m.check_crystallization().is_empty());
    }

    #[test]
    fn command_pattern_preserves_first_seen_order() {
        let tmp = TempDir::new().unwrap();
        let m = manager(EvolutionConfig::default(), tmp.path());
        m.collector.record(trace("build and test", &["make build", "make test"], true));
        m.collector.record(trace("build and test", &["make build", "make lint"], true));
        m.collector.record(trace("build and test", &["make test"], true));
        let candidates = m.check_crystallization();
        assert_eq!(
            candidates[0].command_pattern,
            vec!["make build", "make test", "make lint"]
        );
    }

    #[test]
    fn dry_run_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let mut m = manager(EvolutionConfig::default(), tmp.path());
        m.dry_run = true;
        for _ in 0..3 {
            m.collector.record(trace("list files", &["ls"], true));
        }
        let candidates = m.check_crystallization();
        let outcome = m.crystallize(&candidates[0]).unwrap();
        assert_eq!(outcome.status, "dry_run");
        assert_eq!(outcome.candidate, "list files");
        assert!(std::fs::read_dir(tmp.path()).unwrap().next().is_none());
    }

    #[test]
    fn crystallize_writes_scannable_quarantine_skill() {
        let tmp = TempDir::new().unwrap();
        let m = manager(EvolutionConfig::default(), tmp.path());
        for _ in 0..3 {
            m.collector.record(trace("list files", &["ls"], true));
        }
        let candidates = m.check_crystallization();
        let outcome = m.crystallize(&candidates[0]).unwrap();
        assert_eq!(outcome.status, "quarantined");
        assert!(outcome.immune.unwrap().promoted);

        // The generated skill must parse with the regular scanner.
        let scanned =
            crate::skills::scanner::scan_skill(&outcome.path.unwrap()).unwrap();
        assert_eq!(scanned.manifest.name, "list_files");
        assert_eq!(scanned.tools.len(), 1);
        assert_eq!(scanned.tools[0].tool_name, "list_files.run");
    }

    #[test]
    fn run_cycle_reports_counters() {
        let tmp = TempDir::new().unwrap();
        let m = manager(EvolutionConfig::default(), tmp.path());
        let report = m.run_cycle();
        assert!(report.get("cycle_started").is_some());
        assert!(report.get("cycle_completed").is_some());
        assert_eq!(report["candidates_found"], 0);
    }

    #[test]
    fn cleanup_caps_trace_count() {
        let collector = TraceCollector::new();
        for i in 0..20 {
            collector.record(trace(&format!("task {i}"), &["x"], true));
        }
        collector.cleanup(24, 10);
        assert_eq!(collector.count(), 10);
    }

    #[test]
    fn sanitize_names() {
        assert_eq!(sanitize_name("List  Files!"), "list_files");
        assert_eq!(sanitize_name("run tests"), "run_tests");
    }
}
