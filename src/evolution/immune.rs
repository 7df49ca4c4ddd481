//! Immune system: static safety assessor for candidate skills.
//!
//! A gate, not a sandbox — it scans skill sources for dangerous
//! constructs and decides `safe`, `warn` or `block`.  Local skills may
//! be marked trusted and bypass the heavy scan; quarantined (generated)
//! skills are never trusted by default.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

/// Scan decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Safe,
    Warn,
    Block,
}

/// One flagged construct.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub pattern: String,
    pub file: String,
    pub line: usize,
    pub severity: f64,
    pub blocking: bool,
}

/// Result of assessing one skill directory.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityAssessment {
    pub decision: Decision,
    pub score: f64,
    pub findings_count: usize,
    pub is_trusted: bool,
    pub reason: String,
    pub details: Vec<Finding>,
}

/// Quarantine-to-live promotion verdict.
#[derive(Debug, Clone, Serialize)]
pub struct ImmuneReport {
    pub promoted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    pub score: f64,
    pub findings_count: usize,
    pub is_trusted: bool,
    pub details: Vec<Finding>,
}

/// `(pattern, severity penalty, blocks outright)`
const DANGEROUS_PATTERNS: &[(&str, f64, bool)] = &[
    ("rm -rf /", 1.0, true),
    ("sudo ", 1.0, true),
    ("mkfs", 1.0, true),
    ("curl ", 0.3, false),
    ("wget ", 0.3, false),
    ("eval(", 0.4, false),
    ("exec(", 0.4, false),
    ("os.system", 0.3, false),
    ("__import__", 0.3, false),
    ("chmod 777", 0.4, false),
    ("/etc/passwd", 0.5, false),
    ("base64.b64decode", 0.2, false),
];

/// Static safety assessor.
pub struct ImmuneSystem {
    /// Roots whose skills are trusted and skip the heavy scan.
    trusted_roots: Vec<PathBuf>,
}

impl ImmuneSystem {
    pub fn new(trusted_roots: Vec<PathBuf>) -> Self {
        Self { trusted_roots }
    }

    /// Assess a skill directory.
    pub fn assess(&self, skill_path: &Path) -> SecurityAssessment {
        if self.is_trusted(skill_path) {
            debug!(path = %skill_path.display(), "trusted skill, scan skipped");
            return SecurityAssessment {
                decision: Decision::Safe,
                score: 1.0,
                findings_count: 0,
                is_trusted: true,
                reason: "trusted local skill".into(),
                details: Vec::new(),
            };
        }

        let mut findings = Vec::new();
        for file in source_files(skill_path) {
            let Ok(content) = std::fs::read_to_string(&file) else {
                continue;
            };
            let rel = file
                .strip_prefix(skill_path)
                .unwrap_or(&file)
                .to_string_lossy()
                .to_string();
            for (line_no, line) in content.lines().enumerate() {
                for (pattern, severity, blocking) in DANGEROUS_PATTERNS {
                    if line.contains(pattern) {
                        findings.push(Finding {
                            pattern: pattern.to_string(),
                            file: rel.clone(),
                            line: line_no + 1,
                            severity: *severity,
                            blocking: *blocking,
                        });
                    }
                }
            }
        }

        let penalty: f64 = findings.iter().map(|f| f.severity).sum();
        let score = (1.0 - penalty).max(0.0);
        let has_blocker = findings.iter().any(|f| f.blocking);
        let decision = if has_blocker || score < 0.5 {
            Decision::Block
        } else if score < 0.8 {
            Decision::Warn
        } else {
            Decision::Safe
        };
        let reason = match decision {
            Decision::Safe => "no dangerous constructs found".to_string(),
            Decision::Warn => format!("{} suspicious constructs", findings.len()),
            Decision::Block => "blocking construct or score below threshold".to_string(),
        };
        if decision != Decision::Safe {
            warn!(path = %skill_path.display(), ?decision, findings = findings.len(),
                  "immune scan flagged skill");
        }
        SecurityAssessment {
            decision,
            score,
            findings_count: findings.len(),
            is_trusted: false,
            reason,
            details: findings,
        }
    }

    /// Gate a quarantined skill for promotion.  `block` prevents it.
    pub fn gate(&self, skill_path: &Path) -> ImmuneReport {
        let assessment = self.assess(skill_path);
        let promoted = assessment.decision != Decision::Block;
        ImmuneReport {
            promoted,
            rejection_reason: (!promoted).then(|| assessment.reason.clone()),
            score: assessment.score,
            findings_count: assessment.findings_count,
            is_trusted: assessment.is_trusted,
            details: assessment.details,
        }
    }

    fn is_trusted(&self, skill_path: &Path) -> bool {
        self.trusted_roots.iter().any(|root| skill_path.starts_with(root))
    }
}

fn source_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        if let Ok(rd) = std::fs::read_dir(&current) {
            for entry in rd.filter_map(|e| e.ok()) {
                let p = entry.path();
                if p.is_dir() {
                    stack.push(p);
                } else if matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("py") | Some("sh") | Some("md")
                ) {
                    files.push(p);
                }
            }
        }
    }
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_quarantine_skill(root: &Path, name: &str, script: &str) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(dir.join("scripts")).unwrap();
        std::fs::write(
            dir.join("SKILL.md"),
            format!("---\nname: {name}\nversion: 0.1.0\ndescription: generated\n---\n"),
        )
        .unwrap();
        std::fs::write(dir.join("scripts/main.py"), script).unwrap();
        dir
    }

    #[test]
    fn clean_skill_is_safe() {
        let tmp = TempDir::new().unwrap();
        let dir = write_quarantine_skill(
            tmp.path(),
            "lister",
            "import subprocess\n\ndef run():\n    return 'ok'\n",
        );
        let immune = ImmuneSystem::new(vec![]);
        let assessment = immune.assess(&dir);
        assert_eq!(assessment.decision, Decision::Safe);
        assert!(!assessment.is_trusted);
        assert_eq!(assessment.findings_count, 0);
    }

    #[test]
    fn sudo_blocks_outright() {
        let tmp = TempDir::new().unwrap();
        let dir = write_quarantine_skill(
            tmp.path(),
            "evil",
            "import os\nos.system('sudo rm -rf / --no-preserve-root')\n",
        );
        let immune = ImmuneSystem::new(vec![]);
        let assessment = immune.assess(&dir);
        assert_eq!(assessment.decision, Decision::Block);
        assert!(assessment.findings_count >= 2);

        let report = immune.gate(&dir);
        assert!(!report.promoted);
        assert!(report.rejection_reason.is_some());
    }

    #[test]
    fn accumulated_warnings_downgrade_score() {
        let tmp = TempDir::new().unwrap();
        let dir = write_quarantine_skill(
            tmp.path(),
            "fetchy",
            "import subprocess\nsubprocess.run(['sh', '-c', 'curl https://x'])\n",
        );
        let immune = ImmuneSystem::new(vec![]);
        let assessment = immune.assess(&dir);
        assert_eq!(assessment.decision, Decision::Warn);
        assert!(assessment.score < 0.8 && assessment.score >= 0.5);
        assert_eq!(assessment.findings_count, 1);
    }

    #[test]
    fn trusted_root_short_circuits() {
        let tmp = TempDir::new().unwrap();
        let dir = write_quarantine_skill(tmp.path(), "local", "os.system('sudo reboot')\n");
        let immune = ImmuneSystem::new(vec![tmp.path().to_path_buf()]);
        let assessment = immune.assess(&dir);
        assert!(assessment.is_trusted);
        assert_eq!(assessment.decision, Decision::Safe);
    }

    #[test]
    fn gate_promotes_warn_level() {
        let tmp = TempDir::new().unwrap();
        let dir = write_quarantine_skill(tmp.path(), "fetchy", "x = 'curl https://example'\n");
        let immune = ImmuneSystem::new(vec![]);
        let report = immune.gate(&dir);
        assert!(report.promoted);
        assert!(report.rejection_reason.is_none());
    }
}
