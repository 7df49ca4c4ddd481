//! Skill manifests and tool records.
//!
//! Skills are capability packages described by `SKILL.md` manifests (YAML
//! front-matter between `---` fences, markdown body = guide text) plus a
//! `scripts/` directory whose functions are annotated with
//! `@skill_command(...)`.  The [`scanner`] walks the tree and emits one
//! [`ToolRecord`] per annotated command.
//!
//! Validation is fail-closed: required manifest keys must be present and
//! unknown keys are rejected.

pub mod marketplace;
pub mod scanner;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::{ErrorKind, OmniError};

// ── Manifest ────────────────────────────────────────────────

/// Metadata parsed from `SKILL.md` front-matter.
///
/// `name`, `version` and `description` are required; everything else is
/// routing metadata.  Unknown keys fail the parse so a typo'd manifest is
/// caught at load time rather than silently ignored.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SkillManifest {
    pub name: String,
    pub version: String,
    pub description: String,
    /// Keywords the router's lexical scorer boosts on.
    #[serde(default)]
    pub routing_keywords: Vec<String>,
    /// Intent labels (`commit/git`, `search/knowledge`, …).
    #[serde(default)]
    pub intents: Vec<String>,
    /// Script module carrying the command functions (default: all scripts).
    #[serde(default)]
    pub tools_module: Option<String>,
    /// Relative path of the usage guide injected into skill context.
    #[serde(default)]
    pub guide_file: Option<String>,
}

/// Parse a `SKILL.md` file into `(manifest, markdown_body)`.
///
/// Expected format:
/// ```text
/// ---
/// name: git
/// version: 1.0.0
/// description: Git operations
/// ---
/// # Guide
/// markdown body…
/// ```
pub fn parse_skill_md(content: &str) -> Result<(SkillManifest, String), OmniError> {
    let trimmed = content.trim_start();
    if !trimmed.starts_with("---") {
        return Err(OmniError::new(
            ErrorKind::ManifestInvalid,
            "SKILL.md must begin with YAML front-matter (---)",
        ));
    }
    let after_open = &trimmed[3..];
    let after_open = after_open.strip_prefix('\n').unwrap_or(after_open);

    let close_pos = after_open.find("\n---").ok_or_else(|| {
        OmniError::new(
            ErrorKind::ManifestInvalid,
            "missing closing --- in SKILL.md front-matter",
        )
    })?;

    let yaml = &after_open[..close_pos];
    let rest = &after_open[close_pos + 4..];
    let body = rest.strip_prefix('\n').unwrap_or(rest).to_string();

    if yaml.trim().is_empty() {
        return Err(OmniError::new(
            ErrorKind::ManifestInvalid,
            "empty SKILL.md front-matter",
        ));
    }

    let manifest: SkillManifest = serde_yaml_ng::from_str(yaml)
        .map_err(|e| OmniError::new(ErrorKind::ManifestInvalid, format!("front-matter: {e}")))?;

    if manifest.name.trim().is_empty() {
        return Err(OmniError::new(
            ErrorKind::ManifestInvalid,
            "manifest name must be non-empty",
        ));
    }
    if manifest.version.trim().is_empty() {
        return Err(OmniError::new(
            ErrorKind::ManifestInvalid,
            "manifest version must be non-empty",
        ));
    }

    Ok((manifest, body))
}

// ── Tool records ────────────────────────────────────────────

/// How the kernel dispatches a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// A Rust handler registered in the kernel's handler registry.
    Local,
    /// The script file runs as a subprocess.
    #[default]
    Script,
}

/// One command emitted by the scanner; consumed by router and kernel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolRecord {
    /// Globally unique id, `"<skill>.<command>"`.
    pub tool_name: String,
    pub skill_name: String,
    pub function_name: String,
    pub file_path: String,
    pub description: String,
    #[serde(default)]
    pub routing_keywords: Vec<String>,
    #[serde(default)]
    pub intents: Vec<String>,
    pub category: String,
    /// JSON Schema for the command's arguments.
    pub input_schema: serde_json::Value,
    /// SHA-256 of the script file — drives incremental diffing.
    pub file_hash: String,
    pub execution_mode: ExecutionMode,
}

impl ToolRecord {
    /// Command part of the tool id (after the skill prefix).
    pub fn command(&self) -> &str {
        self.tool_name
            .split_once('.')
            .map(|(_, c)| c)
            .unwrap_or(&self.tool_name)
    }
}

/// Result of comparing two scans by `(tool_name, file_hash)`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanDiff {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: Vec<String>,
}

/// Diff `new` against `old` tool records.
///
/// A tool present in both with a different `file_hash` is `updated`;
/// identical hash means `unchanged`.
pub fn diff(new: &[ToolRecord], old: &[ToolRecord]) -> ScanDiff {
    let old_map: HashMap<&str, &str> = old
        .iter()
        .map(|t| (t.tool_name.as_str(), t.file_hash.as_str()))
        .collect();
    let new_names: HashMap<&str, ()> = new.iter().map(|t| (t.tool_name.as_str(), ())).collect();

    let mut out = ScanDiff::default();
    for t in new {
        match old_map.get(t.tool_name.as_str()) {
            None => out.added.push(t.tool_name.clone()),
            Some(h) if *h != t.file_hash => out.updated.push(t.tool_name.clone()),
            Some(_) => out.unchanged.push(t.tool_name.clone()),
        }
    }
    for t in old {
        if !new_names.contains_key(t.tool_name.as_str()) {
            out.deleted.push(t.tool_name.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_skill_md_valid() {
        let content = "---\nname: git\nversion: 1.0.0\ndescription: Git ops\n---\n# Guide\n\nUse it.\n";
        let (manifest, body) = parse_skill_md(content).unwrap();
        assert_eq!(manifest.name, "git");
        assert_eq!(manifest.version, "1.0.0");
        assert!(body.contains("Use it."));
    }

    #[test]
    fn parse_skill_md_no_frontmatter() {
        let err = parse_skill_md("# Just markdown\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ManifestInvalid);
    }

    #[test]
    fn parse_skill_md_empty_frontmatter() {
        let err = parse_skill_md("---\n\n---\nbody\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ManifestInvalid);
    }

    #[test]
    fn parse_skill_md_missing_required_key() {
        let err = parse_skill_md("---\nname: git\n---\nbody\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ManifestInvalid);
    }

    #[test]
    fn parse_skill_md_unknown_key_rejected() {
        let content =
            "---\nname: git\nversion: '1'\ndescription: d\nbogus: true\n---\n";
        let err = parse_skill_md(content).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ManifestInvalid);
    }

    fn record(name: &str, hash: &str) -> ToolRecord {
        ToolRecord {
            tool_name: name.into(),
            skill_name: name.split('.').next().unwrap().into(),
            function_name: "f".into(),
            file_path: "scripts/f.py".into(),
            description: String::new(),
            routing_keywords: vec![],
            intents: vec![],
            category: "general".into(),
            input_schema: serde_json::json!({"type": "object", "properties": {}}),
            file_hash: hash.into(),
            execution_mode: ExecutionMode::Script,
        }
    }

    #[test]
    fn diff_identical_scans_all_unchanged() {
        let scan = vec![record("git.status", "h1"), record("git.commit", "h1")];
        let d = diff(&scan, &scan);
        assert!(d.added.is_empty());
        assert!(d.updated.is_empty());
        assert!(d.deleted.is_empty());
        assert_eq!(d.unchanged.len(), 2);
    }

    #[test]
    fn diff_detects_all_categories() {
        let old = vec![record("git.status", "h1"), record("git.push", "h1")];
        let new = vec![record("git.status", "h2"), record("git.pull", "h1")];
        let d = diff(&new, &old);
        assert_eq!(d.added, vec!["git.pull"]);
        assert_eq!(d.updated, vec!["git.status"]);
        assert_eq!(d.deleted, vec!["git.push"]);
        assert!(d.unchanged.is_empty());
    }

    #[test]
    fn command_part_extraction() {
        let r = record("git.status", "h");
        assert_eq!(r.command(), "status");
    }
}
