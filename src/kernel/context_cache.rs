//! Per-skill packed context bundle.
//!
//! Concatenates, in a deterministic order, the manifest, the guide text,
//! prompt fragments and the skill's script sources into one annotated
//! string — the payload behind the `help` pseudo-command and the
//! active-skill context provider.  Built lazily per loaded skill and
//! invalidated by reload (the bundle lives on the `LoadedSkill` that a
//! reload replaces).

use std::path::Path;

use crate::skills::SkillManifest;

/// Build the packed bundle for a skill directory.
pub fn build_bundle(manifest: &SkillManifest, guide: &str, skill_dir: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();

    let manifest_yaml =
        serde_yaml_ng::to_string(manifest).unwrap_or_else(|_| String::from("{}"));
    parts.push(section("manifest", manifest.name.as_str(), &manifest_yaml));

    if !guide.trim().is_empty() {
        parts.push(section("guide", "SKILL.md", guide.trim()));
    }

    for prompt in sorted_files(&skill_dir.join("prompts"), &["md", "txt"]) {
        if let Ok(content) = std::fs::read_to_string(&prompt) {
            let name = prompt
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            parts.push(section("prompt", &name, content.trim()));
        }
    }

    for script in crate::skills::scanner::script_files(skill_dir) {
        if let Ok(content) = std::fs::read_to_string(&script) {
            let name = script
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            parts.push(section("script", &name, content.trim_end()));
        }
    }

    format!(
        "<skill_context name=\"{}\">\n{}\n</skill_context>",
        manifest.name,
        parts.join("\n")
    )
}

fn section(kind: &str, name: &str, body: &str) -> String {
    format!("<{kind} name=\"{name}\">\n{body}\n</{kind}>")
}

fn sorted_files(dir: &Path, extensions: &[&str]) -> Vec<std::path::PathBuf> {
    let mut files: Vec<std::path::PathBuf> = match std::fs::read_dir(dir) {
        Ok(rd) => rd
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .and_then(|e| e.to_str())
                        .map(|e| extensions.contains(&e))
                        .unwrap_or(false)
            })
            .collect(),
        Err(_) => Vec::new(),
    };
    files.sort();
    files
}
