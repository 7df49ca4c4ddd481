//! Skill tree scanner.
//!
//! Walks the skills root one level deep.  For each skill directory it
//! parses the `SKILL.md` manifest, then extracts `@skill_command(...)`
//! annotated functions from every script under `scripts/` and emits one
//! [`ToolRecord`] per command.  When the annotation omits `input_schema`
//! the scanner synthesizes an object schema from the function signature.
//!
//! A malformed skill is isolated: the scanner records the failure and
//! continues with its neighbours.  Scanning the same tree twice yields
//! identical records (entries and commands are visited in sorted order).

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{ExecutionMode, SkillManifest, ToolRecord};
use crate::errors::{ErrorKind, OmniError};
use crate::utils::content_hash;

/// A fully scanned skill directory.
#[derive(Debug, Clone)]
pub struct ScannedSkill {
    pub manifest: SkillManifest,
    pub path: PathBuf,
    /// Markdown body of SKILL.md (the usage guide).
    pub guide: String,
    pub tools: Vec<ToolRecord>,
    /// Newest mtime across SKILL.md and scripts — the hot-reload probe input.
    pub mtime: f64,
}

/// Outcome of a tree scan: healthy skills plus isolated failures.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub skills: Vec<ScannedSkill>,
    pub failures: Vec<(String, OmniError)>,
}

impl ScanOutcome {
    /// All tool records across all scanned skills.
    pub fn tool_records(&self) -> Vec<ToolRecord> {
        self.skills.iter().flat_map(|s| s.tools.clone()).collect()
    }
}

/// Scan every skill directory under `root` (shallow, one level per skill).
///
/// Directories without a `SKILL.md` or without script files are skipped
/// with a debug log.  A directory whose manifest or scripts fail to parse
/// is recorded in `failures` and never aborts the walk.
pub fn scan_tree(root: &Path) -> ScanOutcome {
    let mut outcome = ScanOutcome::default();
    let entries = match std::fs::read_dir(root) {
        Ok(rd) => rd,
        Err(e) => {
            warn!(root = %root.display(), error = %e, "skills root not readable");
            return outcome;
        }
    };

    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();

    for dir in dirs {
        let dir_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if !dir.join("SKILL.md").is_file() {
            debug!(skill = %dir_name, "skipping: no SKILL.md");
            continue;
        }
        if script_files(&dir).is_empty() {
            debug!(skill = %dir_name, "skipping: no script files");
            continue;
        }
        match scan_skill(&dir) {
            Ok(skill) => outcome.skills.push(skill),
            Err(e) => {
                warn!(skill = %dir_name, kind = e.kind.as_str(), error = %e.message,
                      "skill failed to scan, isolating");
                outcome.failures.push((dir_name, e));
            }
        }
    }
    outcome
}

/// Scan a single skill directory.
pub fn scan_skill(dir: &Path) -> Result<ScannedSkill, OmniError> {
    let skill_md = dir.join("SKILL.md");
    let content = std::fs::read_to_string(&skill_md).map_err(|e| {
        OmniError::new(
            ErrorKind::SkillLoadFailed,
            format!("reading {}: {e}", skill_md.display()),
        )
    })?;
    let (manifest, guide) = super::parse_skill_md(&content)?;

    let scripts = script_files(dir);
    if scripts.is_empty() {
        return Err(OmniError::new(
            ErrorKind::SkillLoadFailed,
            format!("{}: no script files under scripts/", manifest.name),
        ));
    }

    let mut tools = Vec::new();
    for script in &scripts {
        let source = std::fs::read_to_string(script).map_err(|e| {
            OmniError::new(
                ErrorKind::SkillLoadFailed,
                format!("reading {}: {e}", script.display()),
            )
        })?;
        let hash = content_hash(source.as_bytes());
        let rel = script
            .strip_prefix(dir)
            .unwrap_or(script)
            .to_string_lossy()
            .to_string();
        let mut extracted = extract_commands(&source, &manifest, &rel, &hash)?;
        tools.append(&mut extracted);
    }

    // Tool ids must be globally unique; within a skill a duplicate command
    // name is a scan error rather than a silent overwrite.
    tools.sort_by(|a, b| a.tool_name.cmp(&b.tool_name));
    for pair in tools.windows(2) {
        if pair[0].tool_name == pair[1].tool_name {
            return Err(OmniError::new(
                ErrorKind::SkillLoadFailed,
                format!("duplicate command id: {}", pair[0].tool_name),
            ));
        }
    }

    Ok(ScannedSkill {
        mtime: newest_mtime(dir),
        manifest,
        path: dir.to_path_buf(),
        guide,
        tools,
    })
}

/// Script files under `<dir>/scripts`, sorted for determinism.
pub fn script_files(dir: &Path) -> Vec<PathBuf> {
    let scripts_dir = dir.join("scripts");
    let mut files: Vec<PathBuf> = match std::fs::read_dir(&scripts_dir) {
        Ok(rd) => rd
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.extension().and_then(|e| e.to_str()) == Some("py")
                    && p.file_name().and_then(|n| n.to_str()) != Some("__init__.py")
            })
            .collect(),
        Err(_) => Vec::new(),
    };
    files.sort();
    files
}

/// Newest mtime across SKILL.md and every script file (seconds, f64).
pub fn newest_mtime(dir: &Path) -> f64 {
    let mut newest = file_mtime(&dir.join("SKILL.md"));
    for script in script_files(dir) {
        newest = newest.max(file_mtime(&script));
    }
    newest
}

fn file_mtime(path: &Path) -> f64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ── Annotation extraction ───────────────────────────────────

/// Extract every `@skill_command(...)`-annotated function from a script.
fn extract_commands(
    source: &str,
    manifest: &SkillManifest,
    file_path: &str,
    file_hash: &str,
) -> Result<Vec<ToolRecord>, OmniError> {
    let mut out = Vec::new();
    let mut search_from = 0usize;

    while let Some(rel_pos) = source[search_from..].find("@skill_command") {
        let marker = search_from + rel_pos;
        let after = &source[marker + "@skill_command".len()..];

        let (args_text, consumed) = if after.trim_start().starts_with('(') {
            let open = after.find('(').unwrap();
            let inner = capture_parens(&after[open..]).ok_or_else(|| {
                OmniError::new(
                    ErrorKind::SkillLoadFailed,
                    format!("{file_path}: unbalanced @skill_command arguments"),
                )
            })?;
            (inner.to_string(), open + inner.len() + 2)
        } else {
            // Bare marker with no arguments.
            (String::new(), 0)
        };

        let rest = &after[consumed..];
        let (function_name, params) = next_function_signature(rest).ok_or_else(|| {
            OmniError::new(
                ErrorKind::SkillLoadFailed,
                format!("{file_path}: @skill_command without a following def"),
            )
        })?;

        let decorator = parse_decorator_args(&args_text);
        let command_name = decorator
            .name
            .clone()
            .unwrap_or_else(|| function_name.clone());
        if command_name.trim().is_empty() {
            return Err(OmniError::new(
                ErrorKind::SkillLoadFailed,
                format!("{file_path}: command name must be non-empty"),
            ));
        }

        let input_schema = decorator
            .input_schema
            .clone()
            .unwrap_or_else(|| synthesize_schema(&params));

        out.push(ToolRecord {
            tool_name: format!("{}.{}", manifest.name, command_name),
            skill_name: manifest.name.clone(),
            function_name,
            file_path: file_path.to_string(),
            description: decorator.description.unwrap_or_default(),
            routing_keywords: manifest.routing_keywords.clone(),
            intents: manifest.intents.clone(),
            category: decorator.category.unwrap_or_else(|| "general".into()),
            input_schema,
            file_hash: file_hash.to_string(),
            execution_mode: decorator.mode,
        });

        search_from = marker + "@skill_command".len() + consumed;
    }

    Ok(out)
}

#[derive(Debug, Default)]
struct DecoratorArgs {
    name: Option<String>,
    category: Option<String>,
    description: Option<String>,
    input_schema: Option<serde_json::Value>,
    mode: ExecutionMode,
}

fn parse_decorator_args(args: &str) -> DecoratorArgs {
    let mut parsed = DecoratorArgs::default();
    for part in split_top_level(args) {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "name" => parsed.name = string_literal(value),
            "category" => parsed.category = string_literal(value),
            "description" => parsed.description = string_literal(value).map(normalize_doc),
            "input_schema" => parsed.input_schema = dict_literal(value),
            "mode" => {
                if string_literal(value).as_deref() == Some("local") {
                    parsed.mode = ExecutionMode::Local;
                }
            }
            _ => {}
        }
    }
    parsed
}

/// Split on commas at nesting depth 0, respecting strings.
fn split_top_level(args: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;

    let mut i = 0usize;
    while i < args.len() {
        let c = args[i..].chars().next().unwrap();
        // String literals (including triple quotes) pass through opaquely.
        if c == '"' || c == '\'' {
            let (literal, len) = consume_string(&args[i..]);
            current.push_str(literal);
            i += len;
            continue;
        }
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(std::mem::take(&mut current));
                i += 1;
                continue;
            }
            _ => {}
        }
        current.push(c);
        i += c.len_utf8();
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts
}

/// Consume a Python string literal starting at the quote character.
/// Returns the literal (quotes included) and its byte length.
fn consume_string(s: &str) -> (&str, usize) {
    let quote = s.chars().next().unwrap();
    let triple: String = std::iter::repeat(quote).take(3).collect();
    if s.starts_with(&triple) {
        if let Some(end) = s[3..].find(&triple) {
            let len = 3 + end + 3;
            return (&s[..len], len);
        }
        return (s, s.len());
    }
    let mut escaped = false;
    for (idx, c) in s.char_indices().skip(1) {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            c if c == quote => {
                let len = idx + c.len_utf8();
                return (&s[..len], len);
            }
            _ => {}
        }
    }
    (s, s.len())
}

/// Capture the text inside a balanced `(...)` group (quote-aware).
/// `s` must start at the opening paren; returns the inner text.
fn capture_parens(s: &str) -> Option<&str> {
    debug_assert!(s.starts_with('('));
    let mut depth = 0i32;
    let mut i = 0usize;
    while i < s.len() {
        let c = s[i..].chars().next().unwrap();
        if c == '"' || c == '\'' {
            let (_, len) = consume_string(&s[i..]);
            i += len;
            continue;
        }
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[1..i]);
                }
            }
            _ => {}
        }
        i += c.len_utf8();
    }
    None
}

/// Extract a string literal value (single, double, or triple quoted).
fn string_literal(value: &str) -> Option<String> {
    let v = value.trim();
    for q in ["\"\"\"", "'''"] {
        if v.starts_with(q) && v.ends_with(q) && v.len() >= 6 {
            return Some(v[3..v.len() - 3].to_string());
        }
    }
    for q in ['"', '\''] {
        if v.starts_with(q) && v.ends_with(q) && v.len() >= 2 {
            return Some(v[1..v.len() - 1].to_string());
        }
    }
    None
}

/// Parse a Python dict literal as JSON (best effort: JSON first, then a
/// single-to-double quote pass).  Non-dict values yield `None` so the
/// scanner falls back to signature synthesis.
fn dict_literal(value: &str) -> Option<serde_json::Value> {
    let v = value.trim();
    if !v.starts_with('{') {
        return None;
    }
    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(v) {
        return parsed.is_object().then_some(parsed);
    }
    let jsonish = v
        .replace('\'', "\"")
        .replace(": True", ": true")
        .replace(": False", ": false")
        .replace(": None", ": null");
    serde_json::from_str::<serde_json::Value>(&jsonish)
        .ok()
        .filter(|p| p.is_object())
}

/// Collapse a triple-quoted doc block: trim each line, drop blank edges.
fn normalize_doc(doc: String) -> String {
    let lines: Vec<&str> = doc.lines().map(|l| l.trim()).collect();
    lines.join("\n").trim().to_string()
}

// ── Function signatures ─────────────────────────────────────

/// A parsed `def` parameter.
#[derive(Debug, Clone)]
struct Param {
    name: String,
    annotation: Option<String>,
    has_default: bool,
}

/// Find the next `def name(params)` (or `async def`) after a decorator.
///
/// Blank lines, comments and stacked decorators are skipped; any other
/// statement means the marker had no function.
fn next_function_signature(rest: &str) -> Option<(String, Vec<Param>)> {
    let mut offset = 0usize;
    for line in rest.split_inclusive('\n') {
        let trimmed = line.trim();
        if let Some(sig) = trimmed
            .strip_prefix("async def ")
            .or_else(|| trimmed.strip_prefix("def "))
        {
            let name_end = sig.find('(')?;
            let name = sig[..name_end].trim().to_string();
            let paren_at = offset + line.find('(')?;
            let inner = capture_parens(&rest[paren_at..])?;
            return Some((name, parse_params(inner)));
        }
        if trimmed.is_empty() || trimmed.starts_with('@') || trimmed.starts_with('#') {
            offset += line.len();
            continue;
        }
        return None;
    }
    None
}

fn parse_params(inner: &str) -> Vec<Param> {
    split_top_level(inner)
        .into_iter()
        .filter_map(|raw| {
            let raw = raw.trim().to_string();
            if raw.is_empty() || raw == "self" || raw.starts_with('*') {
                return None;
            }
            let (head, default) = match split_once_top_level(&raw, '=') {
                Some((h, d)) => (h.trim().to_string(), Some(d)),
                None => (raw.clone(), None),
            };
            let (name, annotation) = match head.split_once(':') {
                Some((n, a)) => (n.trim().to_string(), Some(a.trim().to_string())),
                None => (head.trim().to_string(), None),
            };
            Some(Param {
                name,
                annotation,
                has_default: default.is_some(),
            })
        })
        .collect()
}

/// Split once on `sep` at nesting depth 0.
fn split_once_top_level(s: &str, sep: char) -> Option<(String, String)> {
    let mut depth = 0i32;
    let mut i = 0usize;
    while i < s.len() {
        let c = s[i..].chars().next().unwrap();
        if c == '"' || c == '\'' {
            let (_, len) = consume_string(&s[i..]);
            i += len;
            continue;
        }
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            c if c == sep && depth == 0 => {
                return Some((s[..i].to_string(), s[i + c.len_utf8()..].to_string()));
            }
            _ => {}
        }
        i += c.len_utf8();
    }
    None
}

/// Map a Python type annotation to a JSON-Schema type string.
fn annotation_to_json_type(annotation: &str) -> &'static str {
    let a = annotation.trim();
    let a = a
        .strip_prefix("Optional[")
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(a);
    let base = a.split('[').next().unwrap_or(a).trim();
    match base {
        "str" => "string",
        "int" => "integer",
        "float" => "number",
        "bool" => "boolean",
        "list" | "List" => "array",
        "dict" | "Dict" => "object",
        _ => "string",
    }
}

/// Synthesize an object schema with one property per parameter.
fn synthesize_schema(params: &[Param]) -> serde_json::Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for p in params {
        let ty = p
            .annotation
            .as_deref()
            .map(annotation_to_json_type)
            .unwrap_or("string");
        properties.insert(p.name.clone(), serde_json::json!({ "type": ty }));
        if !p.has_default {
            required.push(serde_json::Value::String(p.name.clone()));
        }
    }
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}
