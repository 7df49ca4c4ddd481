//! Note/link graph (Core 1, half one): markdown notes with wiki-style
//! `[[links]]` and `#tags`.
//!
//! The graph is built from a notes directory on demand and answers
//! neighbourhood queries for the link-proximity boost.  An unavailable
//! or empty notes directory yields an empty graph — never an error.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tracing::debug;

/// In-memory link graph keyed by note stem (filename without extension).
#[derive(Debug, Default)]
pub struct NoteGraph {
    /// stem → outgoing link stems
    links_out: HashMap<String, HashSet<String>>,
    /// stem → incoming link stems
    links_in: HashMap<String, HashSet<String>>,
    /// stem → tags
    tags: HashMap<String, HashSet<String>>,
    available: bool,
}

impl NoteGraph {
    /// Build the graph from every `*.md` under `notes_dir` (recursive).
    pub fn load(notes_dir: &Path) -> Self {
        let mut graph = NoteGraph::default();
        if !notes_dir.is_dir() {
            debug!(dir = %notes_dir.display(), "notes directory missing, graph unavailable");
            return graph;
        }
        graph.available = true;
        let mut stack = vec![notes_dir.to_path_buf()];
        let mut files: Vec<PathBuf> = Vec::new();
        while let Some(dir) = stack.pop() {
            if let Ok(rd) = std::fs::read_dir(&dir) {
                for entry in rd.filter_map(|e| e.ok()) {
                    let p = entry.path();
                    if p.is_dir() {
                        stack.push(p);
                    } else if p.extension().and_then(|e| e.to_str()) == Some("md") {
                        files.push(p);
                    }
                }
            }
        }
        files.sort();
        for file in files {
            let Some(stem) = file.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(content) = std::fs::read_to_string(&file) else {
                continue;
            };
            graph.index_note(stem, &content);
        }
        debug!(notes = graph.links_out.len(), "note graph loaded");
        graph
    }

    /// True when a notes directory backed this graph.
    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Register one note's links and tags.
    pub fn index_note(&mut self, stem: &str, content: &str) {
        self.available = true;
        let entry = self.links_out.entry(stem.to_string()).or_default();
        for target in wiki_links(content) {
            entry.insert(target.clone());
            self.links_in
                .entry(target)
                .or_default()
                .insert(stem.to_string());
        }
        let tags = tags(content);
        if !tags.is_empty() {
            self.tags.entry(stem.to_string()).or_default().extend(tags);
        }
    }

    /// Stems linked to or from `stem` (undirected neighbourhood).
    pub fn neighbors(&self, stem: &str) -> HashSet<String> {
        let mut out: HashSet<String> = self
            .links_out
            .get(stem)
            .cloned()
            .unwrap_or_default();
        if let Some(incoming) = self.links_in.get(stem) {
            out.extend(incoming.iter().cloned());
        }
        out
    }

    /// Total notes seen.
    pub fn note_count(&self) -> usize {
        self.links_out.len()
    }

    /// Tags of a note.
    pub fn note_tags(&self, stem: &str) -> HashSet<String> {
        self.tags.get(stem).cloned().unwrap_or_default()
    }
}

/// Extract `[[wiki link]]` targets, normalized to stems.
fn wiki_links(content: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = content;
    while let Some(start) = rest.find("[[") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("]]") else {
            break;
        };
        let target = after[..end].trim();
        // `[[note|alias]]` links by the part before the pipe.
        let target = target.split('|').next().unwrap_or(target).trim();
        if !target.is_empty() {
            out.push(target.to_string());
        }
        rest = &after[end + 2..];
    }
    out
}

/// Extract `#tag` tokens (excluding markdown headings).
fn tags(content: &str) -> HashSet<String> {
    let mut out = HashSet::new();
    for line in content.lines() {
        if line.trim_start().starts_with('#') && line.trim_start().starts_with("# ") {
            continue; // heading, not a tag
        }
        for word in line.split_whitespace() {
            if let Some(tag) = word.strip_prefix('#') {
                let tag: String = tag
                    .chars()
                    .take_while(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
                    .collect();
                if !tag.is_empty() {
                    out.insert(tag);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn loads_links_and_neighbors() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("alpha.md"),
            "# Alpha\n\nSee [[beta]] and [[gamma|the gamma note]].\n",
        )
        .unwrap();
        std::fs::write(tmp.path().join("beta.md"), "Back to [[alpha]].\n").unwrap();

        let graph = NoteGraph::load(tmp.path());
        assert!(graph.is_available());
        let n = graph.neighbors("alpha");
        assert!(n.contains("beta"));
        assert!(n.contains("gamma"));
        // beta links alpha and alpha links beta → both directions.
        assert!(graph.neighbors("beta").contains("alpha"));
    }

    #[test]
    fn incoming_links_count_as_neighbors() {
        let mut graph = NoteGraph::default();
        graph.index_note("a", "see [[b]]");
        // b never links anyone, but a → b makes a a neighbor of b.
        assert!(graph.neighbors("b").contains("a"));
    }

    #[test]
    fn missing_dir_is_unavailable() {
        let graph = NoteGraph::load(Path::new("/nonexistent/notes"));
        assert!(!graph.is_available());
        assert!(graph.neighbors("anything").is_empty());
    }

    #[test]
    fn tags_extracted_but_headings_skipped() {
        let mut graph = NoteGraph::default();
        graph.index_note("n", "# Heading\n\nbody with #rust and #agent-kernel tags\n");
        let tags = graph.note_tags("n");
        assert!(tags.contains("rust"));
        assert!(tags.contains("agent-kernel"));
        assert!(!tags.contains("Heading"));
    }
}
