//! External-skill marketplace: discovery against a versioned index file.
//!
//! The index is a JSON document `{version, skills: [{id, name, url,
//! description, keywords}]}`.  Entries are keyword-scored for `discover`,
//! the best match (with a rationale) backs `suggest`, and `jit-install`
//! clones the skill repository into the skills root.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// One marketplace entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexEntry {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// The versioned skills-index file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SkillsIndex {
    pub version: String,
    pub skills: Vec<IndexEntry>,
}

/// A scored discovery hit.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryHit {
    pub id: String,
    pub name: String,
    pub url: String,
    pub description: String,
    pub score: f64,
}

/// A suggestion for a free-form task.
#[derive(Debug, Clone, Serialize)]
pub struct Suggestion {
    pub id: String,
    pub rationale: String,
    pub score: f64,
}

/// Marketplace client over an index file on disk.
pub struct SkillDiscovery {
    index_path: PathBuf,
}

impl SkillDiscovery {
    pub fn new(index_path: impl Into<PathBuf>) -> Self {
        Self {
            index_path: index_path.into(),
        }
    }

    /// Load and validate the index: ids unique, urls GitHub-hosted.
    pub fn load_index(&self) -> anyhow::Result<SkillsIndex> {
        let raw = std::fs::read_to_string(&self.index_path)
            .with_context(|| format!("reading {}", self.index_path.display()))?;
        let index: SkillsIndex = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", self.index_path.display()))?;

        let mut seen = std::collections::HashSet::new();
        for entry in &index.skills {
            if !seen.insert(entry.id.as_str()) {
                bail!("duplicate skill id in index: {}", entry.id);
            }
            if !entry.url.starts_with("https://github.com/") {
                bail!("skill {} has a non-GitHub url: {}", entry.id, entry.url);
            }
        }
        debug!(count = index.skills.len(), version = %index.version, "skills index loaded");
        Ok(index)
    }

    /// Find an entry by id; underscores and hyphens are interchangeable.
    pub fn find_by_id(&self, id: &str) -> anyhow::Result<Option<IndexEntry>> {
        let index = self.load_index()?;
        let norm = id.replace('-', "_");
        Ok(index
            .skills
            .into_iter()
            .find(|e| e.id == id || e.id.replace('-', "_") == norm))
    }

    /// Keyword-score the index against a free-text query.
    ///
    /// An empty query lists every entry with score 0 (up to `limit`).
    pub fn discover(&self, query: &str, limit: usize) -> anyhow::Result<Vec<DiscoveryHit>> {
        let index = self.load_index()?;
        let terms: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(String::from)
            .collect();

        let mut hits: Vec<DiscoveryHit> = index
            .skills
            .into_iter()
            .filter_map(|e| {
                let score = score_entry(&e, &terms);
                if terms.is_empty() || score > 0.0 {
                    Some(DiscoveryHit {
                        id: e.id,
                        name: e.name,
                        url: e.url,
                        description: e.description,
                        score,
                    })
                } else {
                    None
                }
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    /// Suggest the best entry for a task description.
    pub fn suggest(&self, task: &str) -> anyhow::Result<Option<Suggestion>> {
        let hits = self.discover(task, 1)?;
        Ok(hits.into_iter().next().filter(|h| h.score > 0.0).map(|h| {
            let rationale = format!(
                "'{}' matches the task: {}",
                h.name,
                crate::utils::truncate_str(&h.description, 120)
            );
            Suggestion {
                id: h.id,
                rationale,
                score: h.score,
            }
        }))
    }

    /// Clone an indexed skill into the skills root.
    ///
    /// Fails when the id is unknown or the target directory already exists.
    pub async fn jit_install(&self, id: &str, skills_root: &Path) -> anyhow::Result<PathBuf> {
        let entry = self
            .find_by_id(id)?
            .with_context(|| format!("skill not found in index: {id}"))?;
        let target = skills_root.join(&entry.id);
        if target.exists() {
            bail!("skill already installed: {}", target.display());
        }
        tokio::fs::create_dir_all(skills_root).await?;

        let status = tokio::process::Command::new("git")
            .args(["clone", "--depth", "1", &entry.url])
            .arg(&target)
            .status()
            .await
            .context("spawning git clone")?;
        if !status.success() {
            bail!("git clone failed for {}", entry.url);
        }
        info!(skill = %entry.id, path = %target.display(), "skill installed");
        Ok(target)
    }
}

/// Score: keyword hit 3, name/id token hit 2, description substring 1.
fn score_entry(entry: &IndexEntry, terms: &[String]) -> f64 {
    let mut score = 0.0;
    let name_lower = entry.name.to_lowercase();
    let id_lower = entry.id.to_lowercase();
    let desc_lower = entry.description.to_lowercase();
    for term in terms {
        if entry
            .keywords
            .iter()
            .any(|k| k.to_lowercase().contains(term.as_str()))
        {
            score += 3.0;
        }
        if name_lower.contains(term.as_str()) || id_lower.contains(term.as_str()) {
            score += 2.0;
        }
        if desc_lower.contains(term.as_str()) {
            score += 1.0;
        }
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_index(dir: &Path) -> PathBuf {
        let path = dir.join("skills-index.json");
        let index = serde_json::json!({
            "version": "1.0.0",
            "skills": [
                {
                    "id": "web_scraper",
                    "name": "Web Scraper",
                    "url": "https://github.com/example/web-scraper",
                    "description": "Scrape and extract content from web pages",
                    "keywords": ["scrape", "web", "html"]
                },
                {
                    "id": "pdf_tools",
                    "name": "PDF Tools",
                    "url": "https://github.com/example/pdf-tools",
                    "description": "Read and split PDF documents",
                    "keywords": ["pdf", "documents"]
                }
            ]
        });
        std::fs::write(&path, serde_json::to_string_pretty(&index).unwrap()).unwrap();
        path
    }

    #[test]
    fn load_index_validates_shape() {
        let tmp = TempDir::new().unwrap();
        let discovery = SkillDiscovery::new(write_index(tmp.path()));
        let index = discovery.load_index().unwrap();
        assert_eq!(index.version, "1.0.0");
        assert_eq!(index.skills.len(), 2);
    }

    #[test]
    fn duplicate_ids_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("skills-index.json");
        std::fs::write(
            &path,
            r#"{"version":"1.0.0","skills":[
                {"id":"a","name":"A","url":"https://github.com/x/a"},
                {"id":"a","name":"A2","url":"https://github.com/x/a2"}]}"#,
        )
        .unwrap();
        assert!(SkillDiscovery::new(path).load_index().is_err());
    }

    #[test]
    fn non_github_url_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("skills-index.json");
        std::fs::write(
            &path,
            r#"{"version":"1.0.0","skills":[
                {"id":"a","name":"A","url":"https://evil.example/a"}]}"#,
        )
        .unwrap();
        assert!(SkillDiscovery::new(path).load_index().is_err());
    }

    #[test]
    fn discover_scores_keywords_highest() {
        let tmp = TempDir::new().unwrap();
        let discovery = SkillDiscovery::new(write_index(tmp.path()));
        let hits = discovery.discover("scrape a web page", 5).unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].id, "web_scraper");
    }

    #[test]
    fn discover_empty_query_lists_all() {
        let tmp = TempDir::new().unwrap();
        let discovery = SkillDiscovery::new(write_index(tmp.path()));
        let hits = discovery.discover("", 10).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn find_by_id_accepts_hyphen_variant() {
        let tmp = TempDir::new().unwrap();
        let discovery = SkillDiscovery::new(write_index(tmp.path()));
        assert!(discovery.find_by_id("web-scraper").unwrap().is_some());
        assert!(discovery.find_by_id("nope").unwrap().is_none());
    }

    #[test]
    fn suggest_returns_rationale() {
        let tmp = TempDir::new().unwrap();
        let discovery = SkillDiscovery::new(write_index(tmp.path()));
        let s = discovery.suggest("split a pdf document").unwrap().unwrap();
        assert_eq!(s.id, "pdf_tools");
        assert!(s.rationale.contains("PDF Tools"));
    }

    #[test]
    fn suggest_none_for_unrelated_task() {
        let tmp = TempDir::new().unwrap();
        let discovery = SkillDiscovery::new(write_index(tmp.path()));
        assert!(discovery.suggest("qqqq zzzz").unwrap().is_none());
    }

    #[tokio::test]
    async fn jit_install_unknown_id_fails() {
        let tmp = TempDir::new().unwrap();
        let discovery = SkillDiscovery::new(write_index(tmp.path()));
        let err = discovery
            .jit_install("nope", &tmp.path().join("skills"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn jit_install_existing_dir_fails() {
        let tmp = TempDir::new().unwrap();
        let discovery = SkillDiscovery::new(write_index(tmp.path()));
        let root = tmp.path().join("skills");
        std::fs::create_dir_all(root.join("web_scraper")).unwrap();
        let err = discovery.jit_install("web_scraper", &root).await.unwrap_err();
        assert!(err.to_string().contains("already installed"));
    }
}
