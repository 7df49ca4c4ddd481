//! Homeostasis: Git-branch transaction isolation for concurrent tasks,
//! plus semantic conflict detection before cross-branch merge.
//!
//! Each task runs on its own `omni-task/<suffix>` branch.  The shield
//! records a symbol index of every branch's changed public APIs; level
//! orchestration checks branch pairs for semantic conflicts and halts on
//! `critical` severity.  Concrete Git plumbing sits behind [`GitBackend`]
//! — a CLI implementation for real repositories and an in-memory fake
//! for tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::HomeostasisConfig;
use crate::errors::{ErrorKind, OmniError};

// ── Git boundary ────────────────────────────────────────────

/// The Git operations homeostasis needs; everything else about Git is
/// out of scope.
#[async_trait]
pub trait GitBackend: Send + Sync {
    async fn create_branch(&self, name: &str, from: &str) -> anyhow::Result<()>;
    async fn current_commit(&self, branch: &str) -> anyhow::Result<String>;
    async fn merge_ff(&self, from: &str, into: &str) -> anyhow::Result<()>;
    async fn delete_branch(&self, name: &str) -> anyhow::Result<()>;
    /// `(path, content digest)` of files changed on `branch` since `base`.
    async fn changed_files(&self, branch: &str, base: &str) -> anyhow::Result<Vec<(String, String)>>;
}

/// Shell-out implementation over a repository checkout.
pub struct CliGit {
    repo: PathBuf,
}

impl CliGit {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self { repo: repo.into() }
    }

    async fn git(&self, args: &[&str]) -> anyhow::Result<String> {
        let output = tokio::process::Command::new("git")
            .arg("-C")
            .arg(&self.repo)
            .args(args)
            .output()
            .await?;
        if !output.status.success() {
            anyhow::bail!(
                "git {args:?} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl GitBackend for CliGit {
    async fn create_branch(&self, name: &str, from: &str) -> anyhow::Result<()> {
        self.git(&["branch", name, from]).await.map(|_| ())
    }

    async fn current_commit(&self, branch: &str) -> anyhow::Result<String> {
        self.git(&["rev-parse", branch]).await
    }

    async fn merge_ff(&self, from: &str, into: &str) -> anyhow::Result<()> {
        self.git(&["checkout", into]).await?;
        self.git(&["merge", "--ff-only", from]).await.map(|_| ())
    }

    async fn delete_branch(&self, name: &str) -> anyhow::Result<()> {
        self.git(&["branch", "-D", name]).await.map(|_| ())
    }

    async fn changed_files(&self, branch: &str, base: &str) -> anyhow::Result<Vec<(String, String)>> {
        let diff = self
            .git(&["diff", "--name-only", &format!("{base}...{branch}")])
            .await?;
        let mut out = Vec::new();
        for path in diff.lines().filter(|l| !l.is_empty()) {
            let content = self
                .git(&["show", &format!("{branch}:{path}")])
                .await
                .unwrap_or_default();
            out.push((path.to_string(), crate::utils::content_hash(content.as_bytes())));
        }
        Ok(out)
    }
}

/// In-memory fake: branches are file maps, commits are counters.
#[derive(Default)]
pub struct InMemoryGit {
    branches: Mutex<HashMap<String, BTreeMap<String, String>>>,
    commit_seq: Mutex<u64>,
}

impl InMemoryGit {
    pub fn new(base_branch: &str, files: &[(&str, &str)]) -> Self {
        let git = Self::default();
        let tree: BTreeMap<String, String> = files
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect();
        git.branches
            .lock()
            .expect("branches poisoned")
            .insert(base_branch.to_string(), tree);
        git
    }

    /// Mutate a file on a branch (a task doing work).
    pub fn write_file(&self, branch: &str, path: &str, content: &str) {
        let mut branches = self.branches.lock().expect("branches poisoned");
        if let Some(tree) = branches.get_mut(branch) {
            tree.insert(path.to_string(), content.to_string());
        }
    }

    /// Snapshot of a branch tree (assertions).
    pub fn tree(&self, branch: &str) -> BTreeMap<String, String> {
        self.branches
            .lock()
            .expect("branches poisoned")
            .get(branch)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl GitBackend for InMemoryGit {
    async fn create_branch(&self, name: &str, from: &str) -> anyhow::Result<()> {
        let mut branches = self.branches.lock().expect("branches poisoned");
        let base = branches
            .get(from)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such branch: {from}"))?;
        branches.insert(name.to_string(), base);
        Ok(())
    }

    async fn current_commit(&self, branch: &str) -> anyhow::Result<String> {
        let branches = self.branches.lock().expect("branches poisoned");
        let tree = branches
            .get(branch)
            .ok_or_else(|| anyhow::anyhow!("no such branch: {branch}"))?;
        let mut seq = self.commit_seq.lock().expect("commit seq poisoned");
        *seq += 1;
        let mut digest_input = String::new();
        for (path, content) in tree {
            digest_input.push_str(path);
            digest_input.push_str(content);
        }
        Ok(crate::utils::content_hash(digest_input.as_bytes()))
    }

    async fn merge_ff(&self, from: &str, into: &str) -> anyhow::Result<()> {
        let mut branches = self.branches.lock().expect("branches poisoned");
        let source = branches
            .get(from)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such branch: {from}"))?;
        branches.insert(into.to_string(), source);
        Ok(())
    }

    async fn delete_branch(&self, name: &str) -> anyhow::Result<()> {
        self.branches.lock().expect("branches poisoned").remove(name);
        Ok(())
    }

    async fn changed_files(&self, branch: &str, base: &str) -> anyhow::Result<Vec<(String, String)>> {
        let branches = self.branches.lock().expect("branches poisoned");
        let branch_tree = branches.get(branch).cloned().unwrap_or_default();
        let base_tree = branches.get(base).cloned().unwrap_or_default();
        Ok(branch_tree
            .into_iter()
            .filter(|(path, content)| base_tree.get(path) != Some(content))
            .map(|(path, content)| (path, crate::utils::content_hash(content.as_bytes())))
            .collect())
    }
}

// ── Transactions ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Idle,
    Active,
    Merged,
    RolledBack,
    Conflict,
}

#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub task_id: String,
    pub branch_name: String,
    pub status: TransactionStatus,
    pub base_commit: String,
    /// path → content digest
    pub changes: HashMap<String, String>,
    pub conflicts: Vec<Conflict>,
}

/// Branch name for a task: `omni-task/<last 8 chars of task_id>`.
pub fn branch_name_for(task_id: &str) -> String {
    let suffix: String = if task_id.len() <= 8 {
        task_id.to_string()
    } else {
        task_id.chars().skip(task_id.chars().count() - 8).collect()
    };
    format!("omni-task/{suffix}")
}

// ── Symbol index & conflict detection ───────────────────────

/// Public-API symbols extracted from one branch's changed files.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BranchSymbols {
    /// function name → signature
    pub functions: HashMap<String, String>,
    /// class name → (attribute → type)
    pub classes: HashMap<String, HashMap<String, String>>,
    pub imports: Vec<String>,
    /// files this branch touched
    pub files: HashSet<String>,
}

/// Extract functions, class attributes and imports from source text.
///
/// Line-level, Python-ish (also catches Rust `fn`): enough to compare
/// public API shapes across branches, not a real parser.
pub fn extract_symbols(path: &str, source: &str) -> BranchSymbols {
    let mut symbols = BranchSymbols::default();
    symbols.files.insert(path.to_string());

    let mut current_class: Option<String> = None;
    for line in source.lines() {
        let trimmed = line.trim_start();
        let indent = line.len() - trimmed.len();

        if let Some(rest) = trimmed
            .strip_prefix("def ")
            .or_else(|| trimmed.strip_prefix("async def "))
            .or_else(|| trimmed.strip_prefix("fn "))
            .or_else(|| trimmed.strip_prefix("pub fn "))
        {
            if let Some(open) = rest.find('(') {
                let name = rest[..open].trim().to_string();
                let close = rest.rfind(')').unwrap_or(rest.len());
                let signature = rest[open + 1..close.max(open + 1)].trim().to_string();
                if indent == 0 {
                    current_class = None;
                }
                symbols.functions.insert(name, signature);
            }
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("class ") {
            let name: String = rest
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            if !name.is_empty() {
                symbols.classes.entry(name.clone()).or_default();
                current_class = Some(name);
            }
            continue;
        }

        if trimmed.starts_with("import ") || trimmed.starts_with("from ") || trimmed.starts_with("use ")
        {
            symbols.imports.push(trimmed.to_string());
            continue;
        }

        // Annotated class attribute: `attr: type` (or `attr: type = …`)
        // directly inside the class body.
        if let Some(class) = current_class.clone() {
            if indent == 0 && !trimmed.is_empty() {
                current_class = None;
                continue;
            }
            if let Some((name, rest)) = trimmed.split_once(':') {
                let name = name.trim();
                if !name.is_empty()
                    && name.chars().all(|c| c.is_alphanumeric() || c == '_')
                    && !rest.trim().is_empty()
                {
                    let ty = rest
                        .split('=')
                        .next()
                        .unwrap_or("")
                        .trim()
                        .to_string();
                    symbols
                        .classes
                        .entry(class)
                        .or_default()
                        .insert(name.to_string(), ty);
                }
            }
        }
    }
    symbols
}

/// Merge one more file's symbols into a branch's accumulated set.
pub fn merge_symbols(into: &mut BranchSymbols, from: BranchSymbols) {
    into.functions.extend(from.functions);
    for (class, attrs) in from.classes {
        into.classes.entry(class).or_default().extend(attrs);
    }
    into.imports.extend(from.imports);
    into.files.extend(from.files);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Conflict {
    #[serde(rename = "type")]
    pub conflict_type: String,
    pub symbol: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConflictReport {
    pub has_conflicts: bool,
    pub severity: ConflictSeverity,
    pub conflicts: Vec<Conflict>,
    pub suggestions: Vec<String>,
    pub auto_resolvable: bool,
}

/// Pairwise semantic conflict detection between branches.
#[derive(Default)]
pub struct ConflictDetector {
    previous_symbols: HashMap<String, BranchSymbols>,
}

impl ConflictDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_symbols(&mut self, branch: &str, symbols: BranchSymbols) {
        self.previous_symbols.insert(branch.to_string(), symbols);
    }

    pub fn symbols_for(&self, branch: &str) -> Option<&BranchSymbols> {
        self.previous_symbols.get(branch)
    }

    /// Compare two branches' recorded symbols.
    ///
    /// Severity: identical shapes or disjoint files → none; same file
    /// touched → medium; signature change → high; attribute type change
    /// → high; removed class attributes → critical.
    pub fn detect_conflicts(&self, branch_a: &str, branch_b: &str) -> ConflictReport {
        let empty = BranchSymbols::default();
        let a = self.previous_symbols.get(branch_a).unwrap_or(&empty);
        let b = self.previous_symbols.get(branch_b).unwrap_or(&empty);

        let mut conflicts: Vec<Conflict> = Vec::new();
        let mut suggestions: Vec<String> = Vec::new();

        // Same file touched by both tasks.
        for file in a.files.intersection(&b.files) {
            conflicts.push(Conflict {
                conflict_type: "file_conflict".into(),
                symbol: file.clone(),
                detail: format!("both branches modify {file}"),
            });
            suggestions.push(format!("serialize the two tasks touching {file}"));
        }

        // Function signature divergence.
        for (name, sig_a) in &a.functions {
            if let Some(sig_b) = b.functions.get(name) {
                if sig_a != sig_b {
                    conflicts.push(Conflict {
                        conflict_type: "function_signature".into(),
                        symbol: name.clone(),
                        detail: format!("'{sig_a}' vs '{sig_b}'"),
                    });
                    suggestions.push(format!("reconcile the signature of {name} before merging"));
                }
            }
        }

        // Class attribute shape changes.
        for (class, attrs_a) in &a.classes {
            let Some(attrs_b) = b.classes.get(class) else {
                continue;
            };
            let removed: Vec<&String> = attrs_a
                .keys()
                .filter(|attr| !attrs_b.contains_key(*attr))
                .collect();
            if !removed.is_empty() {
                conflicts.push(Conflict {
                    conflict_type: "class_attributes_removed".into(),
                    symbol: class.clone(),
                    detail: format!(
                        "attributes removed: {}",
                        removed.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
                    ),
                });
                suggestions.push(format!(
                    "removed attributes on {class} break the other branch; merge manually"
                ));
            }
            for (attr, ty_a) in attrs_a {
                if let Some(ty_b) = attrs_b.get(attr) {
                    if ty_a != ty_b {
                        conflicts.push(Conflict {
                            conflict_type: "attribute_type_changed".into(),
                            symbol: format!("{class}.{attr}"),
                            detail: format!("'{ty_a}' vs '{ty_b}'"),
                        });
                        suggestions.push(format!("align the type of {class}.{attr}"));
                    }
                }
            }
        }

        let severity = conflicts
            .iter()
            .map(|c| match c.conflict_type.as_str() {
                "class_attributes_removed" => ConflictSeverity::Critical,
                "function_signature" | "attribute_type_changed" => ConflictSeverity::High,
                "file_conflict" => ConflictSeverity::Medium,
                _ => ConflictSeverity::Low,
            })
            .max()
            .unwrap_or(ConflictSeverity::None);

        ConflictReport {
            has_conflicts: !conflicts.is_empty(),
            auto_resolvable: severity <= ConflictSeverity::Medium,
            severity,
            conflicts,
            suggestions,
        }
    }
}

// ── Transaction shield ──────────────────────────────────────

/// Orchestrates per-task branch transactions.
pub struct TransactionShield<G: GitBackend> {
    git: G,
    config: HomeostasisConfig,
    transactions: Mutex<HashMap<String, Transaction>>,
    detector: Mutex<ConflictDetector>,
}

impl<G: GitBackend> TransactionShield<G> {
    pub fn new(git: G, config: HomeostasisConfig) -> Self {
        Self {
            git,
            config,
            transactions: Mutex::new(HashMap::new()),
            detector: Mutex::new(ConflictDetector::new()),
        }
    }

    pub fn git(&self) -> &G {
        &self.git
    }

    pub fn get_transaction(&self, task_id: &str) -> Option<Transaction> {
        self.transactions
            .lock()
            .expect("transactions poisoned")
            .get(task_id)
            .cloned()
    }

    /// Open a branch transaction for a task.
    pub async fn begin(&self, task_id: &str) -> Result<Transaction, OmniError> {
        let branch_name = branch_name_for(task_id);
        let base_commit = self
            .git
            .current_commit(&self.config.base_branch)
            .await
            .map_err(homeo_err)?;
        self.git
            .create_branch(&branch_name, &self.config.base_branch)
            .await
            .map_err(homeo_err)?;

        let transaction = Transaction {
            task_id: task_id.to_string(),
            branch_name: branch_name.clone(),
            status: TransactionStatus::Active,
            base_commit,
            changes: HashMap::new(),
            conflicts: Vec::new(),
        };
        self.transactions
            .lock()
            .expect("transactions poisoned")
            .insert(task_id.to_string(), transaction.clone());
        debug!(task = task_id, branch = %branch_name, "transaction opened");
        Ok(transaction)
    }

    /// Record a task's changed files: digests for the transaction and a
    /// symbol index for conflict detection.
    pub fn record_changes(&self, task_id: &str, files: &[(String, String)]) -> Result<(), OmniError> {
        let mut transactions = self.transactions.lock().expect("transactions poisoned");
        let transaction = transactions.get_mut(task_id).ok_or_else(|| {
            OmniError::new(
                ErrorKind::HomeostasisConflict,
                format!("no transaction for task {task_id}"),
            )
        })?;

        let mut branch_symbols = BranchSymbols::default();
        for (path, content) in files {
            transaction
                .changes
                .insert(path.clone(), crate::utils::content_hash(content.as_bytes()));
            merge_symbols(&mut branch_symbols, extract_symbols(path, content));
        }
        let branch = transaction.branch_name.clone();
        drop(transactions);
        self.detector
            .lock()
            .expect("detector poisoned")
            .record_symbols(&branch, branch_symbols);
        Ok(())
    }

    /// Merge on success (fast-forward into base) or roll the branch back.
    pub async fn commit_or_rollback(
        &self,
        task_id: &str,
        success: bool,
    ) -> Result<TransactionStatus, OmniError> {
        let (branch, _status) = {
            let transactions = self.transactions.lock().expect("transactions poisoned");
            let t = transactions.get(task_id).ok_or_else(|| {
                OmniError::new(
                    ErrorKind::HomeostasisConflict,
                    format!("no transaction for task {task_id}"),
                )
            })?;
            (t.branch_name.clone(), t.status)
        };

        let new_status = if success && self.config.auto_merge_on_success {
            self.git
                .merge_ff(&branch, &self.config.base_branch)
                .await
                .map_err(homeo_err)?;
            self.git.delete_branch(&branch).await.ok();
            info!(task = task_id, "transaction merged");
            TransactionStatus::Merged
        } else if !success && self.config.auto_rollback_on_failure {
            self.git.delete_branch(&branch).await.map_err(homeo_err)?;
            info!(task = task_id, "transaction rolled back");
            TransactionStatus::RolledBack
        } else {
            TransactionStatus::Idle
        };

        if let Some(t) = self
            .transactions
            .lock()
            .expect("transactions poisoned")
            .get_mut(task_id)
        {
            t.status = new_status;
        }
        Ok(new_status)
    }

    /// Pairwise conflict check across one level of parallel tasks.
    ///
    /// On `critical` severity the run halts: affected transactions flip
    /// to `conflict` status and a structured error is returned alongside
    /// the reports.
    pub fn detect_level_conflicts(
        &self,
        level_task_ids: &[String],
    ) -> (Vec<(String, String, ConflictReport)>, Option<OmniError>) {
        let branches: Vec<(String, String)> = {
            let transactions = self.transactions.lock().expect("transactions poisoned");
            level_task_ids
                .iter()
                .filter_map(|id| {
                    transactions
                        .get(id)
                        .map(|t| (id.clone(), t.branch_name.clone()))
                })
                .collect()
        };

        let detector = self.detector.lock().expect("detector poisoned");
        let mut reports = Vec::new();
        let mut critical: Option<OmniError> = None;
        for (i, (task_a, branch_a)) in branches.iter().enumerate() {
            for (task_b, branch_b) in branches.iter().skip(i + 1) {
                let report = detector.detect_conflicts(branch_a, branch_b);
                if report.severity == ConflictSeverity::Critical && critical.is_none() {
                    warn!(a = %task_a, b = %task_b, "critical conflict, halting level");
                    critical = Some(OmniError::new(
                        ErrorKind::HomeostasisConflict,
                        format!("critical conflict between {task_a} and {task_b}"),
                    ));
                    let mut transactions =
                        self.transactions.lock().expect("transactions poisoned");
                    for id in [task_a, task_b] {
                        if let Some(t) = transactions.get_mut(id.as_str()) {
                            t.status = TransactionStatus::Conflict;
                            t.conflicts = report.conflicts.clone();
                        }
                    }
                }
                reports.push((task_a.clone(), task_b.clone(), report));
            }
        }
        (reports, critical)
    }
}

fn homeo_err(e: anyhow::Error) -> OmniError {
    OmniError::new(ErrorKind::HomeostasisConflict, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_name_uses_last_eight_chars() {
        assert_eq!(branch_name_for("test"), "omni-task/test");
        assert_eq!(branch_name_for("task_refactor_auth"), "omni-task/tor_auth");
        assert_eq!(branch_name_for("abcdefgh"), "omni-task/abcdefgh");
    }

    #[test]
    fn extract_functions_classes_imports() {
        let source = "import os\nfrom typing import Optional\n\nclass Database:\n    connection: str\n    timeout: int = 30\n\ndef connect(url: str, retries: int = 3):\n    pass\n";
        let symbols = extract_symbols("db.py", source);
        assert_eq!(symbols.functions["connect"], "url: str, retries: int = 3");
        assert_eq!(symbols.classes["Database"]["connection"], "str");
        assert_eq!(symbols.classes["Database"]["timeout"], "int");
        assert_eq!(symbols.imports.len(), 2);
        assert!(symbols.files.contains("db.py"));
    }

    fn detector_with(branch_a_src: &str, branch_b_src: &str, same_file: bool) -> ConflictDetector {
        let mut detector = ConflictDetector::new();
        detector.record_symbols("branch_a", extract_symbols("a.py", branch_a_src));
        let file_b = if same_file { "a.py" } else { "b.py" };
        detector.record_symbols("branch_b", extract_symbols(file_b, branch_b_src));
        detector
    }

    #[test]
    fn disjoint_files_no_conflict() {
        let detector = detector_with("def alpha(x):\n    pass\n", "def beta(y):\n    pass\n", false);
        let report = detector.detect_conflicts("branch_a", "branch_b");
        assert!(!report.has_conflicts);
        assert_eq!(report.severity, ConflictSeverity::None);
        assert!(report.auto_resolvable);
    }

    #[test]
    fn identical_symbols_no_conflict_severity() {
        let source = "def connect(url: str):\n    pass\n";
        let detector = detector_with(source, source, false);
        let report = detector.detect_conflicts("branch_a", "branch_b");
        assert_eq!(report.severity, ConflictSeverity::None);
    }

    #[test]
    fn same_file_is_medium() {
        let detector = detector_with("def alpha(x):\n    pass\n", "def beta(y):\n    pass\n", true);
        let report = detector.detect_conflicts("branch_a", "branch_b");
        assert_eq!(report.severity, ConflictSeverity::Medium);
        assert_eq!(report.conflicts[0].conflict_type, "file_conflict");
        assert!(report.auto_resolvable);
    }

    #[test]
    fn signature_change_is_high() {
        let detector = detector_with(
            "def connect(url: str):\n    pass\n",
            "def connect(url: str, timeout: int):\n    pass\n",
            false,
        );
        let report = detector.detect_conflicts("branch_a", "branch_b");
        assert_eq!(report.severity, ConflictSeverity::High);
        assert!(report
            .conflicts
            .iter()
            .any(|c| c.conflict_type == "function_signature"));
        assert!(!report.auto_resolvable);
    }

    #[test]
    fn attribute_type_change_is_high() {
        let detector = detector_with(
            "class Database:\n    timeout: int\n",
            "class Database:\n    timeout: float\n",
            false,
        );
        let report = detector.detect_conflicts("branch_a", "branch_b");
        assert_eq!(report.severity, ConflictSeverity::High);
        assert!(report
            .conflicts
            .iter()
            .any(|c| c.conflict_type == "attribute_type_changed"));
    }

    #[test]
    fn removed_attributes_are_critical() {
        let detector = detector_with(
            "class Database:\n    connection: str\n    timeout: int\n",
            "class Database:\n    connection: str\n",
            false,
        );
        let report = detector.detect_conflicts("branch_a", "branch_b");
        assert_eq!(report.severity, ConflictSeverity::Critical);
        assert_eq!(report.conflicts[0].conflict_type, "class_attributes_removed");
        assert!(!report.auto_resolvable);
    }

    fn shield() -> TransactionShield<InMemoryGit> {
        let git = InMemoryGit::new("main", &[("README.md", "# repo\n")]);
        TransactionShield::new(git, HomeostasisConfig::default())
    }

    #[tokio::test]
    async fn begin_creates_branch_and_transaction() {
        let shield = shield();
        let t = shield.begin("task_refactor_auth").await.unwrap();
        assert_eq!(t.branch_name, "omni-task/tor_auth");
        assert_eq!(t.status, TransactionStatus::Active);
        assert!(!t.base_commit.is_empty());
        assert_eq!(
            shield.git().tree("omni-task/tor_auth"),
            shield.git().tree("main")
        );
    }

    #[tokio::test]
    async fn successful_task_merges_into_base() {
        let shield = shield();
        shield.begin("task_one").await.unwrap();
        shield
            .git()
            .write_file("omni-task/task_one", "lib.py", "def f():\n    pass\n");
        shield
            .record_changes(
                "task_one",
                &[("lib.py".to_string(), "def f():\n    pass\n".to_string())],
            )
            .unwrap();
        let status = shield.commit_or_rollback("task_one", true).await.unwrap();
        assert_eq!(status, TransactionStatus::Merged);
        assert!(shield.git().tree("main").contains_key("lib.py"));
    }

    #[tokio::test]
    async fn rollback_leaves_base_untouched() {
        let shield = shield();
        let before = shield.git().tree("main");
        shield.begin("task_two").await.unwrap();
        shield
            .git()
            .write_file("omni-task/task_two", "junk.py", "broken");
        let status = shield.commit_or_rollback("task_two", false).await.unwrap();
        assert_eq!(status, TransactionStatus::RolledBack);
        assert_eq!(shield.git().tree("main"), before);
        assert!(shield.git().tree("omni-task/task_two").is_empty());
    }

    #[tokio::test]
    async fn level_conflict_halts_on_critical() {
        let shield = shield();
        shield.begin("task_aaa").await.unwrap();
        shield.begin("task_bbb").await.unwrap();

        shield
            .record_changes(
                "task_aaa",
                &[(
                    "db.py".to_string(),
                    "class Database:\n    connection: str\n    timeout: int\n".to_string(),
                )],
            )
            .unwrap();
        shield
            .record_changes(
                "task_bbb",
                &[(
                    "models.py".to_string(),
                    "class Database:\n    connection: str\n".to_string(),
                )],
            )
            .unwrap();

        let (reports, halt) =
            shield.detect_level_conflicts(&["task_aaa".to_string(), "task_bbb".to_string()]);
        assert_eq!(reports.len(), 1);
        let report = &reports[0].2;
        assert_eq!(report.severity, ConflictSeverity::Critical);
        assert_eq!(report.conflicts[0].conflict_type, "class_attributes_removed");
        assert!(!report.auto_resolvable);

        let err = halt.unwrap();
        assert_eq!(err.kind, ErrorKind::HomeostasisConflict);
        assert_eq!(
            shield.get_transaction("task_aaa").unwrap().status,
            TransactionStatus::Conflict
        );
    }

    #[tokio::test]
    async fn parallel_disjoint_tasks_pass_level_check() {
        let shield = shield();
        shield.begin("task_aaa").await.unwrap();
        shield.begin("task_bbb").await.unwrap();
        shield
            .record_changes("task_aaa", &[("a.py".to_string(), "def a():\n    pass\n".to_string())])
            .unwrap();
        shield
            .record_changes("task_bbb", &[("b.py".to_string(), "def b():\n    pass\n".to_string())])
            .unwrap();
        let (reports, halt) =
            shield.detect_level_conflicts(&["task_aaa".to_string(), "task_bbb".to_string()]);
        assert!(halt.is_none());
        assert_eq!(reports[0].2.severity, ConflictSeverity::None);
    }
}
