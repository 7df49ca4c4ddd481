//! Skill kernel: the runtime registry of loaded skills.
//!
//! The kernel exclusively owns loaded skills, the command table and the
//! local-handler registry; routers and orchestrators borrow read-only
//! views for one request.  `get_skill` runs the hot-reload probe: a
//! newer on-disk mtime transparently reloads the skill under a per-skill
//! lock, and a failed reload keeps the old skill live.

pub mod context_cache;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::errors::{ErrorKind, OmniError};
use crate::skills::scanner::{self, ScannedSkill};
use crate::skills::{ExecutionMode, SkillManifest};

/// Async handler bound to a `local` command.
pub type LocalHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>> + Send + Sync>;

/// Default wall-clock budget for a script command.
const SCRIPT_TIMEOUT_SECS: u64 = 60;

/// One executable command owned by a loaded skill (or registered
/// synthetically by the host).
#[derive(Debug, Clone)]
pub struct Command {
    pub name: String,
    pub tool_name: String,
    pub description: String,
    pub category: String,
    pub schema: Value,
    pub execution_mode: ExecutionMode,
    /// Script path relative to the skill directory (script commands).
    pub file_path: String,
}

/// A skill held live by the kernel.
pub struct LoadedSkill {
    pub name: String,
    pub manifest: SkillManifest,
    pub path: PathBuf,
    pub mtime: f64,
    pub commands: HashMap<String, Command>,
    pub guide: String,
    context: OnceLock<String>,
}

impl LoadedSkill {
    fn from_scan(scan: ScannedSkill) -> Self {
        let commands = scan
            .tools
            .iter()
            .map(|t| {
                (
                    t.command().to_string(),
                    Command {
                        name: t.command().to_string(),
                        tool_name: t.tool_name.clone(),
                        description: t.description.clone(),
                        category: t.category.clone(),
                        schema: t.input_schema.clone(),
                        execution_mode: t.execution_mode,
                        file_path: t.file_path.clone(),
                    },
                )
            })
            .collect();
        Self {
            name: scan.manifest.name.clone(),
            manifest: scan.manifest,
            path: scan.path,
            mtime: scan.mtime,
            commands,
            guide: scan.guide,
            context: OnceLock::new(),
        }
    }

    /// Lazily built packed context bundle; dies with this instance on
    /// reload, which is exactly the invalidation the cache needs.
    pub fn context_bundle(&self) -> &str {
        self.context
            .get_or_init(|| context_cache::build_bundle(&self.manifest, &self.guide, &self.path))
    }
}

/// Outcome of loading (or reloading) one skill.
#[derive(Debug, Clone)]
pub struct LoadResult {
    pub skill_name: String,
    pub ok: bool,
    pub error: Option<OmniError>,
    pub duration_ms: u64,
}

/// Aggregate stats for `load_all`.
#[derive(Debug, Clone, Default)]
pub struct LoadStats {
    pub loaded: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

/// The kernel.  Cheap to share behind an `Arc`.
pub struct Kernel {
    skills_dir: PathBuf,
    max_concurrent: usize,
    skills: RwLock<HashMap<String, Arc<LoadedSkill>>>,
    /// Host-registered commands that have no skill directory
    /// (`skill.discover` and test stubs).
    synthetic: RwLock<HashMap<String, Command>>,
    handlers: RwLock<HashMap<String, LocalHandler>>,
    core: RwLock<HashSet<String>>,
    /// Skills the router has explicitly activated; their dynamic
    /// commands stay hidden from the LLM otherwise.
    active: RwLock<HashSet<String>>,
    reload_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Kernel {
    pub fn new(skills_dir: impl Into<PathBuf>, max_concurrent: usize) -> Self {
        Self {
            skills_dir: skills_dir.into(),
            max_concurrent: max_concurrent.max(1),
            skills: RwLock::new(HashMap::new()),
            synthetic: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            core: RwLock::new(HashSet::new()),
            active: RwLock::new(HashSet::new()),
            reload_locks: Mutex::new(HashMap::new()),
        }
    }

    // ── Loading ─────────────────────────────────────────────

    /// Discover, validate and load every skill under the skills root.
    ///
    /// Parallel with a bounded work-pool; one poisonous skill never
    /// prevents healthy neighbours from loading.
    pub async fn load_all(self: &Arc<Self>) -> (Vec<LoadResult>, LoadStats) {
        let start = std::time::Instant::now();
        let mut dirs: Vec<PathBuf> = match std::fs::read_dir(&self.skills_dir) {
            Ok(rd) => rd
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir() && p.join("SKILL.md").is_file())
                .collect(),
            Err(e) => {
                warn!(dir = %self.skills_dir.display(), error = %e, "skills root not readable");
                return (Vec::new(), LoadStats::default());
            }
        };
        dirs.sort();

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut join_set = tokio::task::JoinSet::new();
        for dir in dirs {
            let semaphore = Arc::clone(&semaphore);
            let kernel = Arc::clone(self);
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                kernel.load_one(&dir).await
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            if let Ok(result) = joined {
                results.push(result);
            }
        }
        results.sort_by(|a, b| a.skill_name.cmp(&b.skill_name));

        let stats = LoadStats {
            loaded: results.iter().filter(|r| r.ok).count(),
            failed: results.iter().filter(|r| !r.ok).count(),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            loaded = stats.loaded,
            failed = stats.failed,
            duration_ms = stats.duration_ms,
            "skill load complete"
        );
        (results, stats)
    }

    async fn load_one(&self, dir: &PathBuf) -> LoadResult {
        let start = std::time::Instant::now();
        let dir_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let scan = {
            let dir = dir.clone();
            tokio::task::spawn_blocking(move || scanner::scan_skill(&dir)).await
        };
        let result = match scan {
            Ok(Ok(scan)) => {
                let name = scan.manifest.name.clone();
                let loaded = Arc::new(LoadedSkill::from_scan(scan));
                self.skills
                    .write()
                    .expect("skill registry poisoned")
                    .insert(name.clone(), loaded);
                LoadResult {
                    skill_name: name,
                    ok: true,
                    error: None,
                    duration_ms: start.elapsed().as_millis() as u64,
                }
            }
            Ok(Err(e)) => {
                warn!(skill = %dir_name, kind = e.kind.as_str(), "skill failed to load");
                LoadResult {
                    skill_name: dir_name,
                    ok: false,
                    error: Some(e),
                    duration_ms: start.elapsed().as_millis() as u64,
                }
            }
            Err(join_err) => LoadResult {
                skill_name: dir_name,
                ok: false,
                error: Some(OmniError::new(
                    ErrorKind::SkillLoadFailed,
                    format!("scan task failed: {join_err}"),
                )),
                duration_ms: start.elapsed().as_millis() as u64,
            },
        };
        result
    }

    // ── Hot reload ──────────────────────────────────────────

    /// Fetch a skill, transparently reloading it when the on-disk
    /// mtime is newer than the cached one.
    pub async fn get_skill(&self, name: &str) -> Option<Arc<LoadedSkill>> {
        let cached = self
            .skills
            .read()
            .expect("skill registry poisoned")
            .get(name)
            .cloned();
        let cached = cached?;

        let disk_mtime = scanner::newest_mtime(&cached.path);
        if disk_mtime <= cached.mtime {
            return Some(cached);
        }

        debug!(skill = name, "mtime changed, hot reloading");
        match self.reload_skill(name).await {
            result if result.ok => self
                .skills
                .read()
                .expect("skill registry poisoned")
                .get(name)
                .cloned(),
            _ => Some(cached), // failed reload keeps the old skill live
        }
    }

    /// Unconditional reload.  Serialized per skill; concurrent reloads of
    /// different skills proceed in parallel.  On failure the previous
    /// skill stays registered — the kernel never holds a half-loaded
    /// state.
    pub async fn reload_skill(&self, name: &str) -> LoadResult {
        let lock = self.reload_lock_for(name);
        let _guard = lock.lock().await;
        let start = std::time::Instant::now();

        let path = {
            let skills = self.skills.read().expect("skill registry poisoned");
            match skills.get(name) {
                Some(s) => s.path.clone(),
                None => self.skills_dir.join(name),
            }
        };

        let scan = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || scanner::scan_skill(&path)).await
        };
        match scan {
            Ok(Ok(scan)) => {
                let new_commands: HashSet<String> =
                    scan.tools.iter().map(|t| t.tool_name.clone()).collect();
                let loaded = Arc::new(LoadedSkill::from_scan(scan));
                self.skills
                    .write()
                    .expect("skill registry poisoned")
                    .insert(name.to_string(), loaded);

                // Purge handlers bound to commands that no longer exist so
                // the handler table never grows monotonically across
                // reload cycles.
                let prefix = format!("{name}.");
                self.handlers
                    .write()
                    .expect("handler registry poisoned")
                    .retain(|tool, _| !tool.starts_with(&prefix) || new_commands.contains(tool));

                info!(skill = name, "skill reloaded");
                LoadResult {
                    skill_name: name.to_string(),
                    ok: true,
                    error: None,
                    duration_ms: start.elapsed().as_millis() as u64,
                }
            }
            Ok(Err(e)) => {
                warn!(skill = name, kind = e.kind.as_str(), "reload failed, keeping old skill");
                LoadResult {
                    skill_name: name.to_string(),
                    ok: false,
                    error: Some(e),
                    duration_ms: start.elapsed().as_millis() as u64,
                }
            }
            Err(join_err) => LoadResult {
                skill_name: name.to_string(),
                ok: false,
                error: Some(OmniError::new(
                    ErrorKind::SkillLoadFailed,
                    format!("reload task failed: {join_err}"),
                )),
                duration_ms: start.elapsed().as_millis() as u64,
            },
        }
    }

    fn reload_lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.reload_locks.lock().expect("reload lock map poisoned");
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Remove a skill and purge every handler under its namespace.
    pub fn unload(&self, name: &str) {
        self.skills
            .write()
            .expect("skill registry poisoned")
            .remove(name);
        let prefix = format!("{name}.");
        self.handlers
            .write()
            .expect("handler registry poisoned")
            .retain(|tool, _| !tool.starts_with(&prefix));
        self.active
            .write()
            .expect("active set poisoned")
            .remove(name);
        debug!(skill = name, "skill unloaded");
    }

    // ── Registration ────────────────────────────────────────

    /// Register a host-provided command with no backing skill directory.
    pub fn register_synthetic_command(&self, command: Command, core: bool) {
        if core {
            self.core
                .write()
                .expect("core set poisoned")
                .insert(command.tool_name.clone());
        }
        self.synthetic
            .write()
            .expect("synthetic registry poisoned")
            .insert(command.tool_name.clone(), command);
    }

    /// Attach a local handler to a command by tool id.
    pub fn register_handler(&self, tool_name: &str, handler: LocalHandler) {
        self.handlers
            .write()
            .expect("handler registry poisoned")
            .insert(tool_name.to_string(), handler);
    }

    /// Mark an existing command as core (always visible to the LLM).
    pub fn mark_core(&self, tool_name: &str) {
        self.core
            .write()
            .expect("core set poisoned")
            .insert(tool_name.to_string());
    }

    /// Activate a skill: its dynamic commands become visible to the
    /// active-skill context provider (never to the core schema list).
    pub fn activate_skill(&self, name: &str) {
        self.active
            .write()
            .expect("active set poisoned")
            .insert(name.to_string());
    }

    pub fn deactivate_skill(&self, name: &str) {
        self.active
            .write()
            .expect("active set poisoned")
            .remove(name);
    }

    pub fn active_skills(&self) -> Vec<String> {
        let mut v: Vec<String> = self
            .active
            .read()
            .expect("active set poisoned")
            .iter()
            .cloned()
            .collect();
        v.sort();
        v
    }

    // ── Listings ────────────────────────────────────────────

    pub fn list_available_skills(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .skills
            .read()
            .expect("skill registry poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Every command (skill-backed and synthetic), sorted by tool id.
    pub fn list_commands(&self) -> Vec<Command> {
        let mut out: Vec<Command> = Vec::new();
        for skill in self
            .skills
            .read()
            .expect("skill registry poisoned")
            .values()
        {
            out.extend(skill.commands.values().cloned());
        }
        out.extend(
            self.synthetic
                .read()
                .expect("synthetic registry poisoned")
                .values()
                .cloned(),
        );
        out.sort_by(|a, b| a.tool_name.cmp(&b.tool_name));
        out
    }

    /// Command names for one skill.
    pub fn list_commands_for(&self, skill: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .skills
            .read()
            .expect("skill registry poisoned")
            .get(skill)
            .map(|s| s.commands.values().map(|c| c.tool_name.clone()).collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    /// Core commands — always exposed to the LLM.  `skill.discover`
    /// sorts first when present.
    pub fn get_core_commands(&self) -> Vec<Command> {
        let core = self.core.read().expect("core set poisoned");
        let mut out: Vec<Command> = self
            .list_commands()
            .into_iter()
            .filter(|c| core.contains(&c.tool_name))
            .collect();
        out.sort_by(|a, b| {
            let a_discover = a.tool_name == "skill.discover";
            let b_discover = b.tool_name == "skill.discover";
            b_discover
                .cmp(&a_discover)
                .then_with(|| a.tool_name.cmp(&b.tool_name))
        });
        out
    }

    /// Dynamic commands — hidden unless the router activates the skill.
    pub fn get_dynamic_commands(&self) -> Vec<Command> {
        let core = self.core.read().expect("core set poisoned");
        self.list_commands()
            .into_iter()
            .filter(|c| !core.contains(&c.tool_name))
            .collect()
    }

    /// Packed context bundle for a skill (hot-reload-aware).
    pub async fn skill_context(&self, name: &str) -> Option<String> {
        let skill = self.get_skill(name).await?;
        Some(skill.context_bundle().to_string())
    }

    // ── Execution ───────────────────────────────────────────

    /// Execute a command by tool id.
    ///
    /// Local commands dispatch through the handler registry; script
    /// commands run as a bounded subprocess.  The result is stringified;
    /// failures come back as structured errors.
    pub async fn execute_tool(
        &self,
        tool_name: &str,
        args: Value,
        caller: Option<&str>,
    ) -> Result<String, OmniError> {
        debug!(tool = tool_name, caller = caller.unwrap_or("unknown"), "executing tool");

        // Handler registry first: bound local commands and test stubs.
        let handler = self
            .handlers
            .read()
            .expect("handler registry poisoned")
            .get(tool_name)
            .cloned();
        if let Some(handler) = handler {
            return match handler(args).await {
                Ok(value) => Ok(stringify(value)),
                Err(e) => Err(OmniError::new(ErrorKind::ToolExecFailed, e.to_string())),
            };
        }

        let (skill_name, _command_name) = tool_name.split_once('.').ok_or_else(|| {
            OmniError::new(
                ErrorKind::CommandNotFound,
                format!("tool id must be <skill>.<command>: {tool_name}"),
            )
        })?;

        // Synthetic command without a handler.
        if self
            .synthetic
            .read()
            .expect("synthetic registry poisoned")
            .contains_key(tool_name)
        {
            return Err(OmniError::new(
                ErrorKind::ToolExecFailed,
                format!("no handler bound for {tool_name}"),
            ));
        }

        // Freshness-checked skill lookup.
        let skill = self.get_skill(skill_name).await.ok_or_else(|| {
            OmniError::new(ErrorKind::SkillNotFound, format!("no such skill: {skill_name}"))
        })?;
        let command = skill
            .commands
            .values()
            .find(|c| c.tool_name == tool_name)
            .ok_or_else(|| {
                OmniError::new(
                    ErrorKind::CommandNotFound,
                    format!("no such command: {tool_name}"),
                )
            })?;

        match command.execution_mode {
            ExecutionMode::Local => Err(OmniError::new(
                ErrorKind::ToolExecFailed,
                format!("no handler bound for local command {tool_name}"),
            )),
            ExecutionMode::Script => {
                self.run_script(&skill.path.join(&command.file_path), &command.name, args)
                    .await
            }
        }
    }

    async fn run_script(
        &self,
        script: &std::path::Path,
        command: &str,
        args: Value,
    ) -> Result<String, OmniError> {
        let args_json = args.to_string();
        let output = tokio::time::timeout(
            std::time::Duration::from_secs(SCRIPT_TIMEOUT_SECS),
            tokio::process::Command::new("python3")
                .arg(script)
                .arg(command)
                .arg(&args_json)
                .output(),
        )
        .await
        .map_err(|_| {
            OmniError::new(
                ErrorKind::ToolExecFailed,
                format!("script timed out after {SCRIPT_TIMEOUT_SECS}s"),
            )
        })?
        .map_err(|e| OmniError::new(ErrorKind::ToolExecFailed, e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OmniError::new(
                ErrorKind::ToolExecFailed,
                format!(
                    "script exited with {}: {}",
                    output.status.code().unwrap_or(-1),
                    crate::utils::truncate_str(stderr.trim(), 500),
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }

    /// Handler-table size (reload-leak regression checks).
    pub fn handler_count(&self) -> usize {
        self.handlers.read().expect("handler registry poisoned").len()
    }
}

fn stringify(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}
