//! Cognitive context orchestrator: parallel-fetch, priority-ordered
//! assembly of the LLM prompt under a hard token budget.
//!
//! Each [`ContextProvider`] contributes one slice of the prompt with a
//! priority (0 = highest).  All providers run concurrently against the
//! same starting budget; truncation decisions happen once, in assembly —
//! a slice either fits whole or is skipped with a warning, never cut
//! mid-content.
//!
//! Token counts use real BPE tokenisation via `tiktoken-rs`.

use std::sync::Arc;

use async_trait::async_trait;
use tiktoken_rs::{o200k_base, CoreBPE};
use tracing::{debug, warn};

use crate::kernel::Kernel;
use crate::memory::interceptor::format_memories_for_context;
use crate::memory::MemoryManager;

// ---------------------------------------------------------------------------
// Token estimation
// ---------------------------------------------------------------------------

/// Cached BPE tokenizer — created once, reused on every call.
fn bpe() -> &'static CoreBPE {
    use std::sync::OnceLock;
    static BPE: OnceLock<CoreBPE> = OnceLock::new();
    BPE.get_or_init(|| o200k_base().expect("failed to load o200k_base tokeniser"))
}

/// Accurate token count for a string.
pub fn estimate_tokens(text: &str) -> usize {
    bpe().encode_with_special_tokens(text).len()
}

// ---------------------------------------------------------------------------
// Provider contract
// ---------------------------------------------------------------------------

/// Per-request state passed (read-only) to every provider.
#[derive(Debug, Clone, Default)]
pub struct ContextState {
    pub user_query: String,
    pub active_skill: Option<String>,
    pub session_id: Option<String>,
}

/// One assembled slice.
#[derive(Debug, Clone)]
pub struct ContextResult {
    pub content: String,
    pub token_count: usize,
    pub name: String,
    /// 0 = highest priority, 100 = lowest.
    pub priority: u8,
}

impl ContextResult {
    pub fn new(name: &str, priority: u8, content: String) -> Self {
        Self {
            token_count: estimate_tokens(&content),
            content,
            name: name.to_string(),
            priority,
        }
    }
}

/// A unit contributing one slice of the prompt.
///
/// Providers must be pure with respect to the passed state — the
/// orchestrator runs them concurrently with no shared mutation.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn provide(&self, state: &ContextState, budget: usize) -> Option<ContextResult>;
}

// ---------------------------------------------------------------------------
// Standard providers
// ---------------------------------------------------------------------------

/// Layer 0: the immutable identity.
pub struct SystemPersonaProvider {
    role: String,
}

impl SystemPersonaProvider {
    pub fn new(role: impl Into<String>) -> Self {
        Self { role: role.into() }
    }
}

#[async_trait]
impl ContextProvider for SystemPersonaProvider {
    async fn provide(&self, _state: &ContextState, _budget: usize) -> Option<ContextResult> {
        let content = match self.role.as_str() {
            "architect" => "<role>You are a master software architect.</role>".to_string(),
            "developer" => "<role>You are an expert developer.</role>".to_string(),
            "researcher" => "<role>You are a thorough researcher.</role>".to_string(),
            other => format!("<role>You are {other}.</role>"),
        };
        Some(ContextResult::new("persona", 0, content))
    }
}

/// Layer 0.5: the meta-cognition protocol for the main loop.
pub struct RoutingGuidanceProvider;

#[async_trait]
impl ContextProvider for RoutingGuidanceProvider {
    async fn provide(&self, _state: &ContextState, _budget: usize) -> Option<ContextResult> {
        let content = "<routing_protocol>\n\
            Before acting, decide whether your visible tool set covers the task.\n\
            If it does not, call skill.discover with a goal-oriented query first;\n\
            the router will activate the right skill and expose its commands.\n\
            Prefer specialised commands over shell fallbacks.\n\
            </routing_protocol>"
            .to_string();
        Some(ContextResult::new("routing_guidance", 5, content))
    }
}

/// Layer 1.5: hydrated context of the active skill, if any.
pub struct ActiveSkillProvider {
    kernel: Arc<Kernel>,
}

impl ActiveSkillProvider {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }
}

#[async_trait]
impl ContextProvider for ActiveSkillProvider {
    async fn provide(&self, state: &ContextState, _budget: usize) -> Option<ContextResult> {
        let skill = state.active_skill.as_deref()?;
        let bundle = self.kernel.skill_context(skill).await?;
        let content = format!("<active_protocol>\n{bundle}\n</active_protocol>");
        Some(ContextResult::new("active_skill", 10, content))
    }
}

/// Layer 2: a lightweight index of available skills and their core
/// commands.  Dynamic commands the kernel hides are never re-introduced
/// here.
pub struct AvailableToolsProvider {
    kernel: Arc<Kernel>,
}

impl AvailableToolsProvider {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    const MAX_SKILLS: usize = 15;
    const MAX_TOOLS_PER_SKILL: usize = 5;
}

#[async_trait]
impl ContextProvider for AvailableToolsProvider {
    async fn provide(&self, _state: &ContextState, _budget: usize) -> Option<ContextResult> {
        let core = self.kernel.get_core_commands();
        if core.is_empty() {
            return None;
        }

        // Group core commands by their skill prefix.
        let mut by_skill: std::collections::BTreeMap<&str, Vec<&crate::kernel::Command>> =
            std::collections::BTreeMap::new();
        for command in &core {
            let skill = command
                .tool_name
                .split_once('.')
                .map(|(s, _)| s)
                .unwrap_or("misc");
            by_skill.entry(skill).or_default().push(command);
        }

        let mut lines = vec!["<available_tools>".to_string()];
        for (skill, commands) in by_skill.iter().take(Self::MAX_SKILLS) {
            let description = commands
                .first()
                .map(|c| crate::utils::truncate_str(&c.description, 80))
                .unwrap_or_default();
            let names: Vec<&str> = commands
                .iter()
                .take(Self::MAX_TOOLS_PER_SKILL)
                .map(|c| c.tool_name.as_str())
                .collect();
            lines.push(format!("- {skill}: {description} [{}]", names.join(", ")));
        }
        lines.push("</available_tools>".to_string());
        Some(ContextResult::new("tools", 20, lines.join("\n")))
    }
}

/// Layer 4: top-K recalled experiences relevant to the task.
pub struct EpisodicMemoryProvider {
    memory: Arc<MemoryManager>,
    limit: usize,
}

impl EpisodicMemoryProvider {
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        Self { memory, limit: 3 }
    }
}

#[async_trait]
impl ContextProvider for EpisodicMemoryProvider {
    async fn provide(&self, state: &ContextState, _budget: usize) -> Option<ContextResult> {
        if state.user_query.is_empty() {
            return None;
        }
        let memories = self.memory.recall(&state.user_query, self.limit, None);
        if memories.is_empty() {
            return None;
        }
        let content = format_memories_for_context(&memories);
        Some(ContextResult::new("rag_memory", 40, content))
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// One assembly decision, reported for observability and tests.
#[derive(Debug, Clone)]
pub struct AssemblyEntry {
    pub name: String,
    pub priority: u8,
    pub token_count: usize,
    pub included: bool,
}

/// The cognitive pipeline: parallel fetch, sequential assembly.
pub struct ContextOrchestrator {
    providers: Vec<Arc<dyn ContextProvider>>,
    max_tokens: usize,
    output_reserve: usize,
}

impl ContextOrchestrator {
    pub fn new(providers: Vec<Arc<dyn ContextProvider>>) -> Self {
        Self {
            providers,
            max_tokens: 128_000,
            output_reserve: 4_096,
        }
    }

    pub fn with_budget(mut self, max_tokens: usize, output_reserve: usize) -> Self {
        self.max_tokens = max_tokens;
        self.output_reserve = output_reserve;
        self
    }

    /// Input budget available to providers.
    pub fn input_budget(&self) -> usize {
        self.max_tokens.saturating_sub(self.output_reserve)
    }

    /// Assemble the prompt.
    pub async fn build_context(&self, state: &ContextState) -> String {
        self.build_context_with_report(state).await.0
    }

    /// Assemble the prompt and report per-provider decisions.
    ///
    /// 1. Every provider runs concurrently with the full starting budget.
    /// 2. Results sort by priority ascending (0 first).
    /// 3. A slice is included iff its whole token count still fits;
    ///    otherwise it is skipped with a warning.
    pub async fn build_context_with_report(
        &self,
        state: &ContextState,
    ) -> (String, Vec<AssemblyEntry>) {
        let starting_budget = self.input_budget();

        let mut join_set = tokio::task::JoinSet::new();
        for provider in &self.providers {
            let provider = Arc::clone(provider);
            let state = state.clone();
            join_set.spawn(async move { provider.provide(&state, starting_budget).await });
        }

        let mut results: Vec<ContextResult> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "context provider panicked"),
            }
        }

        results.sort_by_key(|r| r.priority);

        let mut remaining = starting_budget;
        let mut parts: Vec<String> = Vec::new();
        let mut report: Vec<AssemblyEntry> = Vec::new();
        for result in results {
            if result.token_count == 0 {
                continue;
            }
            let fits = result.token_count <= remaining;
            if fits {
                remaining -= result.token_count;
                parts.push(result.content.clone());
            } else {
                warn!(
                    provider = %result.name,
                    required = result.token_count,
                    remaining,
                    "context budget exhausted, skipping provider"
                );
            }
            report.push(AssemblyEntry {
                name: result.name,
                priority: result.priority,
                token_count: result.token_count,
                included: fits,
            });
        }

        debug!(
            included = report.iter().filter(|e| e.included).count(),
            skipped = report.iter().filter(|e| !e.included).count(),
            used_tokens = starting_budget - remaining,
            "context assembled"
        );
        (parts.join("\n\n"), report)
    }
}
