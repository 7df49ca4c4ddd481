//! Agent loop: the CCA (Context → Complete → Act) step machine.
//!
//! Per user task: `start → (context_build → llm_call → dispatch_tools? →
//! observe)* → finish`.  The loop owns the conversation history, enforces
//! the tool-call and consecutive-error budgets, prunes old turns, and
//! hands the finished task to the memory interceptor.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::context::{ContextOrchestrator, ContextState};
use crate::kernel::Kernel;
use crate::memory::interceptor::MemoryInterceptor;
use crate::models::{ChatMessage, FunctionCallItem, ModelProvider, ProviderResponse};

/// Record of a single tool invocation within a task.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolCallRecord {
    pub tool: String,
    pub args_summary: String,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of one task run.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub reply: String,
    pub success: bool,
    pub tool_calls: Vec<ToolCallRecord>,
    pub model_calls: u32,
    /// Set when the error budget aborted the task.
    pub aborted: Option<String>,
}

/// The per-session agent loop.  One session is a single-task executor:
/// no two LLM completions or tool executions overlap within it.
pub struct AgentLoop {
    kernel: Arc<Kernel>,
    orchestrator: ContextOrchestrator,
    provider: Arc<dyn ModelProvider>,
    interceptor: Option<MemoryInterceptor>,
    config: AgentConfig,
    history: Vec<ChatMessage>,
    turn_count: usize,
    cancel: CancellationToken,
}

impl AgentLoop {
    pub fn new(
        kernel: Arc<Kernel>,
        orchestrator: ContextOrchestrator,
        provider: Arc<dyn ModelProvider>,
        config: AgentConfig,
    ) -> Self {
        Self {
            kernel,
            orchestrator,
            provider,
            interceptor: None,
            config,
            history: Vec::new(),
            turn_count: 0,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_interceptor(mut self, interceptor: MemoryInterceptor) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    /// Token callers cancel to stop the loop at its next suspension point.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn turn_count(&self) -> usize {
        self.turn_count
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    // ── Adaptive tool schemas ───────────────────────────────

    /// Tool schema list passed to the LLM.
    ///
    /// Invariants: the set equals core commands (dynamic commands never
    /// appear), `skill.discover` comes first when registered, and the
    /// list is truncated to `max_tool_schemas`.
    pub fn get_adaptive_tool_schemas(&self) -> Vec<serde_json::Value> {
        let mut commands = self.kernel.get_core_commands();
        if self.config.suppress_atomic_tools {
            commands.retain(|c| c.category != "atomic");
        }
        commands.truncate(self.config.max_tool_schemas);
        commands
            .into_iter()
            .map(|c| {
                serde_json::json!({
                    "name": c.tool_name,
                    "description": c.description,
                    "parameters": c.schema,
                })
            })
            .collect()
    }

    // ── Task execution ──────────────────────────────────────

    /// Run one user task to completion.
    pub async fn run_task(&mut self, query: &str) -> anyhow::Result<TaskResult> {
        self.history.push(ChatMessage::new("user", query));

        let mut records: Vec<ToolCallRecord> = Vec::new();
        let mut model_calls: u32 = 0;
        let mut calls_made: usize = 0;
        let mut consecutive_errors: usize = 0;
        let mut last_error: Option<String> = None;

        let result = loop {
            // Cancellation is cooperative: checked once per step, before
            // the next suspension point.
            if self.cancel.is_cancelled() {
                let message = "Task cancelled.".to_string();
                self.history.push(ChatMessage::new("assistant", message.clone()));
                break TaskResult {
                    reply: message.clone(),
                    success: false,
                    tool_calls: records,
                    model_calls,
                    aborted: Some(message),
                };
            }

            // Context build.
            let state = ContextState {
                user_query: query.to_string(),
                active_skill: self.kernel.active_skills().into_iter().next(),
                session_id: None,
            };
            let system_prompt = self.orchestrator.build_context(&state).await;

            let mut messages = Vec::with_capacity(self.history.len() + 1);
            if !system_prompt.is_empty() {
                messages.push(ChatMessage::new("system", system_prompt));
            }
            messages.extend(self.history.iter().cloned());

            let tools = self.get_adaptive_tool_schemas();

            // LLM call.
            let (response, _usage) = self
                .provider
                .send_chat_with_functions(&messages, &tools)
                .await?;
            model_calls += 1;

            let calls: Vec<FunctionCallItem> = match response {
                ProviderResponse::Final(text) => {
                    self.history.push(ChatMessage::new("assistant", text.clone()));
                    break TaskResult {
                        reply: text,
                        success: true,
                        tool_calls: records,
                        model_calls,
                        aborted: None,
                    };
                }
                ProviderResponse::FunctionCall { id, name, arguments } => {
                    vec![FunctionCallItem { id, name, arguments }]
                }
                ProviderResponse::MultiFunctionCall(items) => items,
            };

            if calls_made >= self.config.max_tool_calls {
                let reply = "[tool call limit reached]".to_string();
                self.history.push(ChatMessage::new("assistant", reply.clone()));
                break TaskResult {
                    reply,
                    success: false,
                    tool_calls: records,
                    model_calls,
                    aborted: Some("max_tool_calls exhausted".into()),
                };
            }

            // Echo the assistant's tool-call message.
            let tc_json: Vec<serde_json::Value> = calls
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "id": call_id(c),
                        "type": "function",
                        "function": {"name": c.name, "arguments": c.arguments},
                    })
                })
                .collect();
            self.history.push(ChatMessage {
                role: "assistant".into(),
                content: String::new(),
                tool_calls: Some(tc_json),
                tool_call_id: None,
            });

            // Dispatch.
            let mut abort: Option<String> = None;
            for call in &calls {
                if calls_made >= self.config.max_tool_calls {
                    break;
                }
                let args: serde_json::Value =
                    serde_json::from_str(&call.arguments).unwrap_or(serde_json::json!({}));
                let args_summary = crate::utils::truncate_str(&call.arguments, 200);

                crate::logs::publish_event_json(&serde_json::json!({
                    "type": "tool_start",
                    "tool": call.name,
                }));
                let timer = std::time::Instant::now();
                let outcome = self
                    .kernel
                    .execute_tool(&call.name, args, Some("LLM"))
                    .await;
                let duration_ms = timer.elapsed().as_millis() as u64;

                let (content, success, error) = match outcome {
                    Ok(text) => (text, true, None),
                    Err(e) => {
                        warn!(tool = %call.name, kind = e.kind.as_str(), "tool execution failed");
                        (e.to_json().to_string(), false, Some(e.to_string()))
                    }
                };
                crate::logs::publish_event_json(&serde_json::json!({
                    "type": "tool_end",
                    "tool": call.name,
                    "success": success,
                    "duration_ms": duration_ms,
                }));

                // A cancelled call burns the error budget but not the
                // tool-call budget.
                let cancelled = error
                    .as_deref()
                    .map(|e| e.contains("timed out"))
                    .unwrap_or(false);
                if !cancelled {
                    calls_made += 1;
                }
                if success {
                    consecutive_errors = 0;
                } else {
                    consecutive_errors += 1;
                    last_error = error.clone();
                }

                records.push(ToolCallRecord {
                    tool: call.name.clone(),
                    args_summary,
                    success,
                    duration_ms,
                    error,
                });

                self.history.push(ChatMessage {
                    role: "tool".into(),
                    content,
                    tool_calls: None,
                    tool_call_id: Some(call_id(call)),
                });

                if consecutive_errors >= self.config.max_consecutive_errors {
                    abort = Some(format!(
                        "Task aborted after {consecutive_errors} consecutive tool errors. Last error: {}",
                        last_error.as_deref().unwrap_or("unknown")
                    ));
                    break;
                }
            }

            if let Some(message) = abort {
                self.history.push(ChatMessage::new("assistant", message.clone()));
                break TaskResult {
                    reply: message.clone(),
                    success: false,
                    tool_calls: records,
                    model_calls,
                    aborted: Some(message),
                };
            }
        };

        self.turn_count += 1;
        self.prune_history();

        if let Some(interceptor) = &self.interceptor {
            let tool_ids: Vec<String> = result.tool_calls.iter().map(|r| r.tool.clone()).collect();
            interceptor.after_execution(
                query,
                tool_ids,
                result.success,
                result.aborted.clone(),
                None,
            );
        }
        debug!(
            success = result.success,
            tool_calls = result.tool_calls.len(),
            model_calls = result.model_calls,
            "task finished"
        );
        Ok(result)
    }

    // ── Pruning ─────────────────────────────────────────────

    /// Keep at most `retained_turns` full user/assistant pairs.  Tool
    /// messages older than the retained window are dropped; with
    /// `auto_summarize` on, the dropped span collapses into one summary
    /// turn instead of vanishing.
    fn prune_history(&mut self) {
        let user_indices: Vec<usize> = self
            .history
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == "user")
            .map(|(i, _)| i)
            .collect();
        if user_indices.len() <= self.config.retained_turns {
            return;
        }
        let cut = user_indices[user_indices.len() - self.config.retained_turns];
        let dropped: Vec<ChatMessage> = self.history.drain(..cut).collect();

        if self.config.auto_summarize && !dropped.is_empty() {
            let lines: Vec<String> = dropped
                .iter()
                .filter(|m| m.role == "user" || (m.role == "assistant" && !m.content.is_empty()))
                .map(|m| format!("[{}] {}", m.role, crate::utils::truncate_str(&m.content, 120)))
                .collect();
            self.history.insert(
                0,
                ChatMessage::new(
                    "assistant",
                    format!(
                        "<compacted_history>\n{}\n</compacted_history>",
                        lines.join("\n")
                    ),
                ),
            );
        }
        debug!(dropped = dropped.len(), "history pruned");
    }
}

fn call_id(call: &FunctionCallItem) -> String {
    if call.id.is_empty() {
        format!("call_{}", crate::utils::generate_nonce())
    } else {
        call.id.clone()
    }
}
