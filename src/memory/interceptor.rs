//! Memory interceptor: recall before a task, reflection + write after.
//!
//! The after-path auto-generates a reflection when none is supplied via
//! a small rule table — successes summarize the tools used, failures
//! match error substrings to a suggestion.  An LLM-backed reflection can
//! be passed in by the caller as an upgrade.

use std::sync::Arc;

use tracing::warn;

use super::{InteractionLog, MemoryManager, Outcome};

/// Per-session interceptor around the [`MemoryManager`].
pub struct MemoryInterceptor {
    manager: Arc<MemoryManager>,
    session_id: Option<String>,
}

impl MemoryInterceptor {
    pub fn new(manager: Arc<MemoryManager>) -> Self {
        Self {
            manager,
            session_id: None,
        }
    }

    pub fn set_session(&mut self, session_id: impl Into<String>) {
        self.session_id = Some(session_id.into());
    }

    /// Recall candidate memories for the upcoming task.  Returned to the
    /// orchestrator's episodic-memory provider; failures degrade to empty.
    pub fn before_execution(&self, query: &str, limit: usize) -> Vec<InteractionLog> {
        self.manager.recall(query, limit, None)
    }

    /// Record the task's outcome, generating a reflection when the caller
    /// didn't supply one.  Returns the record id; a failed write is
    /// logged, never propagated into the finishing task.
    pub fn after_execution(
        &self,
        user_input: &str,
        tool_calls: Vec<String>,
        success: bool,
        error: Option<String>,
        reflection: Option<String>,
    ) -> Option<String> {
        let reflection = reflection.unwrap_or_else(|| {
            generate_reflection(user_input, success, error.as_deref(), &tool_calls)
        });
        let outcome = if success {
            Outcome::Success
        } else {
            Outcome::Failure
        };
        match self.manager.add_experience(
            user_input,
            tool_calls,
            outcome,
            &reflection,
            error,
            self.session_id.clone(),
        ) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(kind = e.kind.as_str(), "failed to record experience");
                None
            }
        }
    }
}

/// Template-based reflection generator.
pub fn generate_reflection(
    user_input: &str,
    success: bool,
    error: Option<&str>,
    tool_calls: &[String],
) -> String {
    if success {
        let tools = if tool_calls.is_empty() {
            "no tools".to_string()
        } else {
            tool_calls.join(", ")
        };
        return format!(
            "Successfully completed: {}. Used tools: {tools}.",
            crate::utils::truncate_str(user_input, 100)
        );
    }
    match error {
        Some(error) => {
            let error_lower = error.to_lowercase();
            let suggestion = if error_lower.contains("lock") {
                "Try removing the lock file before retrying."
            } else if error_lower.contains("permission") {
                "Check file permissions or run with appropriate access."
            } else if error_lower.contains("not found") || error_lower.contains("no such") {
                "Verify the file/path exists before accessing."
            } else if error_lower.contains("timeout") {
                "Consider increasing the timeout or breaking into smaller operations."
            } else {
                "Review the error message for specific guidance."
            };
            format!(
                "Failed: {}. Error: {}. {suggestion}",
                crate::utils::truncate_str(user_input, 80),
                crate::utils::truncate_str(error, 100),
            )
        }
        None => format!(
            "Failed: {}. No specific error message provided.",
            crate::utils::truncate_str(user_input, 100)
        ),
    }
}

/// Render recalled memories as a prompt fragment.
pub fn format_memories_for_context(memories: &[InteractionLog]) -> String {
    if memories.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = memories.iter().map(|m| format!("- {}", m.to_summary())).collect();
    format!(
        "<episodic_memory>\nRelevant past experiences:\n{}\n</episodic_memory>",
        lines.join("\n")
    )
}
