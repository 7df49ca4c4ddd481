//! Agent-loop acceptance: adaptive schemas and budgets.

use std::sync::Arc;

use omni_kernel::agent::AgentLoop;
use omni_kernel::config::AgentConfig;
use omni_kernel::context::ContextOrchestrator;
use omni_kernel::kernel::{Command, Kernel};
use omni_kernel::models::{ProviderResponse, ScriptedProvider};
use omni_kernel::skills::ExecutionMode;

fn kernel_stub() -> Arc<Kernel> {
    let kernel = Arc::new(Kernel::new("/nonexistent", 1));
    for (tool, core) in [
        ("skill.discover", true),
        ("filesystem.read_files", false),
        ("terminal.run_command", false),
        ("filesystem.save_file", true),
    ] {
        kernel.register_synthetic_command(
            Command {
                name: tool.split('.').nth(1).unwrap().into(),
                tool_name: tool.into(),
                description: format!("{tool} stub"),
                category: "general".into(),
                schema: serde_json::json!({"type": "object", "properties": {}}),
                execution_mode: ExecutionMode::Local,
                file_path: String::new(),
            },
            core,
        );
    }
    kernel
}

fn agent(kernel: Arc<Kernel>, responses: Vec<ProviderResponse>, config: AgentConfig) -> AgentLoop {
    AgentLoop::new(
        kernel,
        ContextOrchestrator::new(vec![]),
        Arc::new(ScriptedProvider::new(responses)),
        config,
    )
}

/// Scenario: commands `{skill.discover, filesystem.read_files,
/// terminal.run_command, filesystem.save_file}`, core `{skill.discover,
/// filesystem.save_file}` — the adaptive schema list is exactly the core
/// set, discover first, no dynamic command.
#[test]
fn adaptive_tool_schemas_filter_dynamic_commands() {
    let agent = agent(kernel_stub(), vec![], AgentConfig::default());
    let schemas = agent.get_adaptive_tool_schemas();
    let names: Vec<&str> = schemas
        .iter()
        .map(|s| s["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["skill.discover", "filesystem.save_file"]);
}

#[tokio::test]
async fn zero_tool_calls_returns_first_assistant_text() {
    let config = AgentConfig {
        max_tool_calls: 0,
        ..Default::default()
    };
    let mut agent = agent(
        kernel_stub(),
        vec![ProviderResponse::Final("direct".into())],
        config,
    );
    let result = agent.run_task("just answer").await.unwrap();
    assert!(result.success);
    assert_eq!(result.reply, "direct");
    assert!(result.tool_calls.is_empty());
}

#[tokio::test]
async fn error_budget_aborts_with_visible_summary() {
    let kernel = kernel_stub();
    kernel.register_handler(
        "skill.discover",
        Arc::new(|_| Box::pin(async { anyhow::bail!("index corrupted") })),
    );
    let call = || ProviderResponse::FunctionCall {
        id: String::new(),
        name: "skill.discover".into(),
        arguments: "{}".into(),
    };
    let mut agent = agent(kernel, vec![call(), call(), call()], AgentConfig::default());
    let result = agent.run_task("discover").await.unwrap();
    assert!(!result.success);
    let message = result.aborted.unwrap();
    assert!(message.contains("consecutive tool errors"));
    assert!(message.contains("index corrupted"));
}

#[tokio::test]
async fn tool_dispatch_emits_telemetry_events() {
    let logs_tx = omni_kernel::logs::init_broadcast();
    let mut rx = logs_tx.subscribe();

    let kernel = kernel_stub();
    kernel.register_handler(
        "skill.discover",
        Arc::new(|_| Box::pin(async { Ok(serde_json::json!({"skills": []})) })),
    );
    let mut agent = agent(
        kernel,
        vec![
            ProviderResponse::FunctionCall {
                id: "c1".into(),
                name: "skill.discover".into(),
                arguments: "{}".into(),
            },
            ProviderResponse::Final("done".into()),
        ],
        AgentConfig::default(),
    );
    agent.run_task("discover").await.unwrap();

    // The stream is shared process-wide; scan for this task's events.
    let mut saw_start = false;
    let mut saw_end = false;
    while let Ok(line) = rx.try_recv() {
        let event: serde_json::Value = serde_json::from_str(&line).unwrap();
        if event["tool"] == "skill.discover" {
            match event["event"].as_str() {
                Some("tool_start") => saw_start = true,
                // Other tests share the process-wide stream; only a
                // successful end is unambiguously ours.
                Some("tool_end") if event["fields"]["success"] == true => saw_end = true,
                _ => {}
            }
        }
    }
    assert!(saw_start && saw_end, "expected tool_start and tool_end events");
}

#[tokio::test]
async fn tool_results_feed_back_into_next_completion() {
    let kernel = kernel_stub();
    kernel.register_handler(
        "skill.discover",
        Arc::new(|_| Box::pin(async { Ok(serde_json::json!({"skills": ["git"]})) })),
    );
    let provider = ScriptedProvider::new(vec![
        ProviderResponse::FunctionCall {
            id: "c1".into(),
            name: "skill.discover".into(),
            arguments: "{}".into(),
        },
        ProviderResponse::Final("done".into()),
    ]);
    let provider = Arc::new(provider);
    let mut agent = AgentLoop::new(
        kernel,
        ContextOrchestrator::new(vec![]),
        Arc::clone(&provider) as Arc<dyn omni_kernel::models::ModelProvider>,
        AgentConfig::default(),
    );
    let result = agent.run_task("find skills").await.unwrap();
    assert_eq!(result.reply, "done");

    // Second completion saw the tool result message.
    let calls = provider.calls.lock().unwrap();
    let second_call = &calls[1];
    assert!(second_call
        .iter()
        .any(|m| m.role == "tool" && m.content.contains("git")));
}
