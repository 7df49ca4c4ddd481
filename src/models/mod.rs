//! Model provider boundary.
//!
//! The kernel treats the LLM as an opaque chat-completion endpoint with
//! tool calling.  [`ModelProvider`] is the seam: the production
//! implementation is an OpenAI-compatible HTTP client; the acceptance
//! harness swaps in [`ScriptedProvider`] with canned responses.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

// ---------------------------------------------------------------------------
// ChatMessage – shared message representation
// ---------------------------------------------------------------------------

/// A single chat message with a role and content.
///
/// Optionally carries tool-calling metadata so `tool` role messages and
/// assistant `tool_calls` responses serialise correctly for the API.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    /// For assistant messages that invoke tools: the raw `tool_calls` array.
    pub tool_calls: Option<Vec<serde_json::Value>>,
    /// For `role: "tool"` messages: the id of the corresponding call.
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// Convenience constructor for a plain message (no tool metadata).
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// Serialise messages into the OpenAI-compatible JSON array format.
pub fn serialize_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|m| {
            let mut msg = serde_json::json!({ "role": m.role });
            if let Some(ref tcs) = m.tool_calls {
                msg["tool_calls"] = serde_json::json!(tcs);
                if m.content.is_empty() {
                    msg["content"] = serde_json::Value::Null;
                } else {
                    msg["content"] = serde_json::json!(m.content);
                }
            } else {
                msg["content"] = serde_json::json!(m.content);
            }
            if let Some(ref tcid) = m.tool_call_id {
                msg["tool_call_id"] = serde_json::json!(tcid);
            }
            msg
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Token usage statistics for one completion.
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// One function/tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct FunctionCallItem {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// What the model produced.
#[derive(Debug, Clone)]
pub enum ProviderResponse {
    /// Final assistant text; the loop ends here.
    Final(String),
    /// A single tool call.
    FunctionCall {
        id: String,
        name: String,
        arguments: String,
    },
    /// Several tool calls in one response.
    MultiFunctionCall(Vec<FunctionCallItem>),
}

/// Extract token usage from an OpenAI-style response JSON.
pub fn parse_token_usage(json: &serde_json::Value) -> Option<TokenUsage> {
    let usage = json.get("usage")?;
    Some(TokenUsage {
        prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
        completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
        total_tokens: usage["total_tokens"].as_u64().unwrap_or(0),
    })
}

/// Parse `tool_calls` from an OpenAI-style chat completion response.
pub fn parse_tool_calls(json: &serde_json::Value) -> Option<ProviderResponse> {
    let message = json.get("choices")?.get(0)?.get("message")?;
    let tool_calls = message.get("tool_calls")?.as_array()?;
    let items: Vec<FunctionCallItem> = tool_calls
        .iter()
        .filter_map(|tc| {
            let func = tc.get("function")?;
            Some(FunctionCallItem {
                id: tc.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                name: func.get("name")?.as_str()?.to_string(),
                arguments: func
                    .get("arguments")
                    .and_then(|v| v.as_str())
                    .unwrap_or("{}")
                    .to_string(),
            })
        })
        .collect();
    match items.len() {
        0 => None,
        1 => {
            let item = items.into_iter().next().unwrap();
            Some(ProviderResponse::FunctionCall {
                id: item.id,
                name: item.name,
                arguments: item.arguments,
            })
        }
        _ => Some(ProviderResponse::MultiFunctionCall(items)),
    }
}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// Trait implemented by every LLM backend.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Send chat messages and return the assistant's reply text.
    async fn send_chat(&self, messages: &[ChatMessage]) -> anyhow::Result<String>;

    /// Send chat messages with tool definitions attached.
    async fn send_chat_with_functions(
        &self,
        messages: &[ChatMessage],
        functions: &[serde_json::Value],
    ) -> anyhow::Result<(ProviderResponse, Option<TokenUsage>)>;

    /// Generate embedding vectors; `None` when unsupported.
    async fn embed(&self, _texts: &[&str]) -> anyhow::Result<Option<Vec<Vec<f32>>>> {
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible HTTP provider
// ---------------------------------------------------------------------------

/// Generic OpenAI-compatible chat-completions client.
pub struct OpenAICompatProvider {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAICompatProvider {
    /// Default request deadline for a completion.
    pub const TIMEOUT: Duration = Duration::from_secs(120);

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client: reqwest::Client::builder()
                .timeout(Self::TIMEOUT)
                .build()
                .expect("reqwest client"),
        }
    }

    async fn completion(&self, body: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let json: serde_json::Value = response.json().await?;
        if !status.is_success() {
            anyhow::bail!(
                "chat completion failed ({status}): {}",
                json["error"]["message"].as_str().unwrap_or("unknown")
            );
        }
        Ok(json)
    }
}

#[async_trait]
impl ModelProvider for OpenAICompatProvider {
    async fn send_chat(&self, messages: &[ChatMessage]) -> anyhow::Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": serialize_messages(messages),
        });
        let json = self.completion(body).await?;
        Ok(json["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    async fn send_chat_with_functions(
        &self,
        messages: &[ChatMessage],
        functions: &[serde_json::Value],
    ) -> anyhow::Result<(ProviderResponse, Option<TokenUsage>)> {
        let tools: Vec<serde_json::Value> = functions
            .iter()
            .map(|f| serde_json::json!({ "type": "function", "function": f }))
            .collect();
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": serialize_messages(messages),
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::json!(tools);
        }
        let json = self.completion(body).await?;
        let usage = parse_token_usage(&json);
        if let Some(response) = parse_tool_calls(&json) {
            return Ok((response, usage));
        }
        let text = json["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        Ok((ProviderResponse::Final(text), usage))
    }
}

// ---------------------------------------------------------------------------
// Scripted provider (tests / acceptance harness)
// ---------------------------------------------------------------------------

/// Deterministic provider that replays a queue of canned responses.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<ProviderResponse>>,
    /// Messages captured from each call, for assertions.
    pub calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn next(&self, messages: &[ChatMessage]) -> ProviderResponse {
        self.calls
            .lock()
            .expect("scripted provider poisoned")
            .push(messages.to_vec());
        self.responses
            .lock()
            .expect("scripted provider poisoned")
            .pop_front()
            .unwrap_or_else(|| ProviderResponse::Final("(scripted provider exhausted)".into()))
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn send_chat(&self, messages: &[ChatMessage]) -> anyhow::Result<String> {
        match self.next(messages) {
            ProviderResponse::Final(text) => Ok(text),
            _ => Ok(String::new()),
        }
    }

    async fn send_chat_with_functions(
        &self,
        messages: &[ChatMessage],
        _functions: &[serde_json::Value],
    ) -> anyhow::Result<(ProviderResponse, Option<TokenUsage>)> {
        Ok((self.next(messages), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_plain_and_tool_messages() {
        let messages = vec![
            ChatMessage::new("system", "you are a bot"),
            ChatMessage {
                role: "assistant".into(),
                content: String::new(),
                tool_calls: Some(vec![serde_json::json!({"id": "c1"})]),
                tool_call_id: None,
            },
            ChatMessage {
                role: "tool".into(),
                content: "result".into(),
                tool_calls: None,
                tool_call_id: Some("c1".into()),
            },
        ];
        let out = serialize_messages(&messages);
        assert_eq!(out[0]["content"], "you are a bot");
        assert!(out[1]["content"].is_null());
        assert_eq!(out[2]["tool_call_id"], "c1");
    }

    #[test]
    fn parse_single_and_multi_tool_calls() {
        let single = serde_json::json!({
            "choices": [{"message": {"tool_calls": [
                {"id": "a", "function": {"name": "git.status", "arguments": "{}"}}
            ]}}]
        });
        match parse_tool_calls(&single) {
            Some(ProviderResponse::FunctionCall { name, .. }) => assert_eq!(name, "git.status"),
            other => panic!("unexpected: {other:?}"),
        }

        let multi = serde_json::json!({
            "choices": [{"message": {"tool_calls": [
                {"id": "a", "function": {"name": "x.a", "arguments": "{}"}},
                {"id": "b", "function": {"name": "x.b", "arguments": "{}"}}
            ]}}]
        });
        match parse_tool_calls(&multi) {
            Some(ProviderResponse::MultiFunctionCall(items)) => assert_eq!(items.len(), 2),
            other => panic!("unexpected: {other:?}"),
        }

        let none = serde_json::json!({"choices": [{"message": {"content": "hi"}}]});
        assert!(parse_tool_calls(&none).is_none());
    }

    #[test]
    fn parse_usage() {
        let json = serde_json::json!({
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        });
        let usage = parse_token_usage(&json).unwrap();
        assert_eq!(usage.total_tokens, 15);
    }

    #[tokio::test]
    async fn scripted_provider_replays_in_order() {
        let provider = ScriptedProvider::new(vec![
            ProviderResponse::FunctionCall {
                id: "1".into(),
                name: "git.status".into(),
                arguments: "{}".into(),
            },
            ProviderResponse::Final("done".into()),
        ]);
        let (first, _) = provider
            .send_chat_with_functions(&[ChatMessage::new("user", "hi")], &[])
            .await
            .unwrap();
        assert!(matches!(first, ProviderResponse::FunctionCall { .. }));
        let (second, _) = provider.send_chat_with_functions(&[], &[]).await.unwrap();
        match second {
            ProviderResponse::Final(text) => assert_eq!(text, "done"),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(provider.calls.lock().unwrap().len(), 2);
    }
}
