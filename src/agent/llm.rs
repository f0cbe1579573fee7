//! Anthropic Messages API client.
//!
//! Requests carry the tool definitions; responses come back as content
//! blocks. Unknown block types are skipped on parse so new API block shapes
//! never break the loop.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// Generous cap per model call; the loop's own duration budget is tighter.
const CALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Malformed response: {0}")]
    Data(String),
}

/// One message in the conversation history.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: serde_json::Value,
}

impl ChatMessage {
    pub fn user_text(text: &str) -> Self {
        Self {
            role: "user",
            content: serde_json::Value::String(text.to_string()),
        }
    }

    /// The assistant turn exactly as the API returned it.
    pub fn assistant_blocks(blocks: serde_json::Value) -> Self {
        Self {
            role: "assistant",
            content: blocks,
        }
    }

    /// A user turn carrying tool results back to the model.
    pub fn tool_results(results: Vec<(String, String)>) -> Self {
        let blocks: Vec<serde_json::Value> = results
            .into_iter()
            .map(|(tool_use_id, content)| {
                serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": content,
                })
            })
            .collect();
        Self {
            role: "user",
            content: serde_json::Value::Array(blocks),
        }
    }
}

/// A tool the model may invoke.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: serde_json::Value,
}

/// A tool invocation lifted from a model turn.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// One parsed model turn.
#[derive(Debug, Clone)]
pub struct ModelTurn {
    /// The assistant content exactly as returned, for history append.
    pub raw_content: serde_json::Value,
    pub text: String,
    pub tool_invocations: Vec<ToolInvocation>,
    pub stop_reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    tools: &'a [ToolDefinition],
}

pub struct LlmClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl LlmClient {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(CALL_TIMEOUT)
                .build()
                .unwrap_or_default(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    /// One conversation turn with tools available.
    pub async fn chat(
        &self,
        system: Option<&str>,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        max_tokens: u32,
    ) -> Result<ModelTurn, LlmError> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens,
            system,
            messages,
            tools,
        };

        let resp = self
            .http
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status,
                message: crate::util::truncate(&message, 500),
            });
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| LlmError::Data(format!("messages response: {}", e)))?;
        parse_turn(&body)
    }

    /// Plain text completion without tools, for the weekly digest.
    pub async fn complete(
        &self,
        system: &str,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<String, LlmError> {
        let messages = [ChatMessage::user_text(prompt)];
        let turn = self.chat(Some(system), &messages, &[], max_tokens).await?;
        if turn.text.trim().is_empty() {
            return Err(LlmError::Data("empty completion".to_string()));
        }
        Ok(turn.text)
    }
}

/// Lift text and tool-use blocks out of a raw response body. Unknown block
/// types are ignored.
fn parse_turn(body: &serde_json::Value) -> Result<ModelTurn, LlmError> {
    let content = body["content"]
        .as_array()
        .ok_or_else(|| LlmError::Data("response has no content array".to_string()))?;

    let mut text = String::new();
    let mut tool_invocations = Vec::new();

    for block in content {
        match block["type"].as_str() {
            Some("text") => {
                if let Some(t) = block["text"].as_str() {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(t);
                }
            }
            Some("tool_use") => {
                let id = block["id"].as_str().unwrap_or_default().to_string();
                let name = block["name"].as_str().unwrap_or_default().to_string();
                if name.is_empty() {
                    continue;
                }
                tool_invocations.push(ToolInvocation {
                    id,
                    name,
                    input: block["input"].clone(),
                });
            }
            _ => {}
        }
    }

    Ok(ModelTurn {
        raw_content: body["content"].clone(),
        text,
        tool_invocations,
        stop_reason: body["stop_reason"].as_str().map(|s| s.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_turn_lifts_tool_use() {
        let body = serde_json::json!({
            "content": [
                {"type": "text", "text": "Checking the traffic first."},
                {"type": "tool_use", "id": "tu_1", "name": "get_page_analytics",
                 "input": {"page_path": "/pricing", "days": 14}}
            ],
            "stop_reason": "tool_use"
        });
        let turn = parse_turn(&body).expect("parse");
        assert_eq!(turn.text, "Checking the traffic first.");
        assert_eq!(turn.tool_invocations.len(), 1);
        assert_eq!(turn.tool_invocations[0].name, "get_page_analytics");
        assert_eq!(turn.stop_reason.as_deref(), Some("tool_use"));
    }

    #[test]
    fn test_parse_turn_skips_unknown_blocks() {
        let body = serde_json::json!({
            "content": [
                {"type": "thinking", "thinking": "..."},
                {"type": "text", "text": "ok"}
            ]
        });
        let turn = parse_turn(&body).expect("parse");
        assert_eq!(turn.text, "ok");
        assert!(turn.tool_invocations.is_empty());
    }

    #[test]
    fn test_parse_turn_rejects_missing_content() {
        assert!(parse_turn(&serde_json::json!({"id": "msg_1"})).is_err());
    }

    #[test]
    fn test_tool_result_message_shape() {
        let msg = ChatMessage::tool_results(vec![("tu_1".to_string(), "{\"ok\":true}".to_string())]);
        assert_eq!(msg.role, "user");
        assert_eq!(msg.content[0]["type"], "tool_result");
        assert_eq!(msg.content[0]["tool_use_id"], "tu_1");
    }
}
