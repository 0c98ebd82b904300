//! Provider for any endpoint speaking the OpenAI `chat/completions` dialect.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::provider::{
    BoxFuture, ChatResponse, CompletionRequest, LlmProvider, Message, MessagePart, Role,
    StopReason, ToolUseRequest, Usage,
};
use crate::retry::send_with_retry;

const MAX_RETRIES: u32 = 3;

#[derive(Clone)]
pub struct CompatibleProvider {
    client: reqwest::Client,
    provider_name: String,
    api_key: String,
    base_url: String,
}

impl fmt::Debug for CompatibleProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompatibleProvider")
            .field("provider_name", &self.provider_name)
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl CompatibleProvider {
    #[must_use]
    pub fn new(
        provider_name: impl Into<String>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            client: crate::http::default_client(),
            provider_name: provider_name.into(),
            api_key: api_key.into(),
            base_url,
        }
    }

    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    async fn send(&self, request: &CompletionRequest) -> Result<ChatResponse, LlmError> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = request.system.as_deref() {
            messages.push(ApiMessage::plain("system", system));
        }
        messages.extend(convert_messages(&request.messages));

        let tools: Vec<ApiTool<'_>> = request
            .tools
            .iter()
            .map(|t| ApiTool {
                r#type: "function",
                function: ApiFunction {
                    name: &t.name,
                    description: &t.description,
                    parameters: &t.parameters,
                },
            })
            .collect();

        let body = ChatRequest {
            model: &request.model,
            messages: &messages,
            max_tokens: request.max_tokens,
            tools: (!tools.is_empty()).then_some(tools.as_slice()),
        };

        let url = format!("{}/chat/completions", self.base_url);
        let response = send_with_retry(&self.provider_name, MAX_RETRIES, || {
            self.client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
        })
        .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            tracing::error!(provider = %self.provider_name, %status, body = %text, "completion request failed");
            return Err(LlmError::Status {
                provider: self.provider_name.clone(),
                status: status.as_u16(),
            });
        }

        let parsed: ApiChatResponse = serde_json::from_str(&text)?;
        into_chat_response(&self.provider_name, parsed)
    }
}

impl LlmProvider for CompatibleProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> BoxFuture<'a, Result<ChatResponse, LlmError>> {
        Box::pin(self.send(request))
    }
}

fn into_chat_response(provider: &str, resp: ApiChatResponse) -> Result<ChatResponse, LlmError> {
    let usage = resp.usage.map(Usage::from).unwrap_or_default();
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::EmptyResponse {
            provider: provider.to_owned(),
        })?;

    let text = choice.message.content.unwrap_or_default();
    let tool_calls: Vec<ToolUseRequest> = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| ToolUseRequest {
            id: tc.id,
            name: tc.function.name,
            input: serde_json::from_str(&tc.function.arguments)
                .unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new())),
        })
        .collect();

    let stop_reason = if !tool_calls.is_empty() {
        StopReason::ToolUse
    } else {
        match choice.finish_reason.as_deref() {
            Some("stop") | None => StopReason::EndTurn,
            Some("length") => StopReason::MaxTokens,
            Some("tool_calls") => StopReason::ToolUse,
            Some(_) => StopReason::Other,
        }
    };

    Ok(ChatResponse {
        text,
        tool_calls,
        stop_reason,
        usage,
    })
}

fn convert_messages(messages: &[Message]) -> Vec<ApiMessage> {
    let mut out = Vec::with_capacity(messages.len());
    for msg in messages {
        let has_tool_parts = msg.parts.iter().any(|p| {
            matches!(
                p,
                MessagePart::ToolUse { .. } | MessagePart::ToolResult { .. }
            )
        });
        if !has_tool_parts {
            out.push(ApiMessage::plain(msg.role.as_str(), &msg.content));
            continue;
        }

        if msg.role == Role::Assistant {
            let tool_calls: Vec<ApiToolCallOut> = msg
                .parts
                .iter()
                .filter_map(|p| match p {
                    MessagePart::ToolUse { id, name, input } => Some(ApiToolCallOut {
                        id: id.clone(),
                        r#type: "function".to_owned(),
                        function: ApiFunctionCall {
                            name: name.clone(),
                            arguments: input.to_string(),
                        },
                    }),
                    _ => None,
                })
                .collect();
            out.push(ApiMessage {
                role: "assistant".to_owned(),
                content: msg.content.clone(),
                tool_calls: Some(tool_calls),
                tool_call_id: None,
            });
        } else {
            for part in &msg.parts {
                match part {
                    MessagePart::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => out.push(ApiMessage {
                        role: "tool".to_owned(),
                        content: content.clone(),
                        tool_calls: None,
                        tool_call_id: Some(tool_use_id.clone()),
                    }),
                    MessagePart::Text { text } if !text.is_empty() => {
                        out.push(ApiMessage::plain("user", text));
                    }
                    _ => {}
                }
            }
        }
    }
    out
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ApiMessage],
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ApiTool<'a>]>,
}

#[derive(Serialize)]
struct ApiTool<'a> {
    r#type: &'a str,
    function: ApiFunction<'a>,
}

#[derive(Serialize)]
struct ApiFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Serialize)]
struct ApiMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCallOut>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ApiMessage {
    fn plain(role: &str, content: &str) -> Self {
        Self {
            role: role.to_owned(),
            content: content.to_owned(),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Serialize)]
struct ApiToolCallOut {
    id: String,
    r#type: String,
    function: ApiFunctionCall,
}

#[derive(Serialize)]
struct ApiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct ApiChatResponse {
    #[serde(default)]
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ApiResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiToolCallFunction,
}

#[derive(Deserialize)]
struct ApiToolCallFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        Self {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            cache_read_tokens: u.prompt_tokens_details.map_or(0, |d| d.cached_tokens),
            cache_write_tokens: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_api_key() {
        let p = CompatibleProvider::new("local", "sk-secret", "http://localhost:1/v1/");
        let debug = format!("{p:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("http://localhost:1/v1\""));
    }

    #[test]
    fn parses_text_response_with_usage() {
        let raw = r#"{
            "choices": [{"message": {"content": "hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3,
                      "prompt_tokens_details": {"cached_tokens": 8}}
        }"#;
        let resp = into_chat_response("p", serde_json::from_str(raw).unwrap()).unwrap();
        assert_eq!(resp.text, "hello");
        assert_eq!(resp.stop_reason, StopReason::EndTurn);
        assert_eq!(resp.usage.input_tokens, 12);
        assert_eq!(resp.usage.cache_read_tokens, 8);
    }

    #[test]
    fn parses_tool_calls() {
        let raw = r#"{
            "choices": [{"message": {"content": null, "tool_calls": [
                {"id": "c1", "type": "function",
                 "function": {"name": "read", "arguments": "{\"path\":\"a.txt\"}"}},
                {"id": "c2", "type": "function",
                 "function": {"name": "list", "arguments": "not json"}}
            ]}, "finish_reason": "tool_calls"}]
        }"#;
        let resp = into_chat_response("p", serde_json::from_str(raw).unwrap()).unwrap();
        assert!(resp.wants_tools());
        assert_eq!(resp.tool_calls[0].input["path"], "a.txt");
        assert!(resp.tool_calls[1].input.as_object().unwrap().is_empty());
    }

    #[test]
    fn length_finish_maps_to_max_tokens() {
        let raw = r#"{"choices": [{"message": {"content": "cut"}, "finish_reason": "length"}]}"#;
        let resp = into_chat_response("p", serde_json::from_str(raw).unwrap()).unwrap();
        assert_eq!(resp.stop_reason, StopReason::MaxTokens);
    }

    #[test]
    fn empty_choices_is_error() {
        let raw = r#"{"choices": []}"#;
        let err = into_chat_response("p", serde_json::from_str(raw).unwrap()).unwrap_err();
        assert!(matches!(err, LlmError::EmptyResponse { .. }));
    }

    #[test]
    fn convert_messages_maps_tool_parts() {
        let mut assistant = Message::assistant("checking");
        assistant.parts.push(MessagePart::ToolUse {
            id: "t1".into(),
            name: "read".into(),
            input: serde_json::json!({"path": "x"}),
        });
        let mut user = Message::user("");
        user.parts.push(MessagePart::ToolResult {
            tool_use_id: "t1".into(),
            content: "data".into(),
            is_error: false,
        });

        let out = convert_messages(&[Message::user("hi"), assistant, user]);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].role, "user");
        assert_eq!(out[1].tool_calls.as_ref().unwrap()[0].function.name, "read");
        assert_eq!(out[2].role, "tool");
        assert_eq!(out[2].tool_call_id.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_errors() {
        let p = CompatibleProvider::new("local", "k", "http://127.0.0.1:1");
        let req = CompletionRequest::new("m", vec![Message::user("hi")]);
        assert!(p.complete(&req).await.is_err());
    }
}
