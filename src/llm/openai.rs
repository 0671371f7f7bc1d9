//! OpenAI 兼容 Chat Completions 客户端
//!
//! 通过 reqwest 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 function tools，
//! 将 tool_calls 与 usage（含 cached / reasoning tokens）解析为 ModelResponse。

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::llm::{ModelCallError, ModelClient, ModelResponse, Usage};
use crate::memory::{Message, Role};
use crate::tools::{ToolCall, ToolSchema};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI 兼容客户端：持有 HTTP client、端点与 model 名
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    request_timeout: Duration,
}

impl OpenAiClient {
    pub fn new(
        base_url: Option<&str>,
        model: &str,
        api_key: Option<&str>,
        request_timeout: Duration,
    ) -> Result<Self, ModelCallError> {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ModelCallError::Network {
                message: e.to_string(),
            })?;
        Ok(Self {
            http,
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model: model.to_string(),
            api_key,
            request_timeout,
        })
    }

    fn to_openai_messages(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|m| match m.role {
                Role::System => json!({"role": "system", "content": m.content}),
                Role::User => json!({"role": "user", "content": m.content}),
                Role::Assistant if m.tool_calls.is_empty() => {
                    json!({"role": "assistant", "content": m.content})
                }
                Role::Assistant => json!({
                    "role": "assistant",
                    "content": m.content,
                    "tool_calls": m.tool_calls.iter().map(|c| json!({
                        "id": c.id,
                        "type": "function",
                        "function": {
                            "name": c.name,
                            "arguments": Value::Object(c.arguments.clone()).to_string(),
                        }
                    })).collect::<Vec<_>>(),
                }),
                Role::Tool => json!({
                    "role": "tool",
                    "tool_call_id": m.tool_call_id,
                    "content": m.content,
                }),
            })
            .collect()
    }

    fn to_openai_tools(tools: &[ToolSchema]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect()
    }

    fn map_transport_error(&self, e: reqwest::Error) -> ModelCallError {
        if e.is_timeout() {
            ModelCallError::Timeout {
                timeout_ms: self.request_timeout.as_millis() as u64,
            }
        } else {
            ModelCallError::Network {
                message: e.to_string(),
            }
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    prompt_tokens_details: Option<PromptDetails>,
    completion_tokens_details: Option<CompletionDetails>,
}

#[derive(Deserialize)]
struct PromptDetails {
    cached_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct CompletionDetails {
    reasoning_tokens: Option<u64>,
}

fn parse_response(body: ChatResponse) -> Result<ModelResponse, ModelCallError> {
    let choice = body
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ModelCallError::InvalidResponse {
            message: "no choices in response".to_string(),
        })?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|c| {
            // 参数非法 JSON 时按空参数处理，交由工具自身报参数错误
            let args: Value = if c.function.arguments.trim().is_empty() {
                Value::Null
            } else {
                serde_json::from_str(&c.function.arguments).unwrap_or_else(|e| {
                    tracing::warn!(tool = %c.function.name, error = %e, "tool arguments are not valid JSON");
                    Value::Null
                })
            };
            ToolCall::new(c.id, c.function.name, args)
        })
        .collect();

    let usage = body
        .usage
        .map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            cache_tokens: u.prompt_tokens_details.and_then(|d| d.cached_tokens),
            reasoning_tokens: u.completion_tokens_details.and_then(|d| d.reasoning_tokens),
        })
        .unwrap_or_default();

    Ok(ModelResponse {
        content: choice.message.content.unwrap_or_default(),
        tool_calls,
        usage,
    })
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn submit(
        &self,
        conversation: &[Message],
        tools: &[ToolSchema],
    ) -> Result<ModelResponse, ModelCallError> {
        let mut request = json!({
            "model": self.model,
            "messages": Self::to_openai_messages(conversation),
        });
        if !tools.is_empty() {
            request["tools"] = Value::Array(Self::to_openai_tools(tools));
        }

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_ms = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000);
            return Err(ModelCallError::RateLimited { retry_after_ms });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ModelCallError::Provider {
                status: status.as_u16(),
                message,
            });
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| ModelCallError::InvalidResponse {
                message: e.to_string(),
            })?;
        parse_response(body)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response_with_tool_calls_and_usage() {
        let body: ChatResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "read_file", "arguments": "{\"path\":\"src/lib.rs\"}"}
                    }]
                }
            }],
            "usage": {
                "prompt_tokens": 120,
                "completion_tokens": 30,
                "prompt_tokens_details": {"cached_tokens": 100},
                "completion_tokens_details": {"reasoning_tokens": 12}
            }
        }))
        .unwrap();

        let response = parse_response(body).unwrap();
        assert_eq!(response.content, "");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "read_file");
        assert_eq!(
            response.tool_calls[0].arguments.get("path"),
            Some(&json!("src/lib.rs"))
        );
        assert_eq!(response.usage.input_tokens, 120);
        assert_eq!(response.usage.cache_tokens, Some(100));
        assert_eq!(response.usage.reasoning_tokens, Some(12));
    }

    #[test]
    fn test_parse_response_without_choices_is_invalid() {
        let body: ChatResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert!(matches!(
            parse_response(body),
            Err(ModelCallError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn test_assistant_tool_calls_are_serialized_as_functions() {
        let call = ToolCall::new("c1", "bash", json!({"command": "ls"}));
        let messages = vec![
            Message::assistant("", vec![call.clone()]),
            Message::tool_result(&crate::tools::ToolResult::success(&call, "a\nb", 1)),
        ];
        let wire = OpenAiClient::to_openai_messages(&messages);
        assert_eq!(wire[0]["tool_calls"][0]["function"]["name"], "bash");
        assert_eq!(wire[1]["role"], "tool");
        assert_eq!(wire[1]["tool_call_id"], "c1");
    }
}
