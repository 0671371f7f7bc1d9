//! Scripted Model Client（用于测试与 --mock 演示，无需 API）
//!
//! 按顺序返回预设回复；脚本用尽后返回 fallback（未设置时返回 InvalidResponse）。
//! 相同脚本多次运行得到相同的回复序列。

use std::collections::VecDeque;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use crate::llm::{ModelCallError, ModelClient, ModelResponse};
use crate::memory::Message;
use crate::tools::{ToolCall, ToolSchema, DONE_TOOL_NAME};

/// 预设回复序列
#[derive(Debug, Default)]
pub struct ScriptedModelClient {
    script: Mutex<VecDeque<Result<ModelResponse, ModelCallError>>>,
    fallback: Option<ModelResponse>,
    calls: Mutex<Vec<usize>>,
}

impl ScriptedModelClient {
    pub fn new(replies: Vec<Result<ModelResponse, ModelCallError>>) -> Self {
        Self {
            script: Mutex::new(replies.into()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// 全部是成功回复的脚本
    pub fn from_responses(responses: Vec<ModelResponse>) -> Self {
        Self::new(responses.into_iter().map(Ok).collect())
    }

    /// 脚本用尽后反复返回该回复
    pub fn with_fallback(mut self, response: ModelResponse) -> Self {
        self.fallback = Some(response);
        self
    }

    /// 演示脚本：列目录后结束任务
    pub fn demo() -> Self {
        Self::from_responses(vec![
            ModelResponse::with_tool_calls(
                "Let me look at the workspace first.",
                vec![ToolCall::new("call_0", "list_dir", json!({"path": "."}))],
            ),
            ModelResponse::with_tool_calls(
                "The workspace is inspected.",
                vec![ToolCall::new("call_1", DONE_TOOL_NAME, json!({}))],
            ),
        ])
    }

    /// 每次 submit 时收到的对话长度
    pub async fn observed_conversation_lengths(&self) -> Vec<usize> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn submit(
        &self,
        conversation: &[Message],
        _tools: &[ToolSchema],
    ) -> Result<ModelResponse, ModelCallError> {
        self.calls.lock().await.push(conversation.len());
        let next = self.script.lock().await.pop_front();
        match next {
            Some(reply) => reply,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| ModelCallError::InvalidResponse {
                    message: "script exhausted".to_string(),
                }),
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}
