//! Model Client 抽象
//!
//! 所有后端（OpenAI 兼容 / Scripted Mock）实现 ModelClient::submit：
//! 输入完整对话与可用工具 schema，返回文本、工具调用与 token 用量。
//! 网络/服务端失败统一为 ModelCallError，由 TaskController 依 RetryConfig 退避重试。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::Message;
use crate::tools::{ToolCall, ToolSchema};

/// 单次调用的 token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
}

/// 模型一次回复
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub usage: Usage,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: content.into(),
            tool_calls,
            usage: Usage::default(),
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }
}

/// Model Client 调用失败
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelCallError {
    #[error("Model request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Rate limited")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Provider returned {status}: {message}")]
    Provider { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },
}

impl ModelCallError {
    /// 可重试：超时、网络、限流、5xx
    pub fn is_transient(&self) -> bool {
        match self {
            ModelCallError::Timeout { .. }
            | ModelCallError::Network { .. }
            | ModelCallError::RateLimited { .. } => true,
            ModelCallError::Provider { status, .. } => *status >= 500,
            ModelCallError::InvalidResponse { .. } => false,
        }
    }
}

/// Model Client trait：给定对话与可用工具，回答「下一步做什么」
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn submit(
        &self,
        conversation: &[Message],
        tools: &[ToolSchema],
    ) -> Result<ModelResponse, ModelCallError>;

    /// 模型名（写入日志）
    fn model_name(&self) -> &str {
        "unknown"
    }
}

/// 指数退避重试配置：delay = min(base * 2^(attempt-1), max)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// 含首次调用在内的最大尝试次数
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryConfig {
    /// 第 attempt 次失败之后的等待时间（attempt 从 1 开始）
    pub fn delay_for(&self, attempt: u32, error: &ModelCallError) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let backoff = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        match error {
            ModelCallError::RateLimited {
                retry_after_ms: Some(ms),
            } => backoff.max(Duration::from_millis(*ms)),
            _ => backoff,
        }
    }
}
