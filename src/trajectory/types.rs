//! 轨迹文档的数据结构
//!
//! 文档随时可被完整解析：增量落盘时 end_time / metrics 为空，
//! 被取消的任务最后一步可能 complete=false 且缺少末尾的 tool_results。

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{RecordingError, Task, TaskFailure, TaskStatus, ToolError};
use crate::llm::ModelResponse;
use crate::memory::Message;
use crate::tools::{ToolCall, ToolResult};

/// 当前文档格式版本
pub const SCHEMA_VERSION: &str = "1.0.0";

/// 发送给模型的请求快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequestRecord {
    pub messages: Vec<Message>,
    /// 本次请求可用的工具名
    pub tools: Vec<String>,
}

/// 一轮「模型调用 + 工具分发」
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    pub timestamp: DateTime<Utc>,
    pub model_request: ModelRequestRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_response: Option<ModelResponse>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub tool_results: Vec<ToolResult>,
    pub complete: bool,
}

impl Step {
    pub fn begin(index: usize, model_request: ModelRequestRecord) -> Self {
        Self {
            index,
            timestamp: Utc::now(),
            model_request,
            model_response: None,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            complete: false,
        }
    }

    /// 记录模型回复，并从中取出本步的工具调用
    pub fn set_response(&mut self, response: ModelResponse) {
        self.tool_calls = response.tool_calls.clone();
        self.model_response = Some(response);
    }
}

/// 汇总指标
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrajectoryMetrics {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_tokens: u64,
    pub reasoning_tokens: u64,
    pub total_tokens: u64,
    pub duration_ms: u64,
    pub step_count: usize,
    /// 工具名 -> 实际执行次数（按 tool_results 统计，不含未注册的工具名）
    pub tool_invocations: BTreeMap<String, u64>,
}

impl TrajectoryMetrics {
    pub fn from_steps(steps: &[Step], duration_ms: u64) -> Self {
        let mut metrics = TrajectoryMetrics {
            duration_ms,
            step_count: steps.len(),
            ..Self::default()
        };
        for step in steps {
            if let Some(response) = &step.model_response {
                let usage = &response.usage;
                metrics.input_tokens += usage.input_tokens;
                metrics.output_tokens += usage.output_tokens;
                metrics.cache_tokens += usage.cache_tokens.unwrap_or(0);
                metrics.reasoning_tokens += usage.reasoning_tokens.unwrap_or(0);
            }
            let invoked = step
                .tool_results
                .iter()
                .filter(|r| !matches!(r.error, Some(ToolError::UnknownTool { .. })));
            for result in invoked {
                *metrics.tool_invocations.entry(result.name.clone()).or_default() += 1;
            }
        }
        metrics.total_tokens = metrics.input_tokens + metrics.output_tokens;
        metrics
    }
}

/// 持久化的轨迹文档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryDocument {
    pub schema_version: String,
    pub task: Task,
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<TrajectoryMetrics>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl TrajectoryDocument {
    pub fn is_finalized(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn status(&self) -> TaskStatus {
        self.task.status
    }

    pub fn from_json(data: &str) -> Result<Self, RecordingError> {
        Ok(serde_json::from_str(data)?)
    }

    /// 从磁盘加载轨迹文档
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RecordingError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }
}
