//! 错误类型
//!
//! 工具层错误（ToolExecutionError / ToolError）只影响单次调用，记录进步骤后循环继续；
//! ModelCallError 定义在 llm 层，重试耗尽后任务才失败；RecordingError 隔离在 Recorder 内，
//! 随 TaskResult 一并返回，不会中止任务。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::task::TaskStatus;
use crate::llm::ModelCallError;

/// 工具 execute 返回的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolExecutionError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Failed(String),

    #[error("Path escape attempt: {0}")]
    PathEscape(String),

    #[error("Cancelled")]
    Cancelled,
}

/// 记录在 ToolResult.error 中的错误分类（可序列化进轨迹文档）
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolError {
    #[error("Tool execution failed: {message}")]
    Execution { message: String },

    #[error("Tool timed out")]
    Timeout,

    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },

    /// 整个步骤的硬上限已到，调用被放弃
    #[error("Step time limit reached before the tool settled")]
    StepTimeout,
}

impl From<ToolExecutionError> for ToolError {
    fn from(e: ToolExecutionError) -> Self {
        ToolError::Execution {
            message: e.to_string(),
        }
    }
}

/// 轨迹记录失败（不影响任务本身）
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordingError {
    #[error("Trajectory I/O failed: {0}")]
    Io(String),

    #[error("Trajectory serialization failed: {0}")]
    Serialize(String),

    #[error("Step {got} recorded out of order (expected {expected})")]
    OutOfOrder { expected: usize, got: usize },

    #[error("Trajectory already finalized")]
    AlreadyFinalized,
}

impl From<std::io::Error> for RecordingError {
    fn from(e: std::io::Error) -> Self {
        RecordingError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for RecordingError {
    fn from(e: serde_json::Error) -> Self {
        RecordingError::Serialize(e.to_string())
    }
}

/// 任务以非正常方式结束的原因（Cancelled 不属于此类）
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskFailure {
    #[error("Model call failed after retries: {error}")]
    ModelCall { error: ModelCallError },

    #[error("Step budget of {max_steps} exhausted")]
    StepBudgetExceeded { max_steps: usize },
}

/// 宿主层（TaskManager / 状态机）错误
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Task {0} is not pending")]
    TaskNotPending(String),

    #[error("Invalid status transition {from:?} -> {to:?}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
}

/// 工具注册阶段错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Tool already registered: {0}")]
    DuplicateTool(String),

    #[error("Tool name must not be empty")]
    EmptyName,
}
