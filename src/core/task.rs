//! 任务模型：Task / TaskStatus / TaskConfig / TaskResult
//!
//! 状态只能单向流转：Pending -> Running -> {Completed | Failed | Cancelled | StepBudgetExceeded}，
//! 终态之后不再变化；状态变更只由 TaskController 发起。

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::{RecordingError, TaskError, TaskFailure};
use crate::llm::RetryConfig;

/// 任务 ID
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 等待执行
    Pending,
    /// 正在执行
    Running,
    /// 模型调用了 task_done
    Completed,
    /// Model Client 重试耗尽
    Failed,
    /// 协作式取消（不算失败）
    Cancelled,
    /// 步数预算用尽仍未完成
    StepBudgetExceeded,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::Pending => matches!(next, TaskStatus::Running),
            TaskStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

/// 一个端到端的自然语言任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    /// 附加参数（如 project_path、issue），渲染进首条 user 消息
    #[serde(default)]
    pub arguments: BTreeMap<String, String>,
    pub status: TaskStatus,
    pub max_steps: usize,
}

impl Task {
    pub fn new(description: impl Into<String>, max_steps: usize) -> Self {
        Self {
            id: TaskId::new(),
            description: description.into(),
            arguments: BTreeMap::new(),
            status: TaskStatus::Pending,
            max_steps,
        }
    }

    pub fn with_arguments(mut self, arguments: BTreeMap<String, String>) -> Self {
        self.arguments = arguments;
        self
    }

    /// 状态流转；非法流转返回 InvalidTransition 且状态不变
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition_to(next) {
            return Err(TaskError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

/// 单个任务的运行参数（由 AppConfig 派生，可逐任务覆盖）
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub max_steps: usize,
    /// 每次工具调用的超时
    pub tool_timeout: Duration,
    /// 单步内全部工具调用的硬上限
    pub step_timeout: Duration,
    /// 取消后给在途工具的宽限期
    pub cancel_grace: Duration,
    pub max_concurrent_tools: usize,
    /// 单次模型调用超时
    pub model_timeout: Duration,
    pub retry: RetryConfig,
    /// 显式轨迹文件路径，优先于 trajectory_dir
    pub trajectory_path: Option<PathBuf>,
    /// 轨迹目录，文件名为 `<task_id>.json`
    pub trajectory_dir: Option<PathBuf>,
    /// 每步记录后是否立即落盘
    pub flush_each_step: bool,
    pub arguments: BTreeMap<String, String>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_steps: 20,
            tool_timeout: Duration::from_secs(120),
            step_timeout: Duration::from_secs(600),
            cancel_grace: Duration::from_secs(2),
            max_concurrent_tools: 4,
            model_timeout: Duration::from_secs(120),
            retry: RetryConfig::default(),
            trajectory_path: None,
            trajectory_dir: None,
            flush_each_step: true,
            arguments: BTreeMap::new(),
        }
    }
}

impl TaskConfig {
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_trajectory_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.trajectory_path = Some(path.into());
        self
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    /// 解析该任务的轨迹文件位置；两者都未设置时只保存在内存
    pub fn resolve_trajectory_path(&self, task_id: TaskId) -> Option<PathBuf> {
        self.trajectory_path
            .clone()
            .or_else(|| self.trajectory_dir.as_ref().map(|d| d.join(format!("{task_id}.json"))))
    }
}

/// 返回给调用方的任务结果
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub step_count: usize,
    /// 轨迹文件位置（仅内存记录时为 None）
    pub trajectory_ref: Option<PathBuf>,
    pub error: Option<TaskFailure>,
    /// 轨迹记录过程中的错误，不影响 status
    pub recording_error: Option<RecordingError>,
}
