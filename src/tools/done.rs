//! 保留的终止工具 task_done：模型调用它表示任务完成

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::ToolExecutionError;
use crate::tools::{Tool, ToolArguments};

/// 终止信号工具名
pub const DONE_TOOL_NAME: &str = "task_done";

pub struct TaskDoneTool;

#[async_trait]
impl Tool for TaskDoneTool {
    fn name(&self) -> &str {
        DONE_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Report that the task is complete. Call this only after the work is done and verified."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "summary": {
                    "type": "string",
                    "description": "Optional short summary of what was done"
                }
            },
            "required": []
        })
    }

    async fn execute(
        &self,
        _args: ToolArguments,
        _cancel: CancellationToken,
    ) -> Result<String, ToolExecutionError> {
        Ok("Task marked as done.".to_string())
    }
}
