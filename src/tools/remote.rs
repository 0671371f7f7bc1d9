//! 远程工具：由配置 [[tools.remote]] 声明，经 stdio JSON 协议适配为普通 Tool
//!
//! 每次调用启动一次外部程序（无 shell），向 stdin 写入 `{"tool": <name>, "arguments": {...}}`，
//! stdout 作为输出，非零退出码视为执行错误。调用被放弃时子进程被杀死。

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::RemoteToolEntry;
use crate::core::ToolExecutionError;
use crate::tools::{Tool, ToolArguments};

pub struct RemoteTool {
    name: String,
    description: String,
    program: String,
    args: Vec<String>,
    parameters: Value,
    workspace: PathBuf,
}

impl RemoteTool {
    pub fn new(entry: &RemoteToolEntry, workspace: &Path) -> Self {
        let workspace_str = workspace.to_string_lossy();
        Self {
            name: entry.name.clone(),
            description: entry.description.clone(),
            program: entry.program.clone(),
            // {{workspace}} 替换为工作区路径
            args: entry
                .args
                .iter()
                .map(|a| a.replace("{{workspace}}", &workspace_str))
                .collect(),
            parameters: entry.parameters.clone().unwrap_or_else(|| {
                serde_json::json!({ "type": "object", "properties": {}, "required": [] })
            }),
            workspace: workspace.to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for RemoteTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.parameters.clone()
    }

    async fn execute(
        &self,
        args: ToolArguments,
        cancel: CancellationToken,
    ) -> Result<String, ToolExecutionError> {
        let request = serde_json::json!({ "tool": self.name, "arguments": args });
        let payload = serde_json::to_vec(&request)
            .map_err(|e| ToolExecutionError::Failed(format!("encode request: {}", e)))?;

        tracing::info!(tool = %self.name, program = %self.program, "remote tool invoke");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolExecutionError::Failed(format!("remote tool spawn failed: {}", e)))?;

        // 写 stdin 与等待退出并行：不读 stdin 的程序会提前关闭管道
        let stdin = child.stdin.take();
        let write_request = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            // stdin 随后被丢弃，外部程序读到 EOF
            match stdin.write_all(&payload).await {
                Err(e) if e.kind() != ErrorKind::BrokenPipe => Err(e),
                _ => Ok(()),
            }
        };

        let (written, output) = tokio::select! {
            pair = async { tokio::join!(write_request, child.wait_with_output()) } => pair,
            _ = cancel.cancelled() => {
                tracing::info!(tool = %self.name, "remote tool abandoned, child killed");
                return Err(ToolExecutionError::Cancelled);
            }
        };
        let output = output
            .map_err(|e| ToolExecutionError::Failed(format!("remote tool wait failed: {}", e)))?;
        if let Err(e) = written {
            if output.status.success() {
                return Err(ToolExecutionError::Failed(format!("write request: {}", e)));
            }
            tracing::debug!(tool = %self.name, error = %e, "request write failed, child exited non-zero");
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(ToolExecutionError::Failed(format!(
                "exit {:?}: stderr {}",
                output.status.code(),
                stderr.trim()
            )));
        }
        Ok(stdout.trim().to_string())
    }
}
