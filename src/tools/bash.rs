//! bash 工具：白名单命令，禁止危险操作
//!
//! 命令按 `&&`、`||`、`;`、`|` 与换行拆段，每段首词都必须在配置的白名单中；
//! 命令替换（反引号、`$(...)`）与进程替换一律拒绝，含 rm -rf、wget、chmod 777 等子串的命令同样拒绝。
//! 在工作区目录下通过 sh -c 执行；调用被取消或超时放弃时子进程随之被杀死。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::core::ToolExecutionError;
use crate::tools::{required_str, Tool, ToolArguments};

/// 禁止的子串（即使命令名在白名单中）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:", // fork bomb
];

/// 会在白名单之外执行命令的 shell 语法
const SUBSTITUTION_SYNTAX: &[&str] = &["`", "$(", "<(", ">("];

const MAX_OUTPUT_CHARS: usize = 30_000;

pub struct BashTool {
    allowed_commands: HashSet<String>,
    workspace: PathBuf,
}

impl BashTool {
    pub fn new(allowed_commands: Vec<String>, workspace: impl AsRef<Path>) -> Self {
        let allowed_commands = allowed_commands
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        Self {
            allowed_commands,
            workspace: workspace.as_ref().to_path_buf(),
        }
    }

    fn check_allowed(&self, raw: &str) -> Result<(), ToolExecutionError> {
        let raw_lower = raw.to_lowercase();
        for forbidden in FORBIDDEN_SUBSTR {
            if raw_lower.contains(forbidden) {
                return Err(ToolExecutionError::Failed(format!(
                    "Forbidden pattern: {}",
                    forbidden
                )));
            }
        }

        for syntax in SUBSTITUTION_SYNTAX {
            if raw_lower.contains(syntax) {
                return Err(ToolExecutionError::Failed(format!(
                    "Command substitution not allowed: {}",
                    syntax
                )));
            }
        }

        let segments: Vec<&str> = raw_lower
            .split(|c: char| matches!(c, ';' | '|' | '&' | '\n' | '\r'))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if segments.is_empty() {
            return Err(ToolExecutionError::InvalidArguments("Empty command".to_string()));
        }
        for segment in segments {
            let name = segment.split_whitespace().next().unwrap_or("");
            if !self.allowed_commands.contains(name) {
                return Err(ToolExecutionError::Failed(format!(
                    "Command '{}' not in allowlist",
                    name
                )));
            }
        }
        Ok(())
    }
}

fn truncate(mut text: String) -> String {
    if text.chars().count() > MAX_OUTPUT_CHARS {
        text = text.chars().take(MAX_OUTPUT_CHARS).collect();
        text.push_str("\n[output truncated]");
    }
    text
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Run an allowlisted shell command in the workspace directory and return stdout/stderr."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute (every command name must be allowlisted)"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(
        &self,
        args: ToolArguments,
        cancel: CancellationToken,
    ) -> Result<String, ToolExecutionError> {
        let command = required_str(&args, "command")?.trim();
        self.check_allowed(command)?;

        tracing::info!(command = %command, "bash tool execute");

        let child = Command::new("sh")
            .args(["-c", command])
            .current_dir(&self.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolExecutionError::Failed(format!("Execution failed: {}", e)))?;

        let output = tokio::select! {
            output = child.wait_with_output() => {
                output.map_err(|e| ToolExecutionError::Failed(format!("Execution failed: {}", e)))?
            }
            _ = cancel.cancelled() => {
                tracing::info!(command = %command, "bash command abandoned, child killed");
                return Err(ToolExecutionError::Cancelled);
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            return Err(ToolExecutionError::Failed(truncate(format!(
                "Exit {:?}\nstdout: {}\nstderr: {}",
                output.status.code(),
                stdout.trim(),
                stderr.trim()
            ))));
        }
        Ok(truncate(if stderr.is_empty() {
            stdout
        } else {
            format!("{}\nstderr: {}", stdout.trim(), stderr.trim())
        }))
    }
}
