//! 沙箱文件系统工具
//!
//! SafeFs 绑定工作区根目录，所有路径必须解析到根下（禁止 ../ 逃逸）；
//! ReadFileTool / ListDirTool 基于 SafeFs 提供 read_file / list_dir 能力。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::ToolExecutionError;
use crate::tools::{optional_str, required_str, Tool, ToolArguments};

/// 沙箱文件系统：绑定根目录，resolve 校验路径在根下
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    /// 解析已存在的路径
    pub fn resolve(&self, path: &str) -> Result<PathBuf, ToolExecutionError> {
        let path = path.trim_start_matches("./");
        let full = self.root_dir.join(path);
        let canonical = full
            .canonicalize()
            .map_err(|_| ToolExecutionError::Failed(format!("Path not found: {}", path)))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(ToolExecutionError::PathEscape(path.to_string())) // 如 ../../etc/passwd
        }
    }

    /// 解析将要写入的路径：文件可以不存在，但最近的已存在祖先必须在根下
    pub fn resolve_for_write(&self, path: &str) -> Result<PathBuf, ToolExecutionError> {
        let relative = Path::new(path.trim_start_matches("./"));
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(ToolExecutionError::PathEscape(path.to_string()));
        }
        let full = self.root_dir.join(relative);

        let mut ancestor = full.as_path();
        while !ancestor.exists() {
            ancestor = match ancestor.parent() {
                Some(parent) => parent,
                None => return Err(ToolExecutionError::PathEscape(path.to_string())),
            };
        }
        let canonical = ancestor
            .canonicalize()
            .map_err(|e| ToolExecutionError::Failed(format!("Resolve failed: {}", e)))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(full)
        } else {
            Err(ToolExecutionError::PathEscape(path.to_string()))
        }
    }

    pub async fn read_file(&self, path: &str) -> Result<String, ToolExecutionError> {
        let resolved = self.resolve(path)?;
        tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| ToolExecutionError::Failed(format!("Read failed: {}", e)))
    }

    pub async fn list_dir(&self, path: &str) -> Result<Vec<String>, ToolExecutionError> {
        let base = if path.is_empty() || path == "." {
            self.root_dir.clone()
        } else {
            self.resolve(path)?
        };
        let mut dir = tokio::fs::read_dir(&base)
            .await
            .map_err(|e| ToolExecutionError::Failed(format!("List failed: {}", e)))?;
        let mut entries = Vec::new();
        while let Some(e) = dir
            .next_entry()
            .await
            .map_err(|e| ToolExecutionError::Failed(e.to_string()))?
        {
            let name = e.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                let ty = match e.file_type().await {
                    Ok(t) if t.is_dir() => "/",
                    _ => "",
                };
                entries.push(format!("{}{}", name, ty));
            }
        }
        entries.sort();
        Ok(entries)
    }
}

/// read_file：读取文件内容，可选按行截取，输出带行号
pub struct ReadFileTool {
    fs: SafeFs,
}

impl ReadFileTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

fn line_arg(args: &ToolArguments, key: &str) -> Option<usize> {
    args.get(key).and_then(|v| v.as_u64()).map(|n| n as usize)
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file in the workspace. Output lines are prefixed with their line numbers."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path relative to the workspace" },
                "start_line": { "type": "integer", "description": "First line to read (1-based)" },
                "end_line": { "type": "integer", "description": "Last line to read (inclusive)" }
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        args: ToolArguments,
        _cancel: CancellationToken,
    ) -> Result<String, ToolExecutionError> {
        let path = required_str(&args, "path")?;
        tracing::info!(path = %path, "read_file tool execute");
        let content = self.fs.read_file(path).await?;

        let start = line_arg(&args, "start_line").unwrap_or(1).max(1);
        let end = line_arg(&args, "end_line").unwrap_or(usize::MAX);
        if end < start {
            return Err(ToolExecutionError::InvalidArguments(format!(
                "end_line {} is before start_line {}",
                end, start
            )));
        }

        let lines: Vec<String> = content
            .lines()
            .enumerate()
            .skip(start - 1)
            .take(end - start + 1)
            .map(|(i, line)| format!("{:>6}\t{}", i + 1, line))
            .collect();
        Ok(lines.join("\n"))
    }
}

/// list_dir：列出目录，子目录以 `/` 结尾，隐藏文件不列出
pub struct ListDirTool {
    fs: SafeFs,
}

impl ListDirTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List a directory in the workspace. Directories end with '/'."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory path, default '.'" }
            },
            "required": []
        })
    }

    async fn execute(
        &self,
        args: ToolArguments,
        _cancel: CancellationToken,
    ) -> Result<String, ToolExecutionError> {
        let path = optional_str(&args, "path").unwrap_or(".");
        tracing::info!(path = %path, "list_dir tool execute");
        let entries = self.fs.list_dir(path).await?;
        Ok(entries.join("\n"))
    }
}
