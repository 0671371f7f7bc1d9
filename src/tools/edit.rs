//! 文件编辑工具 edit_file
//!
//! 两种操作：create 新建文件（已存在则拒绝）；str_replace 把唯一匹配的 old_str 替换为 new_str。
//! old_str 不存在或出现多次都会报错，保证修改位置明确。

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::ToolExecutionError;
use crate::tools::filesystem::SafeFs;
use crate::tools::{optional_str, required_str, Tool, ToolArguments};

const MAX_FILE_SIZE: usize = 10 * 1024 * 1024; // 10MB

pub struct EditFileTool {
    fs: SafeFs,
}

impl EditFileTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }

    async fn create(&self, path: &str, content: &str) -> Result<String, ToolExecutionError> {
        let target = self.fs.resolve_for_write(path)?;
        if target.exists() {
            return Err(ToolExecutionError::Failed(format!(
                "File already exists: {}; use str_replace to modify it",
                path
            )));
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolExecutionError::Failed(format!("Create dir failed: {}", e)))?;
        }
        tokio::fs::write(&target, content)
            .await
            .map_err(|e| ToolExecutionError::Failed(format!("Write failed: {}", e)))?;
        Ok(format!("Created {} ({} bytes)", path, content.len()))
    }

    async fn str_replace(
        &self,
        path: &str,
        old_str: &str,
        new_str: &str,
    ) -> Result<String, ToolExecutionError> {
        if old_str.is_empty() {
            return Err(ToolExecutionError::InvalidArguments(
                "old_str must not be empty".to_string(),
            ));
        }
        let resolved = self.fs.resolve(path)?;
        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| ToolExecutionError::Failed(format!("Read failed: {}", e)))?;
        if content.len() > MAX_FILE_SIZE {
            return Err(ToolExecutionError::Failed(format!(
                "File too large: {} bytes (max: {})",
                content.len(),
                MAX_FILE_SIZE
            )));
        }

        let mut matches = content.match_indices(old_str);
        let pos = match (matches.next(), matches.next()) {
            (Some((pos, _)), None) => pos,
            (None, _) => {
                return Err(ToolExecutionError::Failed(format!(
                    "old_str not found in {}",
                    path
                )))
            }
            (Some(_), Some(_)) => {
                let count = content.matches(old_str).count();
                return Err(ToolExecutionError::Failed(format!(
                    "old_str occurs {} times in {}; include more context to make it unique",
                    count, path
                )));
            }
        };

        let new_content = format!(
            "{}{}{}",
            &content[..pos],
            new_str,
            &content[pos + old_str.len()..]
        );
        tokio::fs::write(&resolved, new_content)
            .await
            .map_err(|e| ToolExecutionError::Failed(format!("Write failed: {}", e)))?;

        let line_number = content[..pos].matches('\n').count() + 1;
        Ok(format!("Edited {} at line {}", path, line_number))
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Create a new file, or replace one unique occurrence of `old_str` with `new_str` in an existing file."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "enum": ["create", "str_replace"] },
                "path": { "type": "string", "description": "File path relative to the workspace" },
                "file_text": { "type": "string", "description": "Content for `create`" },
                "old_str": { "type": "string", "description": "Exact text to replace (must be unique)" },
                "new_str": { "type": "string", "description": "Replacement text" }
            },
            "required": ["command", "path"]
        })
    }

    async fn execute(
        &self,
        args: ToolArguments,
        _cancel: CancellationToken,
    ) -> Result<String, ToolExecutionError> {
        let command = required_str(&args, "command")?;
        let path = required_str(&args, "path")?;
        tracing::info!(command = %command, path = %path, "edit_file tool execute");

        match command {
            "create" => {
                let content = optional_str(&args, "file_text").unwrap_or("");
                self.create(path, content).await
            }
            "str_replace" => {
                let old_str = required_str(&args, "old_str")?;
                let new_str = optional_str(&args, "new_str").unwrap_or("");
                self.str_replace(path, old_str, new_str).await
            }
            other => Err(ToolExecutionError::InvalidArguments(format!(
                "unknown command `{}`",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> ToolArguments {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_str_replace_unique_match() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.rs");
        std::fs::write(&file, "fn main() {\n    println!(\"Hello\");\n}\n").unwrap();
        let tool = EditFileTool::new(dir.path());

        let out = tool
            .execute(
                args(json!({
                    "command": "str_replace",
                    "path": "main.rs",
                    "old_str": "\"Hello\"",
                    "new_str": "\"World\""
                })),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(out.contains("line 2"));
        assert!(std::fs::read_to_string(&file).unwrap().contains("\"World\""));
    }

    #[tokio::test]
    async fn test_str_replace_rejects_ambiguous_match() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x = 1\nx = 1\n").unwrap();
        let tool = EditFileTool::new(dir.path());

        let err = tool
            .execute(
                args(json!({"command": "str_replace", "path": "a.txt", "old_str": "x = 1", "new_str": "x = 2"})),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("2 times"));
    }

    #[tokio::test]
    async fn test_create_new_file_and_refuse_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let tool = EditFileTool::new(dir.path());
        let create = args(json!({"command": "create", "path": "src/lib.rs", "file_text": "pub fn a() {}"}));

        tool.execute(create.clone(), CancellationToken::new()).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src/lib.rs")).unwrap(),
            "pub fn a() {}"
        );
        assert!(tool.execute(create, CancellationToken::new()).await.is_err());
    }
}
