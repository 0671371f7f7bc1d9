//! 运行时装配
//!
//! 从 AppConfig 构建冻结的 ToolRegistry（内置工具 + 远程工具）与 Model Client，
//! 供 `trae` 二进制与嵌入方共用。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::AppConfig;
use crate::core::RegistryError;
use crate::llm::{ModelCallError, ModelClient, OpenAiClient, ScriptedModelClient};
use crate::tools::{
    BashTool, EditFileTool, ListDirTool, ReadFileTool, RemoteTool, ReportLocsTool, ToolRegistry,
};

/// 装配阶段的错误
#[derive(Error, Debug)]
pub enum SetupError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Model client init failed: {0}")]
    Model(#[from] ModelCallError),

    #[error("Unknown LLM provider: {0}")]
    UnknownProvider(String),
}

/// 注册内置工具与 [[tools.remote]] 声明的远程工具，返回只读注册表
pub fn build_registry(cfg: &AppConfig, workspace: &Path) -> Result<ToolRegistry, SetupError> {
    let mut builder = ToolRegistry::builder();
    builder
        .register(ReadFileTool::new(workspace))?
        .register(ListDirTool::new(workspace))?
        .register(EditFileTool::new(workspace))?
        .register(BashTool::new(cfg.tools.shell.allowed_commands.clone(), workspace))?
        .register(ReportLocsTool::new())?;

    for entry in &cfg.tools.remote {
        tracing::info!(tool = %entry.name, program = %entry.program, "registering remote tool");
        builder.register(RemoteTool::new(entry, workspace))?;
    }

    Ok(builder.build())
}

/// 按 [llm].provider 创建 Model Client；force_mock 时使用内置演示脚本
pub fn create_model_client(
    cfg: &AppConfig,
    force_mock: bool,
) -> Result<Arc<dyn ModelClient>, SetupError> {
    let provider = if force_mock {
        "mock"
    } else {
        cfg.llm.provider.as_str()
    };
    match provider {
        "mock" => {
            tracing::info!("using scripted mock model client");
            Ok(Arc::new(ScriptedModelClient::demo()))
        }
        "openai" => {
            let api_key = std::env::var(&cfg.llm.api_key_env).ok();
            if api_key.is_none() {
                tracing::warn!(env = %cfg.llm.api_key_env, "API key env var not set");
            }
            let client = OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                api_key.as_deref(),
                Duration::from_secs(cfg.llm.request_timeout_secs),
            )?;
            tracing::info!(model = %cfg.llm.model, "using OpenAI-compatible model client");
            Ok(Arc::new(client))
        }
        other => Err(SetupError::UnknownProvider(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteToolEntry;
    use crate::tools::DONE_TOOL_NAME;

    #[test]
    fn test_registry_contains_builtin_tools() {
        let dir = tempfile::tempdir().unwrap();
        let registry = build_registry(&AppConfig::default(), dir.path()).unwrap();
        assert_eq!(
            registry.tool_names(),
            vec!["bash", "edit_file", "list_dir", "read_file", "report_locs", DONE_TOOL_NAME]
        );
    }

    #[test]
    fn test_remote_tool_name_clash_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.tools.remote.push(RemoteToolEntry {
            name: "bash".to_string(),
            description: String::new(),
            program: "true".to_string(),
            args: vec![],
            parameters: None,
        });
        let err = build_registry(&cfg, dir.path()).err().unwrap();
        assert!(matches!(err, SetupError::Registry(RegistryError::DuplicateTool(_))));
    }

    #[test]
    fn test_model_client_selection() {
        let mut cfg = AppConfig::default();
        assert!(create_model_client(&cfg, true).is_ok());

        cfg.llm.provider = "nope".to_string();
        assert!(matches!(
            create_model_client(&cfg, false),
            Err(SetupError::UnknownProvider(_))
        ));
    }
}
