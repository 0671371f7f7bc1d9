//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TRAE__*` 覆盖（双下划线表示嵌套，如 `TRAE__LLM__PROVIDER=mock`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::core::TaskConfig;
use crate::llm::RetryConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub task: TaskSection,
    pub tools: ToolsSection,
    pub llm: LlmSection,
    pub trajectory: TrajectorySection,
}

/// [task] 段
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSection {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

impl Default for TaskSection {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
        }
    }
}

fn default_max_steps() -> usize {
    20
}

/// [tools] 段：超时、并发、工作区根、Shell 白名单、远程工具
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_tools")]
    pub max_concurrent_tools: usize,
    /// 单步全部工具调用的硬上限（秒）
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    /// 取消后在途工具的宽限期（毫秒）
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    /// 工具沙箱根目录，未设置时用当前目录
    pub workspace_root: Option<PathBuf>,
    #[serde(default)]
    pub shell: ShellSection,
    #[serde(default)]
    pub remote: Vec<RemoteToolEntry>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            max_concurrent_tools: default_max_concurrent_tools(),
            step_timeout_secs: default_step_timeout_secs(),
            cancel_grace_ms: default_cancel_grace_ms(),
            workspace_root: None,
            shell: ShellSection::default(),
            remote: Vec::new(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    120
}

fn default_max_concurrent_tools() -> usize {
    4
}

fn default_step_timeout_secs() -> u64 {
    600
}

fn default_cancel_grace_ms() -> u64 {
    2000
}

/// [tools.shell] 段：允许执行的命令名（每段首词，如 ls、grep、cargo）
#[derive(Debug, Clone, Deserialize)]
pub struct ShellSection {
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: default_allowed_commands(),
        }
    }
}

fn default_allowed_commands() -> Vec<String> {
    vec![
        "ls".into(),
        "grep".into(),
        "cat".into(),
        "head".into(),
        "tail".into(),
        "wc".into(),
        "find".into(),
        "git".into(),
        "cargo".into(),
        "rustc".into(),
        "python".into(),
        "python3".into(),
        "pytest".into(),
    ]
}

/// [[tools.remote]] 条目：由外部程序提供的工具
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteToolEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub program: String,
    /// 程序参数，{{workspace}} 会被替换为工作区路径
    #[serde(default)]
    pub args: Vec<String>,
    /// 参数 JSON Schema；缺省为无参数对象
    #[serde(default)]
    pub parameters: Option<Value>,
}

/// [llm] 段：后端选择、模型、超时与重试
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai（任意 OpenAI 兼容接口）/ mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// 单次模型请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetrySection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key_env: default_api_key_env(),
            request_timeout_secs: default_request_timeout_secs(),
            retry: RetrySection::default(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

/// [llm.retry] 段
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8000
}

/// [trajectory] 段
#[derive(Debug, Clone, Deserialize)]
pub struct TrajectorySection {
    /// 轨迹目录，文件名为 `<task_id>.json`
    #[serde(default = "default_trajectory_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_flush_each_step")]
    pub flush_each_step: bool,
}

impl Default for TrajectorySection {
    fn default() -> Self {
        Self {
            dir: default_trajectory_dir(),
            flush_each_step: default_flush_each_step(),
        }
    }
}

fn default_trajectory_dir() -> PathBuf {
    PathBuf::from("trajectories")
}

fn default_flush_each_step() -> bool {
    true
}

impl AppConfig {
    /// 工作区根目录
    pub fn workspace_root(&self) -> PathBuf {
        self.tools
            .workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.llm.retry.max_attempts,
            base_delay: Duration::from_millis(self.llm.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.llm.retry.max_delay_ms),
        }
    }

    /// 派生单任务运行参数；调用方可再逐任务覆盖
    pub fn task_config(&self) -> TaskConfig {
        TaskConfig {
            max_steps: self.task.max_steps,
            tool_timeout: Duration::from_secs(self.tools.tool_timeout_secs),
            step_timeout: Duration::from_secs(self.tools.step_timeout_secs),
            cancel_grace: Duration::from_millis(self.tools.cancel_grace_ms),
            max_concurrent_tools: self.tools.max_concurrent_tools,
            model_timeout: Duration::from_secs(self.llm.request_timeout_secs),
            retry: self.retry(),
            trajectory_path: None,
            trajectory_dir: Some(self.trajectory.dir.clone()),
            flush_each_step: self.trajectory.flush_each_step,
            arguments: Default::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 TRAE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path，则追加该文件（显式指定的文件必须存在）
/// 3. 最后叠加环境变量 TRAE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TRAE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_runtime_defaults() {
        let cfg = AppConfig::default();
        let task = cfg.task_config();
        let runtime = TaskConfig::default();
        assert_eq!(task.max_steps, runtime.max_steps);
        assert_eq!(task.tool_timeout, runtime.tool_timeout);
        assert_eq!(task.step_timeout, runtime.step_timeout);
        assert_eq!(task.cancel_grace, runtime.cancel_grace);
        assert_eq!(task.retry, runtime.retry);
        assert_eq!(task.trajectory_dir, Some(PathBuf::from("trajectories")));
    }

    #[test]
    fn test_explicit_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trae.toml");
        std::fs::write(
            &path,
            r#"
[task]
max_steps = 7

[tools]
tool_timeout_secs = 5

[[tools.remote]]
name = "lint"
program = "ruff"
args = ["check", "{{workspace}}"]

[llm]
provider = "mock"

[llm.retry]
max_attempts = 5
"#,
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.task.max_steps, 7);
        assert_eq!(cfg.tools.tool_timeout_secs, 5);
        assert_eq!(cfg.tools.max_concurrent_tools, 4);
        assert_eq!(cfg.tools.remote.len(), 1);
        assert_eq!(cfg.tools.remote[0].args, vec!["check", "{{workspace}}"]);
        assert_eq!(cfg.llm.provider, "mock");
        assert_eq!(cfg.retry().max_attempts, 5);
        assert_eq!(cfg.task_config().tool_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        assert!(load_config(Some(PathBuf::from("/nonexistent/trae.toml"))).is_err());
    }
}
