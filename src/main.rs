//! trae 命令行入口
//!
//! 初始化日志、加载配置、装配工具与 Model Client，执行单个任务并以 JSON 打印 TaskResult。
//! 退出码：0 完成，1 失败，2 步数预算用尽，130 取消。

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use trae::agent::{build_registry, create_model_client};
use trae::config::load_config;
use trae::core::{InterruptHandler, TaskManager, TaskStatus};

#[derive(Parser, Debug)]
#[command(name = "trae", version, about = "Autonomous coding agent runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 执行一个任务
    Run {
        /// 任务描述
        #[arg(required = true, num_args = 1..)]
        task: Vec<String>,

        /// 额外的配置文件
        #[arg(long)]
        config: Option<PathBuf>,

        /// 覆盖 [task].max_steps
        #[arg(long)]
        max_steps: Option<usize>,

        /// 轨迹文件路径（默认 <trajectory.dir>/<task_id>.json）
        #[arg(long)]
        trajectory: Option<PathBuf>,

        /// 工具沙箱根目录
        #[arg(long)]
        workspace: Option<PathBuf>,

        /// 任务参数，形如 key=value，可重复
        #[arg(long = "arg", value_parser = parse_key_value)]
        args: Vec<(String, String)>,

        /// 使用内置脚本化 Model Client
        #[arg(long)]
        mock: bool,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))
}

fn exit_code(status: TaskStatus) -> ExitCode {
    match status {
        TaskStatus::Completed => ExitCode::SUCCESS,
        TaskStatus::StepBudgetExceeded => ExitCode::from(2),
        TaskStatus::Cancelled => ExitCode::from(130),
        _ => ExitCode::from(1),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    trae::observability::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            task,
            config,
            max_steps,
            trajectory,
            workspace,
            args,
            mock,
        } => {
            let cfg = load_config(config).context("Failed to load config")?;
            let workspace = workspace.unwrap_or_else(|| cfg.workspace_root());
            let registry =
                build_registry(&cfg, &workspace).context("Failed to build tool registry")?;
            let client = create_model_client(&cfg, mock).context("Failed to create model client")?;

            let mut task_config = cfg.task_config();
            if let Some(n) = max_steps {
                task_config = task_config.with_max_steps(n);
            }
            if let Some(path) = trajectory {
                task_config = task_config.with_trajectory_path(path);
            }
            for (key, value) in args {
                task_config = task_config.with_argument(key, value);
            }

            let interrupts = Arc::new(InterruptHandler::new());
            interrupts.install_signal_handlers();
            let manager =
                TaskManager::new(client, Arc::new(registry)).with_interrupts(interrupts);

            let task_id = manager.new_task(task.join(" "), task_config).await;
            let result = manager.execute(task_id).await.context("Task execution failed")?;

            if let Some(e) = &result.recording_error {
                tracing::warn!(error = %e, "trajectory recording reported an error");
            }
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(exit_code(result.status))
        }
    }
}
