//! Trae - 自主编码智能体运行时
//!
//! 模块划分：
//! - **agent**: 从配置装配工具注册表与 Model Client
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务模型、任务控制器（步骤循环）、中断处理、任务管理
//! - **llm**: Model Client 抽象与实现（OpenAI 兼容 / 脚本化 Mock）
//! - **memory**: 任务内对话
//! - **observability**: tracing 初始化
//! - **tools**: 工具注册表、并发调度器、内置工具与远程工具适配
//! - **trajectory**: 轨迹文档、持久化目标与记录器

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod tools;
pub mod trajectory;

pub use crate::core::{TaskConfig, TaskManager, TaskResult, TaskStatus};
