//! 核心层：错误分类、任务模型、中断处理、任务控制器与任务管理

pub mod controller;
pub mod error;
pub mod interrupt;
pub mod manager;
pub mod task;

pub use controller::TaskController;
pub use error::{
    RecordingError, RegistryError, TaskError, TaskFailure, ToolError, ToolExecutionError,
};
pub use interrupt::InterruptHandler;
pub use manager::TaskManager;
pub use task::{Task, TaskConfig, TaskId, TaskResult, TaskStatus};
