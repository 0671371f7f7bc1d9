//! 工具层：调用类型、注册表、调度器与内置工具

pub mod bash;
pub mod dispatcher;
pub mod done;
pub mod edit;
pub mod filesystem;
pub mod registry;
pub mod remote;
pub mod report_locs;
pub mod types;

pub use bash::BashTool;
pub use dispatcher::{DispatchOutcome, DispatchPolicy, ToolDispatcher};
pub use done::{TaskDoneTool, DONE_TOOL_NAME};
pub use edit::EditFileTool;
pub use filesystem::{ListDirTool, ReadFileTool, SafeFs};
pub use registry::{Tool, ToolRegistry, ToolRegistryBuilder};
pub use remote::RemoteTool;
pub use report_locs::{LocReport, ReportLocsTool};
pub use types::{optional_str, required_str, ToolArguments, ToolCall, ToolResult, ToolSchema};
