//! 轨迹层：步骤与文档结构、持久化目标、记录器

pub mod recorder;
pub mod sink;
pub mod types;

pub use recorder::TrajectoryRecorder;
pub use sink::{JsonFileSink, MemorySink, TrajectorySink};
pub use types::{
    ModelRequestRecord, Step, TrajectoryDocument, TrajectoryMetrics, SCHEMA_VERSION,
};
