//! 轨迹持久化目标
//!
//! JsonFileSink 先写 `<path>.tmp` 再 rename，磁盘上的文档始终是完整 JSON；
//! MemorySink 只保留最近一次写入，用于未配置轨迹路径的任务与测试。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;

use crate::core::RecordingError;
use crate::trajectory::TrajectoryDocument;

/// 轨迹写入目标
#[async_trait]
pub trait TrajectorySink: Send + Sync {
    /// 整体覆盖写入当前文档
    async fn write(&self, doc: &TrajectoryDocument) -> Result<(), RecordingError>;

    /// 文档位置（写入 TaskResult.trajectory_ref）
    fn location(&self) -> Option<PathBuf> {
        None
    }
}

/// 单文件 JSON 持久化；父目录不存在时自动创建
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl TrajectorySink for JsonFileSink {
    async fn write(&self, doc: &TrajectoryDocument) -> Result<(), RecordingError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let data = serde_json::to_vec_pretty(doc)?;
        let tmp = self.tmp_path();
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    fn location(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }
}

/// 内存目标：保留最近写入的文档与写入次数
#[derive(Debug, Default)]
pub struct MemorySink {
    latest: Mutex<Option<TrajectoryDocument>>,
    writes: Mutex<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn latest(&self) -> Option<TrajectoryDocument> {
        self.latest.lock().await.clone()
    }

    pub async fn write_count(&self) -> usize {
        *self.writes.lock().await
    }
}

#[async_trait]
impl TrajectorySink for MemorySink {
    async fn write(&self, doc: &TrajectoryDocument) -> Result<(), RecordingError> {
        *self.latest.lock().await = Some(doc.clone());
        *self.writes.lock().await += 1;
        Ok(())
    }
}
