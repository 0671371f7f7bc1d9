//! 轨迹记录器
//!
//! 与 TaskController 配对、在一次任务执行期间独占轨迹：
//! record_step 按 index 连续追加，可选每步增量落盘；finalize 计算汇总指标并写出最终文档，
//! 重复调用返回同一份文档。写盘失败只记录为 RecordingError，不会中止任务。

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::core::{RecordingError, Task, TaskFailure, TaskStatus};
use crate::trajectory::{
    Step, TrajectoryDocument, TrajectoryMetrics, TrajectorySink, SCHEMA_VERSION,
};

pub struct TrajectoryRecorder {
    task: Task,
    steps: Vec<Step>,
    start_time: DateTime<Utc>,
    started: Instant,
    sink: Arc<dyn TrajectorySink>,
    flush_each_step: bool,
    finalized: Option<TrajectoryDocument>,
    first_error: Option<RecordingError>,
}

impl TrajectoryRecorder {
    pub fn new(task: Task, sink: Arc<dyn TrajectorySink>, flush_each_step: bool) -> Self {
        Self {
            task,
            steps: Vec::new(),
            start_time: Utc::now(),
            started: Instant::now(),
            sink,
            flush_each_step,
            finalized: None,
            first_error: None,
        }
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn location(&self) -> Option<PathBuf> {
        self.sink.location()
    }

    /// 记录过程中出现的第一个错误
    pub fn recording_error(&self) -> Option<&RecordingError> {
        self.first_error.as_ref()
    }

    /// 已 finalize 的文档
    pub fn document(&self) -> Option<&TrajectoryDocument> {
        self.finalized.as_ref()
    }

    /// 追加一步；index 必须等于当前步数
    pub async fn record_step(&mut self, step: Step) -> Result<(), RecordingError> {
        if self.finalized.is_some() {
            return Err(self.note(RecordingError::AlreadyFinalized));
        }
        if step.index != self.steps.len() {
            return Err(self.note(RecordingError::OutOfOrder {
                expected: self.steps.len(),
                got: step.index,
            }));
        }
        tracing::debug!(
            task_id = %self.task.id,
            step = step.index,
            complete = step.complete,
            tool_calls = step.tool_calls.len(),
            "step recorded"
        );
        self.steps.push(step);

        if self.flush_each_step {
            let snapshot = self.snapshot(None, None, None);
            if let Err(e) = self.sink.write(&snapshot).await {
                tracing::warn!(task_id = %self.task.id, error = %e, "incremental trajectory flush failed");
                return Err(self.note(e));
            }
        }
        Ok(())
    }

    /// 计算汇总指标并写出最终文档；幂等
    pub async fn finalize(
        &mut self,
        task: &Task,
        error: Option<TaskFailure>,
    ) -> Result<TrajectoryDocument, RecordingError> {
        let doc = match &self.finalized {
            Some(doc) => doc.clone(),
            None => {
                self.task = task.clone();
                let end_time = Utc::now();
                let duration_ms = self.started.elapsed().as_millis() as u64;
                let metrics = TrajectoryMetrics::from_steps(&self.steps, duration_ms);
                let doc = self.snapshot(Some(metrics), error, Some(end_time));
                self.finalized = Some(doc.clone());
                doc
            }
        };

        match self.sink.write(&doc).await {
            Ok(()) => {
                tracing::info!(
                    task_id = %doc.task.id,
                    status = ?doc.task.status,
                    steps = doc.steps.len(),
                    "trajectory finalized"
                );
                Ok(doc)
            }
            Err(e) => {
                tracing::warn!(task_id = %doc.task.id, error = %e, "trajectory write failed");
                Err(self.note(e))
            }
        }
    }

    fn snapshot(
        &self,
        metrics: Option<TrajectoryMetrics>,
        error: Option<TaskFailure>,
        end_time: Option<DateTime<Utc>>,
    ) -> TrajectoryDocument {
        TrajectoryDocument {
            schema_version: SCHEMA_VERSION.to_string(),
            task: self.task.clone(),
            steps: self.steps.clone(),
            metrics,
            success: end_time.is_some() && self.task.status == TaskStatus::Completed,
            error,
            start_time: self.start_time,
            end_time,
        }
    }

    fn note(&mut self, error: RecordingError) -> RecordingError {
        if self.first_error.is_none() {
            self.first_error = Some(error.clone());
        }
        error
    }
}
