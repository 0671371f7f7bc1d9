//! 任务管理：创建、执行、取消与查询
//!
//! 每个任务在 new_task 时注册取消令牌，因此执行前的取消也会生效；
//! execute 为任务选择轨迹目标（配置了路径写 JSON 文件，否则写内存）并驱动 TaskController。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::core::{
    InterruptHandler, Task, TaskConfig, TaskController, TaskError, TaskId, TaskResult, TaskStatus,
};
use crate::llm::ModelClient;
use crate::tools::ToolRegistry;
use crate::trajectory::{JsonFileSink, MemorySink, TrajectorySink};

struct TaskEntry {
    task: Task,
    config: TaskConfig,
}

/// 任务管理器：共享同一个 Model Client 与冻结后的工具注册表
pub struct TaskManager {
    client: Arc<dyn ModelClient>,
    registry: Arc<ToolRegistry>,
    interrupts: Arc<InterruptHandler>,
    tasks: RwLock<HashMap<TaskId, TaskEntry>>,
}

impl TaskManager {
    pub fn new(client: Arc<dyn ModelClient>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            client,
            registry,
            interrupts: Arc::new(InterruptHandler::new()),
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// 使用外部中断处理器（例如已安装系统信号处理的实例）
    pub fn with_interrupts(mut self, interrupts: Arc<InterruptHandler>) -> Self {
        self.interrupts = interrupts;
        self
    }

    pub fn interrupts(&self) -> &Arc<InterruptHandler> {
        &self.interrupts
    }

    /// 创建 Pending 任务
    pub async fn new_task(&self, description: impl Into<String>, config: TaskConfig) -> TaskId {
        let task = Task::new(description, config.max_steps).with_arguments(config.arguments.clone());
        let task_id = task.id;
        self.interrupts.register(task_id).await;
        self.tasks
            .write()
            .await
            .insert(task_id, TaskEntry { task, config });
        tracing::debug!(task_id = %task_id, "task created");
        task_id
    }

    /// 执行 Pending 任务直到终态
    pub async fn execute(&self, task_id: TaskId) -> Result<TaskResult, TaskError> {
        let (task, config) = {
            let mut tasks = self.tasks.write().await;
            let entry = tasks
                .get_mut(&task_id)
                .ok_or_else(|| TaskError::UnknownTask(task_id.to_string()))?;
            if entry.task.status != TaskStatus::Pending {
                return Err(TaskError::TaskNotPending(task_id.to_string()));
            }
            let task = entry.task.clone();
            entry.task.transition(TaskStatus::Running)?;
            (task, entry.config.clone())
        };

        let cancel = self.interrupts.register(task_id).await;
        let sink: Arc<dyn TrajectorySink> = match config.resolve_trajectory_path(task_id) {
            Some(path) => Arc::new(JsonFileSink::new(path)),
            None => Arc::new(MemorySink::new()),
        };
        let controller = TaskController::new(
            task,
            config,
            self.client.clone(),
            self.registry.clone(),
            sink,
            cancel,
        );

        let result = controller.run().await;
        let settled = match &result {
            Ok(result) => self.settle(task_id, result.status).await,
            Err(_) => Ok(()),
        };
        // 无论状态同步是否成功都释放令牌
        self.interrupts.release(task_id).await;
        settled?;
        result
    }

    /// 把终态同步回任务表
    async fn settle(&self, task_id: TaskId, status: TaskStatus) -> Result<(), TaskError> {
        match self.tasks.write().await.get_mut(&task_id) {
            Some(entry) => entry.task.transition(status),
            None => Ok(()),
        }
    }

    /// 请求取消；对已结束的任务无效果
    pub async fn cancel(&self, task_id: TaskId) -> Result<(), TaskError> {
        if !self.tasks.read().await.contains_key(&task_id) {
            return Err(TaskError::UnknownTask(task_id.to_string()));
        }
        self.interrupts.signal_stop(task_id).await;
        Ok(())
    }

    pub async fn status(&self, task_id: TaskId) -> Option<TaskStatus> {
        self.tasks.read().await.get(&task_id).map(|e| e.task.status)
    }

    pub async fn task(&self, task_id: TaskId) -> Option<Task> {
        self.tasks.read().await.get(&task_id).map(|e| e.task.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ModelCallError, ModelResponse, ScriptedModelClient};
    use crate::memory::Message;
    use crate::tools::{ToolCall, ToolSchema, DONE_TOOL_NAME};
    use serde_json::json;
    use tokio::sync::Notify;

    /// submit 时先通知 entered，再等待 release 后返回 task_done
    #[derive(Default)]
    struct GatedClient {
        entered: Notify,
        release: Notify,
    }

    #[async_trait::async_trait]
    impl ModelClient for GatedClient {
        async fn submit(
            &self,
            _conversation: &[Message],
            _tools: &[ToolSchema],
        ) -> Result<ModelResponse, ModelCallError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(done())
        }
    }

    fn manager(responses: Vec<ModelResponse>) -> TaskManager {
        TaskManager::new(
            Arc::new(ScriptedModelClient::from_responses(responses)),
            Arc::new(ToolRegistry::builder().build()),
        )
    }

    fn done() -> ModelResponse {
        ModelResponse::with_tool_calls("", vec![ToolCall::new("c1", DONE_TOOL_NAME, json!({}))])
    }

    #[tokio::test]
    async fn test_execute_completes_and_updates_status() {
        let manager = manager(vec![done()]);
        let id = manager.new_task("noop", TaskConfig::default()).await;
        assert_eq!(manager.status(id).await, Some(TaskStatus::Pending));

        let result = manager.execute(id).await.unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
        assert!(result.trajectory_ref.is_none());
        assert_eq!(manager.status(id).await, Some(TaskStatus::Completed));
    }

    #[tokio::test]
    async fn test_execute_twice_is_rejected() {
        let manager = manager(vec![done()]);
        let id = manager.new_task("noop", TaskConfig::default()).await;
        manager.execute(id).await.unwrap();

        let err = manager.execute(id).await.unwrap_err();
        assert!(matches!(err, TaskError::TaskNotPending(_)));
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let manager = manager(vec![]);
        let id = TaskId::new();
        assert!(matches!(manager.execute(id).await, Err(TaskError::UnknownTask(_))));
        assert!(matches!(manager.cancel(id).await, Err(TaskError::UnknownTask(_))));
        assert!(manager.status(id).await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_before_execute() {
        let manager = manager(vec![done()]);
        let id = manager.new_task("noop", TaskConfig::default()).await;
        manager.cancel(id).await.unwrap();

        let result = manager.execute(id).await.unwrap();
        assert_eq!(result.status, TaskStatus::Cancelled);
        assert_eq!(result.step_count, 0);
    }

    #[tokio::test]
    async fn test_trajectory_written_to_configured_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let manager = manager(vec![done()]);
        let config = TaskConfig::default().with_trajectory_path(&path);
        let id = manager.new_task("noop", config).await;

        let result = manager.execute(id).await.unwrap();
        assert_eq!(result.trajectory_ref, Some(path.clone()));
        let doc = crate::trajectory::TrajectoryDocument::load(&path).unwrap();
        assert!(doc.success);
        assert_eq!(doc.steps.len(), 1);
    }

    #[tokio::test]
    async fn test_status_sync_failure_still_releases_token() {
        let client = Arc::new(GatedClient::default());
        let manager = Arc::new(TaskManager::new(
            client.clone(),
            Arc::new(ToolRegistry::builder().build()),
        ));
        let id = manager.new_task("noop", TaskConfig::default()).await;

        let runner = manager.clone();
        let handle = tokio::spawn(async move { runner.execute(id).await });
        client.entered.notified().await;
        // 任务表里的状态被提前改为终态，结束时的同步会失败
        if let Some(entry) = manager.tasks.write().await.get_mut(&id) {
            entry.task.status = TaskStatus::Failed;
        }
        client.release.notify_one();

        let err = handle.await.unwrap().err().unwrap();
        assert!(matches!(err, TaskError::InvalidTransition { .. }));
        assert!(manager.interrupts().token(id).await.is_none());
    }
}
