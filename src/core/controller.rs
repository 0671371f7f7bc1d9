//! 任务控制器：单任务的顺序步骤循环
//!
//! 每轮：检查取消与步数预算 -> 提交对话给 Model Client（瞬时失败按退避重试）->
//! 分发全部工具调用 -> 工具结果写回对话 -> 完整步骤交给 Recorder -> 推进步号。
//! 回复中含 task_done 时，同一步的其他调用照常执行并记录后再结束。
//! 取消只在两个挂起点的边界生效：模型调用前后、工具分发期间。

use std::sync::Arc;

use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::core::{Task, TaskConfig, TaskError, TaskFailure, TaskResult, TaskStatus};
use crate::llm::{ModelCallError, ModelClient, ModelResponse};
use crate::memory::{Conversation, Message};
use crate::tools::{DispatchPolicy, ToolDispatcher, ToolRegistry, ToolSchema, DONE_TOOL_NAME};
use crate::trajectory::{ModelRequestRecord, Step, TrajectoryRecorder, TrajectorySink};

/// 模型未调用任何工具时追加的提醒
const NO_TOOL_CALL_REMINDER: &str = "It seems that you have not completed the task. \
Keep working with the available tools, or call `task_done` if the work is finished and verified.";

enum SubmitFailure {
    /// 退避等待期间收到取消
    Cancelled,
    /// 不可重试或重试耗尽
    Exhausted(ModelCallError),
}

/// 单任务控制器；每个任务一个实例，独占对话与轨迹
pub struct TaskController {
    task: Task,
    config: TaskConfig,
    client: Arc<dyn ModelClient>,
    dispatcher: ToolDispatcher,
    sink: Arc<dyn TrajectorySink>,
    conversation: Conversation,
    cancel: CancellationToken,
}

impl TaskController {
    pub fn new(
        task: Task,
        config: TaskConfig,
        client: Arc<dyn ModelClient>,
        registry: Arc<ToolRegistry>,
        sink: Arc<dyn TrajectorySink>,
        cancel: CancellationToken,
    ) -> Self {
        let policy = DispatchPolicy {
            tool_timeout: config.tool_timeout,
            step_timeout: config.step_timeout,
            cancel_grace: config.cancel_grace,
            max_concurrency: config.max_concurrent_tools,
        };
        Self {
            task,
            config,
            client,
            dispatcher: ToolDispatcher::new(registry, policy),
            sink,
            conversation: Conversation::new(),
            cancel,
        }
    }

    /// 执行任务直到完成、失败、预算用尽或取消；任何终态都会 finalize 轨迹
    pub async fn run(mut self) -> Result<TaskResult, TaskError> {
        self.task.transition(TaskStatus::Running)?;
        let mut recorder =
            TrajectoryRecorder::new(self.task.clone(), self.sink.clone(), self.config.flush_each_step);
        let schemas = self.dispatcher.registry().schemas();
        let tool_names: Vec<String> = schemas.iter().map(|s| s.name.clone()).collect();
        self.seed_conversation();

        tracing::info!(
            task_id = %self.task.id,
            max_steps = self.task.max_steps,
            model = %self.client.model_name(),
            tools = tool_names.len(),
            "task started"
        );

        let mut step_index = 0usize;
        let (status, failure) = loop {
            if self.cancel.is_cancelled() {
                break (TaskStatus::Cancelled, None);
            }
            if step_index >= self.task.max_steps {
                break (
                    TaskStatus::StepBudgetExceeded,
                    Some(TaskFailure::StepBudgetExceeded {
                        max_steps: self.task.max_steps,
                    }),
                );
            }

            tracing::info!(task_id = %self.task.id, step = step_index, "step started");
            let mut step = Step::begin(
                step_index,
                ModelRequestRecord {
                    messages: self.conversation.messages().to_vec(),
                    tools: tool_names.clone(),
                },
            );

            let response = match self.submit_with_retry(&schemas).await {
                Ok(response) => response,
                Err(SubmitFailure::Cancelled) => break (TaskStatus::Cancelled, None),
                Err(SubmitFailure::Exhausted(error)) => {
                    break (TaskStatus::Failed, Some(TaskFailure::ModelCall { error }));
                }
            };
            self.conversation.push(Message::assistant(
                response.content.clone(),
                response.tool_calls.clone(),
            ));
            step.set_response(response);
            let done_requested = step.tool_calls.iter().any(|c| c.name == DONE_TOOL_NAME);

            if step.tool_calls.is_empty() {
                step.complete = true;
                self.conversation.push(Message::user(NO_TOOL_CALL_REMINDER));
                Self::record(&mut recorder, step).await;
                step_index += 1;
                continue;
            }

            // 分发边界：回复已到达但工具尚未启动
            if self.cancel.is_cancelled() {
                Self::record(&mut recorder, step).await;
                break (TaskStatus::Cancelled, None);
            }

            let outcome = self.dispatcher.dispatch(&step.tool_calls, &self.cancel).await;
            let cancelled = outcome.cancelled;
            step.complete = outcome.is_complete(step.tool_calls.len());
            for result in &outcome.results {
                self.conversation.push(Message::tool_result(result));
            }
            step.tool_results = outcome.results;
            let complete = step.complete;
            Self::record(&mut recorder, step).await;
            step_index += 1;

            if done_requested && complete {
                break (TaskStatus::Completed, None);
            }
            if cancelled {
                break (TaskStatus::Cancelled, None);
            }
        };

        self.task.transition(status)?;
        // finalize 的写盘错误已记入 recorder，下面统一取第一个错误
        let _ = recorder.finalize(&self.task, failure.clone()).await;

        tracing::info!(
            task_id = %self.task.id,
            status = ?status,
            steps = recorder.step_count(),
            "task finished"
        );

        Ok(TaskResult {
            task_id: self.task.id,
            status,
            step_count: recorder.step_count(),
            trajectory_ref: recorder.location(),
            error: failure,
            recording_error: recorder.recording_error().cloned(),
        })
    }

    fn seed_conversation(&mut self) {
        self.conversation.push(Message::system(format!(
            "You are an autonomous software engineering agent. Work on the task step by step \
             using the available tools. Every tool result is returned to you in the next turn. \
             When the task is fully complete and verified, call the `{DONE_TOOL_NAME}` tool."
        )));

        let mut user = format!("[Task]\n{}", self.task.description);
        if !self.task.arguments.is_empty() {
            user.push_str("\n\n[Arguments]");
            for (key, value) in &self.task.arguments {
                user.push_str(&format!("\n{key}: {value}"));
            }
        }
        self.conversation.push(Message::user(user));
    }

    /// 提交对话；瞬时错误按 RetryConfig 退避重试，退避期间可被取消
    async fn submit_with_retry(&self, schemas: &[ToolSchema]) -> Result<ModelResponse, SubmitFailure> {
        let retry = self.config.retry;
        let max_attempts = retry.max_attempts.max(1);
        let mut attempt = 1u32;
        loop {
            let submitted = timeout(
                self.config.model_timeout,
                self.client.submit(self.conversation.messages(), schemas),
            )
            .await;
            let error = match submitted {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) => e,
                Err(_) => ModelCallError::Timeout {
                    timeout_ms: self.config.model_timeout.as_millis() as u64,
                },
            };

            if !error.is_transient() || attempt >= max_attempts {
                tracing::warn!(task_id = %self.task.id, attempt, error = %error, "model call failed");
                return Err(SubmitFailure::Exhausted(error));
            }

            let delay = retry.delay_for(attempt, &error);
            tracing::warn!(
                task_id = %self.task.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient model failure, retrying"
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.cancel.cancelled() => return Err(SubmitFailure::Cancelled),
            }
            attempt += 1;
        }
    }

    async fn record(recorder: &mut TrajectoryRecorder, step: Step) {
        let index = step.index;
        if let Err(e) = recorder.record_step(step).await {
            tracing::debug!(step = index, error = %e, "step recording reported an error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedModelClient;
    use crate::tools::ToolCall;
    use crate::trajectory::MemorySink;
    use serde_json::json;
    use std::time::Duration;

    fn controller(
        client: ScriptedModelClient,
        config: TaskConfig,
        sink: Arc<MemorySink>,
    ) -> (TaskController, CancellationToken) {
        let cancel = CancellationToken::new();
        let controller = controller_with(Arc::new(client), config, sink, cancel.clone());
        (controller, cancel)
    }

    fn controller_with(
        client: Arc<dyn ModelClient>,
        config: TaskConfig,
        sink: Arc<MemorySink>,
        cancel: CancellationToken,
    ) -> TaskController {
        let task = Task::new("list the repo", config.max_steps)
            .with_arguments(config.arguments.clone());
        TaskController::new(
            task,
            config,
            client,
            Arc::new(ToolRegistry::builder().build()),
            sink,
            cancel,
        )
    }

    /// 回复到达前触发取消：模拟在 submit 进行中收到中断
    struct CancelInFlight {
        inner: ScriptedModelClient,
        cancel: CancellationToken,
    }

    #[async_trait::async_trait]
    impl ModelClient for CancelInFlight {
        async fn submit(
            &self,
            conversation: &[Message],
            tools: &[ToolSchema],
        ) -> Result<ModelResponse, ModelCallError> {
            self.cancel.cancel();
            self.inner.submit(conversation, tools).await
        }
    }

    fn done(id: &str) -> ModelResponse {
        ModelResponse::with_tool_calls("done", vec![ToolCall::new(id, DONE_TOOL_NAME, json!({}))])
    }

    #[tokio::test]
    async fn test_text_only_turn_gets_reminder_and_loop_continues() {
        let client = ScriptedModelClient::from_responses(vec![
            ModelResponse::text("thinking out loud"),
            done("c1"),
        ]);
        let sink = Arc::new(MemorySink::new());
        let (controller, _) = controller(client, TaskConfig::default(), sink.clone());
        let result = controller.run().await.unwrap();

        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.step_count, 2);
        let doc = sink.latest().await.unwrap();
        assert!(doc.steps[0].complete);
        assert!(doc.steps[0].tool_calls.is_empty());
        let second_request = &doc.steps[1].model_request.messages;
        assert!(second_request
            .last()
            .map(|m| m.content.contains("task_done"))
            .unwrap_or(false));
    }

    #[tokio::test]
    async fn test_arguments_are_rendered_into_first_user_turn() {
        let client = ScriptedModelClient::from_responses(vec![done("c1")]);
        let sink = Arc::new(MemorySink::new());
        let config = TaskConfig::default().with_argument("project_path", "/repo");
        let (controller, _) = controller(client, config, sink.clone());
        controller.run().await.unwrap();

        let doc = sink.latest().await.unwrap();
        let first_user = &doc.steps[0].model_request.messages[1];
        assert!(first_user.content.contains("[Task]\nlist the repo"));
        assert!(first_user.content.contains("project_path: /repo"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let client = ScriptedModelClient::new(vec![
            Err(ModelCallError::Network {
                message: "reset".into(),
            }),
            Err(ModelCallError::RateLimited {
                retry_after_ms: None,
            }),
            Ok(done("c1")),
        ]);
        let sink = Arc::new(MemorySink::new());
        let (controller, _) = controller(client, TaskConfig::default(), sink);
        let result = controller.run().await.unwrap();

        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.step_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_fails_task() {
        let client = ScriptedModelClient::new(vec![
            Err(ModelCallError::Timeout { timeout_ms: 1 }),
            Err(ModelCallError::Timeout { timeout_ms: 1 }),
            Err(ModelCallError::Timeout { timeout_ms: 1 }),
            Ok(done("never")),
        ]);
        let sink = Arc::new(MemorySink::new());
        let (controller, _) = controller(client, TaskConfig::default(), sink.clone());
        let result = controller.run().await.unwrap();

        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.step_count, 0);
        assert!(matches!(result.error, Some(TaskFailure::ModelCall { .. })));
        let doc = sink.latest().await.unwrap();
        assert!(doc.is_finalized());
        assert_eq!(doc.task.status, TaskStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_failure_is_not_retried() {
        let client = ScriptedModelClient::new(vec![
            Err(ModelCallError::Provider {
                status: 401,
                message: "bad key".into(),
            }),
            Ok(done("c1")),
        ]);
        let sink = Arc::new(MemorySink::new());
        let (controller, _) = controller(client, TaskConfig::default(), sink);
        let result = controller.run().await.unwrap();
        assert_eq!(result.status, TaskStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_stops_task() {
        let client = ScriptedModelClient::new(vec![Err(ModelCallError::Network {
            message: "down".into(),
        })])
        .with_fallback(done("c1"));
        let sink = Arc::new(MemorySink::new());
        let mut config = TaskConfig::default();
        config.retry.base_delay = Duration::from_secs(30);
        let (controller, cancel) = controller(client, config, sink);

        let handle = tokio::spawn(controller.run());
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        let result = handle.await.unwrap().unwrap();

        assert_eq!(result.status, TaskStatus::Cancelled);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_pre_cancelled_task_records_no_steps() {
        let client = ScriptedModelClient::from_responses(vec![done("c1")]);
        let sink = Arc::new(MemorySink::new());
        let (controller, cancel) = controller(client, TaskConfig::default(), sink.clone());
        cancel.cancel();
        let result = controller.run().await.unwrap();

        assert_eq!(result.status, TaskStatus::Cancelled);
        assert_eq!(result.step_count, 0);
        assert!(sink.latest().await.unwrap().steps.is_empty());
    }

    #[tokio::test]
    async fn test_conversation_grows_between_submits() {
        let client = Arc::new(ScriptedModelClient::from_responses(vec![
            ModelResponse::text("thinking out loud"),
            done("c1"),
        ]));
        let sink = Arc::new(MemorySink::new());
        let controller = controller_with(
            client.clone(),
            TaskConfig::default(),
            sink,
            CancellationToken::new(),
        );
        controller.run().await.unwrap();

        // system + task，随后追加 assistant 回复与提醒
        assert_eq!(client.observed_conversation_lengths().await, vec![2, 4]);
    }

    #[tokio::test]
    async fn test_cancel_during_submit_records_incomplete_step() {
        let cancel = CancellationToken::new();
        let client = Arc::new(CancelInFlight {
            inner: ScriptedModelClient::from_responses(vec![ModelResponse::with_tool_calls(
                "look around",
                vec![ToolCall::new("c0", "list_dir", json!({"path": "."}))],
            )]),
            cancel: cancel.clone(),
        });
        let sink = Arc::new(MemorySink::new());
        let controller = controller_with(client, TaskConfig::default(), sink.clone(), cancel);
        let result = controller.run().await.unwrap();

        assert_eq!(result.status, TaskStatus::Cancelled);
        assert_eq!(result.step_count, 1);
        assert!(result.error.is_none());
        let doc = sink.latest().await.unwrap();
        assert!(doc.is_finalized());
        assert_eq!(doc.steps.len(), 1);
        assert!(!doc.steps[0].complete);
        assert_eq!(doc.steps[0].tool_calls.len(), 1);
        assert!(doc.steps[0].tool_results.is_empty());
    }
}
