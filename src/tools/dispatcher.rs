//! 工具调度器
//!
//! 持有只读 ToolRegistry 与调度策略，dispatch(calls) 在有界并发下执行一步内的全部调用：
//! - 每次调用施加超时，超时结果为 `Timeout`，duration_ms 取配置的超时值；
//! - 未注册的工具名得到 `UnknownTool`，不影响其他调用；
//! - 输出顺序与输入顺序一致，与完成顺序无关；
//! - 全部调用结束或到达单步硬上限即返回，未结束的调用记为 `StepTimeout`；
//! - 观察到取消后给在途调用一个宽限期，到期仍未结束的调用被放弃，其结果缺省。
//!
//! 每次调用输出一条结构化审计日志（JSON）。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{Id, JoinSet};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::core::ToolError;
use crate::tools::{Tool, ToolCall, ToolRegistry, ToolResult};

/// 调度策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    /// 单次调用超时
    pub tool_timeout: Duration,
    /// 单步内全部调用的硬上限
    pub step_timeout: Duration,
    /// 取消后的宽限期
    pub cancel_grace: Duration,
    /// 工作池大小（同时执行的调用数上限）
    pub max_concurrency: usize,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            tool_timeout: Duration::from_secs(120),
            step_timeout: Duration::from_secs(600),
            cancel_grace: Duration::from_secs(2),
            max_concurrency: 4,
        }
    }
}

/// 一次 dispatch 的结果
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// 按调用顺序排列；取消时只保留按顺序连续完成的前缀
    pub results: Vec<ToolResult>,
    /// dispatch 期间观察到了取消信号
    pub cancelled: bool,
}

impl DispatchOutcome {
    /// 每个调用都有结果
    pub fn is_complete(&self, call_count: usize) -> bool {
        self.results.len() == call_count
    }
}

/// 工具调度器：有界并发、逐调用超时、保序输出
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    policy: DispatchPolicy,
    pool: Arc<Semaphore>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, policy: DispatchPolicy) -> Self {
        Self {
            registry,
            pool: Arc::new(Semaphore::new(policy.max_concurrency.max(1))),
            policy,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 执行一步内的全部工具调用；stop 为任务级取消令牌
    pub async fn dispatch(&self, calls: &[ToolCall], stop: &CancellationToken) -> DispatchOutcome {
        let started = Instant::now();
        let step_deadline = started + self.policy.step_timeout;
        let mut slots: Vec<Option<ToolResult>> = vec![None; calls.len()];
        let mut abandon_tokens: Vec<CancellationToken> = Vec::with_capacity(calls.len());
        let mut set = JoinSet::new();
        let mut task_index: HashMap<Id, usize> = HashMap::with_capacity(calls.len());

        for (idx, call) in calls.iter().enumerate() {
            let Some(tool) = self.registry.get(&call.name) else {
                audit(call, "unknown_tool", 0);
                slots[idx] = Some(ToolResult::failure(
                    call,
                    ToolError::UnknownTool {
                        name: call.name.clone(),
                    },
                    0,
                ));
                continue;
            };
            // 调用自己的令牌不挂在 stop 下：取消后在途调用仍有宽限期
            let abandon = CancellationToken::new();
            abandon_tokens.push(abandon.clone());
            let handle = set.spawn(run_call(
                idx,
                tool,
                call.clone(),
                self.pool.clone(),
                self.policy.tool_timeout,
                stop.clone(),
                abandon,
            ));
            task_index.insert(handle.id(), idx);
        }

        let mut cancelled = false;
        let mut grace_deadline: Option<Instant> = None;
        let mut step_capped = false;

        while !set.is_empty() {
            tokio::select! {
                joined = set.join_next() => match joined {
                    Some(Ok((idx, Some(result)))) => slots[idx] = Some(result),
                    Some(Ok((_, None))) => {}
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "tool task panicked");
                        if let Some(&idx) = task_index.get(&e.id()) {
                            let call = &calls[idx];
                            let duration_ms = started.elapsed().as_millis() as u64;
                            audit(call, "error", duration_ms);
                            slots[idx] = Some(ToolResult::failure(
                                call,
                                ToolError::Execution {
                                    message: "tool task panicked".to_string(),
                                },
                                duration_ms,
                            ));
                        }
                    }
                    None => break,
                },
                _ = stop.cancelled(), if grace_deadline.is_none() => {
                    cancelled = true;
                    grace_deadline = Some(Instant::now() + self.policy.cancel_grace);
                    tracing::info!(
                        in_flight = set.len(),
                        grace_ms = self.policy.cancel_grace.as_millis() as u64,
                        "cancellation observed during dispatch"
                    );
                }
                _ = sleep_until(grace_deadline.unwrap_or(step_deadline)), if grace_deadline.is_some() => {
                    tracing::warn!(abandoned = set.len(), "grace period expired, abandoning tool calls");
                    break;
                }
                _ = sleep_until(step_deadline) => {
                    tracing::warn!(
                        unsettled = set.len(),
                        step_timeout_ms = self.policy.step_timeout.as_millis() as u64,
                        "step time limit reached"
                    );
                    step_capped = true;
                    break;
                }
            }
        }

        if !set.is_empty() {
            for token in &abandon_tokens {
                token.cancel();
            }
            set.abort_all();
        }

        // 排队中的调用在取消后直接返回，join_next 可能先于取消分支被选中
        cancelled |= stop.is_cancelled();

        let elapsed_ms = started.elapsed().as_millis() as u64;
        for (idx, slot) in slots.iter_mut().enumerate() {
            if slot.is_some() {
                continue;
            }
            let call = &calls[idx];
            if step_capped {
                audit(call, "step_timeout", elapsed_ms);
                *slot = Some(ToolResult::failure(call, ToolError::StepTimeout, elapsed_ms));
            } else {
                audit(call, "abandoned", elapsed_ms);
            }
        }

        let results: Vec<ToolResult> = slots.into_iter().map_while(|slot| slot).collect();
        DispatchOutcome { results, cancelled }
    }
}

/// 单个调用：先取得工作池许可，再在超时内执行
async fn run_call(
    idx: usize,
    tool: Arc<dyn Tool>,
    call: ToolCall,
    pool: Arc<Semaphore>,
    tool_timeout: Duration,
    stop: CancellationToken,
    abandon: CancellationToken,
) -> (usize, Option<ToolResult>) {
    // 尚未开始的调用在取消后不再启动
    let _permit = tokio::select! {
        permit = pool.acquire_owned() => match permit {
            Ok(p) => p,
            Err(_) => return (idx, None),
        },
        _ = stop.cancelled() => return (idx, None),
    };
    if stop.is_cancelled() {
        return (idx, None);
    }

    let start = Instant::now();
    let result = timeout(tool_timeout, tool.execute(call.arguments.clone(), abandon.clone())).await;
    let result = match result {
        Ok(Ok(output)) => {
            let duration_ms = start.elapsed().as_millis() as u64;
            audit(&call, "ok", duration_ms);
            ToolResult::success(&call, output, duration_ms)
        }
        Ok(Err(e)) => {
            let duration_ms = start.elapsed().as_millis() as u64;
            audit(&call, "error", duration_ms);
            ToolResult::failure(&call, e.into(), duration_ms)
        }
        Err(_) => {
            // 尽力中止：通知支持取消的工具
            abandon.cancel();
            let duration_ms = tool_timeout.as_millis() as u64;
            audit(&call, "timeout", duration_ms);
            ToolResult::failure(&call, ToolError::Timeout, duration_ms)
        }
    };
    (idx, Some(result))
}

fn audit(call: &ToolCall, outcome: &str, duration_ms: u64) {
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": call.name,
        "call_id": call.id,
        "ok": outcome == "ok",
        "outcome": outcome,
        "duration_ms": duration_ms,
        "args_preview": args_preview(&call.arguments),
    });
    tracing::info!(audit = %audit, "tool");
}

fn args_preview(args: &crate::tools::ToolArguments) -> String {
    let s = serde_json::Value::Object(args.clone()).to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ToolExecutionError;
    use crate::tools::ToolArguments;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 按参数 ms 休眠后返回 name
    struct Sleepy {
        name: &'static str,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Sleepy {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                running: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Tool for Sleepy {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "sleeps"
        }

        async fn execute(
            &self,
            args: ToolArguments,
            _cancel: CancellationToken,
        ) -> Result<String, ToolExecutionError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let ms = args.get("ms").and_then(|v| v.as_u64()).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if args.get("panic").is_some() {
                panic!("tool blew up");
            }
            if args.get("fail").is_some() {
                return Err(ToolExecutionError::Failed("asked to fail".into()));
            }
            Ok(format!("slept {ms}"))
        }
    }

    fn dispatcher_with(tool: Sleepy, policy: DispatchPolicy) -> ToolDispatcher {
        let mut builder = ToolRegistry::builder();
        builder.register(tool).unwrap();
        ToolDispatcher::new(Arc::new(builder.build()), policy)
    }

    fn call(id: &str, ms: u64) -> ToolCall {
        ToolCall::new(id, "sleepy", json!({ "ms": ms }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_preserve_call_order() {
        let dispatcher = dispatcher_with(Sleepy::new("sleepy"), DispatchPolicy::default());
        let calls = vec![call("a", 300), call("b", 100), call("c", 200)];
        let outcome = dispatcher.dispatch(&calls, &CancellationToken::new()).await;

        assert!(!outcome.cancelled);
        let ids: Vec<&str> = outcome.results.iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(outcome.results[1].output.as_deref(), Some("slept 100"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_tool_and_failures_are_local() {
        let dispatcher = dispatcher_with(Sleepy::new("sleepy"), DispatchPolicy::default());
        let calls = vec![
            ToolCall::new("x", "no_such_tool", json!({})),
            ToolCall::new("y", "sleepy", json!({"ms": 10, "fail": true})),
            call("z", 10),
        ];
        let outcome = dispatcher.dispatch(&calls, &CancellationToken::new()).await;

        assert!(outcome.is_complete(3));
        assert_eq!(
            outcome.results[0].error,
            Some(ToolError::UnknownTool {
                name: "no_such_tool".into()
            })
        );
        assert!(matches!(
            outcome.results[1].error,
            Some(ToolError::Execution { .. })
        ));
        assert!(outcome.results[2].error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_configured_duration() {
        let policy = DispatchPolicy {
            tool_timeout: Duration::from_millis(500),
            ..DispatchPolicy::default()
        };
        let dispatcher = dispatcher_with(Sleepy::new("sleepy"), policy);
        let outcome = dispatcher
            .dispatch(&[call("slow", 10_000), call("fast", 10)], &CancellationToken::new())
            .await;

        assert_eq!(outcome.results[0].error, Some(ToolError::Timeout));
        assert_eq!(outcome.results[0].duration_ms, 500);
        assert!(outcome.results[1].error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_pool_bounds_concurrency() {
        let tool = Sleepy::new("sleepy");
        let peak = tool.peak.clone();
        let policy = DispatchPolicy {
            max_concurrency: 2,
            ..DispatchPolicy::default()
        };
        let dispatcher = dispatcher_with(tool, policy);
        let calls: Vec<ToolCall> = (0..6).map(|i| call(&format!("c{i}"), 50)).collect();
        let outcome = dispatcher.dispatch(&calls, &CancellationToken::new()).await;

        assert!(outcome.is_complete(6));
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_cap_marks_unsettled_calls() {
        let policy = DispatchPolicy {
            tool_timeout: Duration::from_secs(60),
            step_timeout: Duration::from_secs(1),
            ..DispatchPolicy::default()
        };
        let dispatcher = dispatcher_with(Sleepy::new("sleepy"), policy);
        let outcome = dispatcher
            .dispatch(&[call("quick", 10), call("stuck", 30_000)], &CancellationToken::new())
            .await;

        assert!(outcome.is_complete(2));
        assert!(outcome.results[0].error.is_none());
        assert_eq!(outcome.results[1].error, Some(ToolError::StepTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_keeps_only_settled_prefix() {
        let policy = DispatchPolicy {
            cancel_grace: Duration::from_millis(100),
            ..DispatchPolicy::default()
        };
        let dispatcher = dispatcher_with(Sleepy::new("sleepy"), policy);
        let stop = CancellationToken::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        // a 在宽限期内结束，b 超出宽限期被放弃
        let calls = vec![call("a", 120), call("b", 5_000), call("c", 10)];
        let outcome = dispatcher.dispatch(&calls, &stop).await;

        assert!(outcome.cancelled);
        let ids: Vec<&str> = outcome.results.iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
        assert!(!outcome.is_complete(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_queued_is_not_reported_as_panic() {
        // 取消与首个调用完成落在同一时刻，排队中的调用可能先被 join_next 收回
        for _ in 0..20 {
            let policy = DispatchPolicy {
                max_concurrency: 1,
                cancel_grace: Duration::from_millis(10),
                ..DispatchPolicy::default()
            };
            let dispatcher = dispatcher_with(Sleepy::new("sleepy"), policy);
            let stop = CancellationToken::new();
            let trigger = stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                trigger.cancel();
            });

            let calls = vec![call("a", 100), call("b", 100)];
            let outcome = dispatcher.dispatch(&calls, &stop).await;

            assert!(outcome.cancelled);
            assert!(outcome.results.len() <= 1);
            for result in &outcome.results {
                assert_eq!(result.call_id, "a");
                assert!(result.error.is_none());
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_tool_yields_execution_error() {
        let dispatcher = dispatcher_with(Sleepy::new("sleepy"), DispatchPolicy::default());
        let calls = vec![
            ToolCall::new("boom", "sleepy", json!({"ms": 10, "panic": true})),
            call("ok", 20),
        ];
        let outcome = dispatcher.dispatch(&calls, &CancellationToken::new()).await;

        assert!(!outcome.cancelled);
        assert!(outcome.is_complete(2));
        assert_eq!(
            outcome.results[0].error,
            Some(ToolError::Execution {
                message: "tool task panicked".into()
            })
        );
        assert!(outcome.results[1].error.is_none());
    }
}
