//! 中断处理：向任务投递协作式取消信号
//!
//! 每个任务注册一个 CancellationToken（根令牌的子令牌）；signal_stop 只设置标志，
//! TaskController 在循环边界与工具分发时观察它，不会抢占进行中的模型调用。
//! 进程级信号（Ctrl+C / SIGTERM）通过根令牌停止所有任务。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::core::TaskId;

/// 取消令牌管理器
#[derive(Default)]
pub struct InterruptHandler {
    root: CancellationToken,
    tokens: RwLock<HashMap<TaskId, CancellationToken>>,
}

impl InterruptHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为任务注册令牌；重复注册返回已有令牌
    pub async fn register(&self, task_id: TaskId) -> CancellationToken {
        let mut tokens = self.tokens.write().await;
        tokens
            .entry(task_id)
            .or_insert_with(|| self.root.child_token())
            .clone()
    }

    pub async fn token(&self, task_id: TaskId) -> Option<CancellationToken> {
        self.tokens.read().await.get(&task_id).cloned()
    }

    /// 设置任务的取消标志（幂等）；任务未注册时返回 false
    pub async fn signal_stop(&self, task_id: TaskId) -> bool {
        match self.tokens.read().await.get(&task_id) {
            Some(token) => {
                if !token.is_cancelled() {
                    tracing::info!(task_id = %task_id, "stop signalled");
                }
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// 停止所有任务（含之后注册的任务）
    pub fn signal_all(&self) {
        self.root.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }

    /// 任务结束后移除令牌
    pub async fn release(&self, task_id: TaskId) {
        self.tokens.write().await.remove(&task_id);
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, stopping running tasks...");
                handler.signal_all();
            }
        });

        #[cfg(unix)]
        {
            let handler = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, stopping running tasks...");
                    handler.signal_all();
                }
            });
        }
    }
}
