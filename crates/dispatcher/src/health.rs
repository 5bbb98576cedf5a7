//! 健康检查器
//!
//! 周期性对每个已知后端执行 `/queue` 探测，推进健康状态机并刷新
//! pending/running 快照。后端跌入不健康时，其上已分发但未终止的任务
//! 被重新入队（额度耗尽则失败），恢复健康时向分发器发容量信号。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use balancer_backend::BackendApi;
use balancer_config::{HealthCheckConfig, QueueConfig};
use balancer_domain::BackendStatus;

use crate::clients::BackendClients;
use crate::dispatcher::Dispatcher;
use crate::registry::BackendRegistry;
use crate::task_store::{LossOutcome, TaskStore};

pub struct HealthMonitor {
    registry: Arc<BackendRegistry>,
    store: Arc<TaskStore>,
    clients: Arc<BackendClients>,
    dispatcher: Arc<Dispatcher>,
    config: HealthCheckConfig,
    queue_config: QueueConfig,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<BackendRegistry>,
        store: Arc<TaskStore>,
        clients: Arc<BackendClients>,
        dispatcher: Arc<Dispatcher>,
        config: HealthCheckConfig,
        queue_config: QueueConfig,
    ) -> Self {
        Self {
            registry,
            store,
            clients,
            dispatcher,
            config,
            queue_config,
        }
    }

    /// 检查循环
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("健康检查已启动，间隔: {}秒", self.config.interval);
        let mut ticker = interval(self.config.interval_duration());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => self.check_all().await,
            }
        }
        info!("健康检查已停止");
    }

    /// 并发探测所有已知后端；管理API的立即触发也走这里
    pub async fn check_all(&self) {
        let snapshot = self.registry.snapshot().await;
        if snapshot.is_empty() {
            return;
        }

        let probes = snapshot.iter().map(|b| self.probe(b.name.clone()));
        futures_util::future::join_all(probes).await;
    }

    /// 探测单个后端并处理状态迁移
    pub async fn probe(&self, name: String) {
        let Some(client) = self.clients.get(&name).await else {
            return;
        };

        let counts = match client.query_queue().await {
            Ok(snapshot) => Some((snapshot.pending(), snapshot.running())),
            Err(e) => {
                debug!("探测后端 {} 失败: {}", name, e);
                None
            }
        };

        let edge = self
            .registry
            .record_probe(
                &name,
                counts,
                self.config.healthy_threshold,
                self.config.unhealthy_threshold,
            )
            .await;

        match edge {
            Some((_, BackendStatus::Healthy)) => {
                // 容量恢复，唤醒分发循环
                self.dispatcher.signal_capacity();
            }
            Some((_, BackendStatus::Unhealthy)) => {
                self.requeue_lost_tasks(&name).await;
            }
            _ => {}
        }
    }

    /// 后端失联：重新入队其上所有已分发且未终止的任务
    async fn requeue_lost_tasks(&self, backend: &str) {
        let tasks = self.store.active_for_backend(backend).await;
        if tasks.is_empty() {
            return;
        }

        warn!("后端 {} 失联，重新入队 {} 个任务", backend, tasks.len());
        let mut requeued = 0usize;
        for task in tasks {
            // dispatching中的任务由提交结果自行落定
            if task.state != balancer_domain::TaskState::Dispatched {
                continue;
            }
            match self
                .store
                .requeue_for_loss(
                    &task.id,
                    self.queue_config.max_retries,
                    &format!("后端失联: {backend}"),
                )
                .await
            {
                Ok(LossOutcome::Requeued) => requeued += 1,
                Ok(LossOutcome::Failed) => {}
                Err(e) => debug!("重新入队任务 {} 跳过: {}", task.id, e),
            }
        }

        if requeued > 0 {
            self.dispatcher.signal_pending();
        }
    }
}
