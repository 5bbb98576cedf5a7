//! 任务分发器
//!
//! 将等待中的任务与后端容量撮合：FIFO取任务、调度器选后端、原子预留、
//! 提交、失败重试与耗尽裁决。完成路径（上游终止事件与历史轮询兜底）和
//! 取消也汇聚在这里。
//!
//! 预留与任务迁移的顺序固定为 注册表 → 任务存储：预留成功但任务已被
//! 取消时回滚预留，不存在反向持锁。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use balancer_backend::BackendApi;
use balancer_config::{BackendConfig, QueueConfig};
use balancer_domain::{BackendState, Task};
use balancer_errors::{BalancerError, BalancerResult};

use crate::clients::BackendClients;
use crate::registry::BackendRegistry;
use crate::scheduler::Scheduler;
use crate::task_store::{CancelOutcome, SubmitRetry, TaskStore};

/// 单步分发的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    /// 没有等待中的任务
    Idle,
    /// 没有可用容量，任务已放回队列头部
    NoCapacity,
    /// 任务成功提交到后端
    Dispatched,
    /// 任务以其他方式了结（失败、已取消、等待重试）
    Settled,
}

pub struct Dispatcher {
    registry: Arc<BackendRegistry>,
    store: Arc<TaskStore>,
    scheduler: Arc<Scheduler>,
    clients: Arc<BackendClients>,
    queue_config: QueueConfig,
    pending: Arc<Notify>,
    capacity: Arc<Notify>,
    /// 上游提交与WS订阅共用的桥接身份，保证事件回流到均衡器
    bridge_id: String,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<BackendRegistry>,
        store: Arc<TaskStore>,
        scheduler: Arc<Scheduler>,
        clients: Arc<BackendClients>,
        queue_config: QueueConfig,
        bridge_id: String,
    ) -> Self {
        Self {
            registry,
            store,
            scheduler,
            clients,
            queue_config,
            pending: Arc::new(Notify::new()),
            capacity: Arc::new(Notify::new()),
            bridge_id,
        }
    }

    pub fn bridge_id(&self) -> &str {
        &self.bridge_id
    }

    /// 接收新任务并唤醒分发循环
    pub async fn submit_task(
        &self,
        payload: serde_json::Value,
        client_id: Option<String>,
        extra: Option<serde_json::Value>,
    ) -> BalancerResult<Task> {
        let task = self.store.create(payload, client_id, extra).await?;
        self.pending.notify_one();
        Ok(task)
    }

    /// 容量可能增加时唤醒分发循环（后端恢复、启用、新增等）
    pub fn signal_capacity(&self) {
        self.capacity.notify_waiters();
    }

    /// 任务进入pending时唤醒分发循环（重新入队等）
    pub fn signal_pending(&self) {
        self.pending.notify_one();
    }

    /// 分发循环
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("任务分发循环已启动");
        loop {
            match self.pump().await {
                PumpOutcome::Idle => {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = self.pending.notified() => {}
                    }
                }
                PumpOutcome::NoCapacity => {
                    // 等待容量信号，重试间隔作为兜底轮询
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = self.capacity.notified() => {}
                        _ = sleep(self.queue_config.retry_interval_duration()) => {}
                    }
                }
                PumpOutcome::Dispatched | PumpOutcome::Settled => {}
            }
        }
        info!("任务分发循环已退出");
    }

    /// 单步分发：取队首任务并尝试派发。
    /// 循环之外也可直接驱动，测试依赖这一点。
    pub async fn pump(&self) -> PumpOutcome {
        let Some(task) = self.store.pop_next().await else {
            return PumpOutcome::Idle;
        };

        let snapshot = self.registry.snapshot().await;
        let backend = match self.scheduler.select(&snapshot).await {
            Ok(name) => name,
            Err(BalancerError::NoCapacity) => {
                self.store.reinsert(&task).await;
                return PumpOutcome::NoCapacity;
            }
            Err(e) => {
                error!("调度器选择失败: {}", e);
                self.store.reinsert(&task).await;
                return PumpOutcome::NoCapacity;
            }
        };

        // 预留容量；快照可能已经陈旧，失败时等待下一轮
        if self.registry.try_reserve(&backend).await.is_err() {
            self.store.reinsert(&task).await;
            return PumpOutcome::NoCapacity;
        }

        if let Err(e) = self.store.mark_dispatching(&task.id, &backend).await {
            // 弹出与预留之间任务被取消
            self.registry.release_reservation(&backend).await;
            debug!("任务 {} 不再等待分发，跳过: {}", task.id, e);
            return PumpOutcome::Settled;
        }

        let Some(client) = self.clients.get(&backend).await else {
            // 后端刚被移除，按瞬时失败处理
            self.registry.release_reservation(&backend).await;
            self.handle_submit_failure(&task, "后端客户端不存在").await;
            return PumpOutcome::Settled;
        };

        match client
            .submit(&task.payload, Some(&self.bridge_id), task.extra.as_ref())
            .await
        {
            Ok(response) => {
                match self
                    .store
                    .mark_dispatched(&task.id, &backend, &response.prompt_id)
                    .await
                {
                    Ok(dispatched) => {
                        self.registry.confirm_dispatch(&backend).await;
                        info!(
                            "任务已分发: {} -> {} (prompt_id: {})",
                            dispatched.id, backend, response.prompt_id
                        );
                        PumpOutcome::Dispatched
                    }
                    Err(e) => {
                        // 提交窗口内任务被取消：尽力撤销上游任务
                        self.registry.release_reservation(&backend).await;
                        warn!(
                            "任务 {} 在提交期间离开dispatching状态({})，撤销上游任务",
                            task.id, e
                        );
                        let prompt_id = response.prompt_id.clone();
                        tokio::spawn(async move {
                            let _ = client.cancel(&prompt_id).await;
                        });
                        self.capacity.notify_waiters();
                        PumpOutcome::Settled
                    }
                }
            }
            Err(BalancerError::SubmitRejected(message)) => {
                self.registry.release_reservation(&backend).await;
                warn!("后端 {} 拒绝任务 {}: {}", backend, task.id, message);
                if let Err(e) = self.store.fail(&task.id, "submit_rejected", &message).await {
                    error!("标记任务 {} 失败时出错: {}", task.id, e);
                }
                self.capacity.notify_waiters();
                PumpOutcome::Settled
            }
            Err(e) => {
                self.registry.release_reservation(&backend).await;
                warn!("提交任务 {} 到后端 {} 失败: {}", task.id, backend, e);
                self.handle_submit_failure(&task, &e.to_string()).await;
                self.capacity.notify_waiters();
                PumpOutcome::Settled
            }
        }
    }

    /// 瞬时提交失败：计一次尝试，额度内安排延迟重试
    async fn handle_submit_failure(&self, task: &Task, error: &str) {
        match self
            .store
            .note_submit_failure(&task.id, error, self.queue_config.max_retries)
            .await
        {
            Ok(SubmitRetry::Retry { attempts }) => {
                info!("任务 {} 将重试，第{}次尝试失败: {}", task.id, attempts, error);
                let store = self.store.clone();
                let pending = self.pending.clone();
                let delay = self.queue_config.retry_interval_duration();
                let id = task.id.clone();
                tokio::spawn(async move {
                    sleep(delay).await;
                    match store.back_to_pending(&id).await {
                        Ok(()) => pending.notify_one(),
                        // 等待期间任务被取消是正常情况
                        Err(e) => debug!("重试回队跳过: {}: {}", id, e),
                    }
                });
            }
            Ok(SubmitRetry::Exhausted) => {}
            Err(e) => debug!("提交失败记录跳过: {}: {}", task.id, e),
        }
    }

    /// 上游终止事件的统一完成路径。重复事件是无操作。
    pub async fn complete_upstream(
        &self,
        backend: &str,
        prompt_id: &str,
        success: bool,
        error: Option<String>,
    ) {
        if let Some(_task) = self
            .store
            .complete_by_upstream(backend, prompt_id, success, error)
            .await
        {
            self.registry.release_slot(backend).await;
            self.capacity.notify_waiters();
        }
    }

    /// 取消任务。已分发的任务尽力撤销上游，之后到达的终止事件被丢弃。
    pub async fn cancel_task(&self, id: &str) -> BalancerResult<()> {
        match self.store.cancel(id).await? {
            CancelOutcome::AlreadyTerminal => Ok(()),
            CancelOutcome::WasPending | CancelOutcome::WasDispatching { .. } => {
                self.capacity.notify_waiters();
                Ok(())
            }
            CancelOutcome::WasDispatched { backend, prompt_id } => {
                if let Some(client) = self.clients.get(&backend).await {
                    tokio::spawn(async move {
                        if let Err(e) = client.cancel(&prompt_id).await {
                            warn!("撤销上游任务失败: {}", e);
                        }
                    });
                }
                self.registry.release_slot(&backend).await;
                self.capacity.notify_waiters();
                Ok(())
            }
        }
    }

    /// 历史轮询兜底：上游WS断开期间由这里驱动任务完成。
    /// 只轮询分发已超过两个周期的任务，避免与实时事件抢跑。
    pub async fn run_completion_poller(
        &self,
        poll_interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => self.poll_completions(poll_interval * 2).await,
            }
        }
    }

    async fn poll_completions(&self, min_age: Duration) {
        for (task_id, backend, prompt_id) in self.store.dispatched_older_than(min_age).await {
            let Some(client) = self.clients.get(&backend).await else {
                continue;
            };
            match client.query_history(Some(&prompt_id)).await {
                Ok(history) => {
                    // 历史中出现条目即代表执行已结束
                    let Some(entry) = history.get(&prompt_id) else {
                        continue;
                    };
                    let status_str = entry
                        .pointer("/status/status_str")
                        .and_then(|v| v.as_str());
                    let success = status_str.map(|s| s != "error").unwrap_or(true);
                    let error = if success {
                        None
                    } else {
                        Some(format!("后端历史状态: {}", status_str.unwrap_or("error")))
                    };
                    debug!("历史轮询完成任务: {} ({})", task_id, prompt_id);
                    self.complete_upstream(&backend, &prompt_id, success, error)
                        .await;
                }
                Err(e) => {
                    debug!("轮询任务 {} 历史失败: {}", task_id, e);
                }
            }
        }
    }

    /// 新增后端：注册、建客户端、唤醒分发
    pub async fn add_backend(&self, config: &BackendConfig) -> BalancerResult<BackendState> {
        let state = self.registry.register(config).await?;
        self.clients
            .insert(&state.name, &state.base_url())
            .await?;
        self.capacity.notify_waiters();
        Ok(state)
    }

    /// 移除后端：要求已禁用且已排空
    pub async fn remove_backend(&self, name: &str) -> BalancerResult<()> {
        let backend = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| BalancerError::backend_not_found(name))?;
        if backend.enabled {
            return Err(BalancerError::backend_busy(name));
        }
        if !self.store.active_for_backend(name).await.is_empty() {
            return Err(BalancerError::backend_busy(name));
        }

        self.registry.remove(name).await?;
        self.clients.remove(name).await;
        Ok(())
    }

    /// 停机：等待dispatching任务落定，已分发任务原样保留
    pub async fn drain(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        while self.store.dispatching_count().await > 0 {
            if Instant::now() >= deadline {
                warn!(
                    "停机宽限期结束，仍有 {} 个任务处于dispatching",
                    self.store.dispatching_count().await
                );
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }
    }
}
