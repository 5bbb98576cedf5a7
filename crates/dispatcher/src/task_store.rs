//! 任务存储
//!
//! 在途任务的唯一归属地，维护两个索引：`task_id -> Task` 与
//! `(backend, upstream_prompt_id) -> task_id`，以及按 `(created_at, task_id)`
//! 排序的FIFO等待队列。所有状态迁移在这里按状态机校验，非法迁移返回
//! `InvalidTransition` 并保持任务不变。终止迁移幂等：对已终止任务的重复
//! 终止事件是无操作。

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use balancer_domain::{ManagementEvent, QueueStatus, Task, TaskState, TaskSummary};
use balancer_errors::{BalancerError, BalancerResult};

use crate::events::EventBus;

/// 终态任务保留数量，供 /history 与任务详情查询
const HISTORY_LIMIT: usize = 1000;

/// 取消操作的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// 任务尚未分发，直接取消
    WasPending,
    /// 任务正在提交，提交结果将被丢弃
    WasDispatching { backend: Option<String> },
    /// 任务已提交到后端，需要尽力撤销上游任务
    WasDispatched { backend: String, prompt_id: String },
    /// 任务已处于终态，取消是无操作
    AlreadyTerminal,
}

/// 提交失败后的重试裁决
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitRetry {
    /// 还有重试额度，延迟后回到pending
    Retry { attempts: u32 },
    /// 额度耗尽，任务已标记失败
    Exhausted,
}

/// 后端失联后的重新入队裁决
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LossOutcome {
    Requeued,
    Failed,
}

struct StoreInner {
    tasks: HashMap<String, Task>,
    by_upstream: HashMap<(String, String), String>,
    waitlist: BTreeSet<(DateTime<Utc>, String)>,
    history: VecDeque<String>,
    live: usize,
    counter: u64,
    closed: bool,
}

impl StoreInner {
    /// 将任务迁移到终态，维护索引、等待队列与历史
    fn finalize(
        &mut self,
        id: &str,
        state: TaskState,
        error_kind: Option<&str>,
        error: Option<String>,
    ) -> BalancerResult<Task> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| BalancerError::task_not_found(id))?;

        if !task.state.can_transition_to(state) {
            return Err(BalancerError::invalid_transition(
                task.state.as_str(),
                state.as_str(),
            ));
        }

        self.waitlist.remove(&(task.created_at, task.id.clone()));
        if let (Some(backend), Some(prompt_id)) =
            (task.assigned_backend.clone(), task.upstream_prompt_id.clone())
        {
            self.by_upstream.remove(&(backend, prompt_id));
        }

        task.state = state;
        task.completed_at = Some(Utc::now());
        task.error_kind = error_kind.map(str::to_string);
        if error.is_some() {
            task.last_error = error;
        }

        self.live = self.live.saturating_sub(1);
        self.history.push_back(id.to_string());
        let snapshot = task.clone();

        while self.history.len() > HISTORY_LIMIT {
            if let Some(old) = self.history.pop_front() {
                self.tasks.remove(&old);
            }
        }

        Ok(snapshot)
    }

    fn queue_status(&self) -> QueueStatus {
        let mut status = QueueStatus::default();
        for task in self.tasks.values() {
            match task.state {
                TaskState::Pending => status.pending += 1,
                TaskState::Dispatching => status.dispatching += 1,
                TaskState::Dispatched => status.dispatched += 1,
                _ => {}
            }
        }
        status.total = status.pending + status.dispatching + status.dispatched;
        status
    }
}

pub struct TaskStore {
    inner: Mutex<StoreInner>,
    max_size: usize,
    events: Arc<EventBus>,
}

impl TaskStore {
    pub fn new(max_size: usize, events: Arc<EventBus>) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                tasks: HashMap::new(),
                by_upstream: HashMap::new(),
                waitlist: BTreeSet::new(),
                history: VecDeque::new(),
                live: 0,
                counter: 0,
                closed: false,
            }),
            max_size,
            events,
        }
    }

    /// 接收一个新任务入队
    pub async fn create(
        &self,
        payload: serde_json::Value,
        client_id: Option<String>,
        extra: Option<serde_json::Value>,
    ) -> BalancerResult<Task> {
        let mut inner = self.inner.lock().await;
        if inner.closed || inner.live >= self.max_size {
            return Err(BalancerError::QueueFull {
                capacity: self.max_size,
            });
        }

        inner.counter += 1;
        let task = Task::new(inner.counter, payload, client_id, extra);
        inner
            .waitlist
            .insert((task.created_at, task.id.clone()));
        inner.tasks.insert(task.id.clone(), task.clone());
        inner.live += 1;
        let queue = inner.queue_status();
        drop(inner);

        info!("任务入队: {} (等待: {})", task.id, queue.pending);
        self.events
            .publish(ManagementEvent::TaskUpdate(TaskSummary::from(&task)));
        self.events.publish(ManagementEvent::QueueUpdate(queue));
        Ok(task)
    }

    /// 取出等待队列头部的任务。队列中的陈旧条目（已取消等）被跳过。
    pub async fn pop_next(&self) -> Option<Task> {
        let mut inner = self.inner.lock().await;
        while let Some((created_at, id)) = inner.waitlist.pop_first() {
            match inner.tasks.get(&id) {
                Some(task) if task.state == TaskState::Pending => {
                    debug_assert_eq!(task.created_at, created_at);
                    return Some(task.clone());
                }
                _ => continue,
            }
        }
        None
    }

    /// 无可用容量时把任务放回队列头部（保留原始created_at）
    pub async fn reinsert(&self, task: &Task) {
        let mut inner = self.inner.lock().await;
        if inner
            .tasks
            .get(&task.id)
            .map(|t| t.state == TaskState::Pending)
            .unwrap_or(false)
        {
            inner.waitlist.insert((task.created_at, task.id.clone()));
        }
    }

    /// pending -> dispatching，同时记下目标后端
    pub async fn mark_dispatching(&self, id: &str, backend: &str) -> BalancerResult<()> {
        let mut inner = self.inner.lock().await;
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| BalancerError::task_not_found(id))?;

        if !task.state.can_transition_to(TaskState::Dispatching) {
            return Err(BalancerError::invalid_transition(
                task.state.as_str(),
                TaskState::Dispatching.as_str(),
            ));
        }
        task.state = TaskState::Dispatching;
        task.assigned_backend = Some(backend.to_string());
        let summary = TaskSummary::from(&*task);
        drop(inner);

        self.events.publish(ManagementEvent::TaskUpdate(summary));
        Ok(())
    }

    /// dispatching -> dispatched，登记 (backend, upstream_prompt_id) 索引。
    /// 该索引对在途任务唯一；冲突说明上游复用了prompt_id，按内部错误处理。
    pub async fn mark_dispatched(
        &self,
        id: &str,
        backend: &str,
        prompt_id: &str,
    ) -> BalancerResult<Task> {
        let mut inner = self.inner.lock().await;

        let key = (backend.to_string(), prompt_id.to_string());
        if let Some(existing) = inner.by_upstream.get(&key) {
            if existing != id {
                return Err(BalancerError::internal(format!(
                    "上游prompt_id冲突: {backend}/{prompt_id} 已属于任务 {existing}"
                )));
            }
        }

        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| BalancerError::task_not_found(id))?;

        if !task.state.can_transition_to(TaskState::Dispatched) {
            return Err(BalancerError::invalid_transition(
                task.state.as_str(),
                TaskState::Dispatched.as_str(),
            ));
        }
        task.state = TaskState::Dispatched;
        task.assigned_backend = Some(backend.to_string());
        task.upstream_prompt_id = Some(prompt_id.to_string());
        task.dispatched_at = Some(Utc::now());
        let snapshot = task.clone();
        inner.by_upstream.insert(key, id.to_string());
        let queue = inner.queue_status();
        drop(inner);

        self.events
            .publish(ManagementEvent::TaskUpdate(TaskSummary::from(&snapshot)));
        self.events.publish(ManagementEvent::QueueUpdate(queue));
        Ok(snapshot)
    }

    /// 提交瞬时失败：计一次尝试，裁决重试或耗尽。
    /// 重试时任务暂留dispatching，延迟到期后由 [`back_to_pending`] 放回队列。
    ///
    /// [`back_to_pending`]: TaskStore::back_to_pending
    pub async fn note_submit_failure(
        &self,
        id: &str,
        error: &str,
        max_retries: u32,
    ) -> BalancerResult<SubmitRetry> {
        let mut inner = self.inner.lock().await;
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| BalancerError::task_not_found(id))?;

        if task.state != TaskState::Dispatching {
            return Err(BalancerError::invalid_transition(
                task.state.as_str(),
                TaskState::Pending.as_str(),
            ));
        }

        task.attempts += 1;
        task.last_error = Some(error.to_string());
        let attempts = task.attempts;

        if attempts < max_retries {
            let summary = TaskSummary::from(&*task);
            drop(inner);
            self.events.publish(ManagementEvent::TaskUpdate(summary));
            return Ok(SubmitRetry::Retry { attempts });
        }

        let snapshot = inner.finalize(
            id,
            TaskState::Failed,
            Some("submit_exhausted"),
            Some(error.to_string()),
        )?;
        let queue = inner.queue_status();
        drop(inner);

        error!("任务失败: {}, 已重试{}次: {}", id, attempts, error);
        self.events
            .publish(ManagementEvent::TaskUpdate(TaskSummary::from(&snapshot)));
        self.events.publish(ManagementEvent::QueueUpdate(queue));
        Ok(SubmitRetry::Exhausted)
    }

    /// 重试延迟到期：dispatching -> pending，按原始created_at回到队列
    pub async fn back_to_pending(&self, id: &str) -> BalancerResult<()> {
        let mut inner = self.inner.lock().await;
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| BalancerError::task_not_found(id))?;

        if !task.state.can_transition_to(TaskState::Pending) {
            return Err(BalancerError::invalid_transition(
                task.state.as_str(),
                TaskState::Pending.as_str(),
            ));
        }
        task.state = TaskState::Pending;
        task.assigned_backend = None;
        task.upstream_prompt_id = None;
        let key = (task.created_at, task.id.clone());
        let summary = TaskSummary::from(&*task);
        inner.waitlist.insert(key);
        drop(inner);

        self.events.publish(ManagementEvent::TaskUpdate(summary));
        Ok(())
    }

    /// 后端失联：dispatched任务重新入队或标记失败
    pub async fn requeue_for_loss(
        &self,
        id: &str,
        max_retries: u32,
        error: &str,
    ) -> BalancerResult<LossOutcome> {
        let mut inner = self.inner.lock().await;
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| BalancerError::task_not_found(id))?;

        if task.state != TaskState::Dispatched {
            return Err(BalancerError::invalid_transition(
                task.state.as_str(),
                TaskState::Pending.as_str(),
            ));
        }

        task.attempts += 1;
        task.last_error = Some(error.to_string());

        if task.attempts < max_retries {
            let index_key = (task.assigned_backend.take(), task.upstream_prompt_id.take());
            task.state = TaskState::Pending;
            task.dispatched_at = None;
            let key = (task.created_at, task.id.clone());
            let summary = TaskSummary::from(&*task);
            if let (Some(backend), Some(prompt_id)) = index_key {
                inner.by_upstream.remove(&(backend, prompt_id));
            }
            inner.waitlist.insert(key);
            let queue = inner.queue_status();
            drop(inner);

            warn!("任务重新入队: {} ({})", id, error);
            self.events.publish(ManagementEvent::TaskUpdate(summary));
            self.events.publish(ManagementEvent::QueueUpdate(queue));
            return Ok(LossOutcome::Requeued);
        }

        let snapshot = inner.finalize(
            id,
            TaskState::Failed,
            Some("backend_lost"),
            Some(error.to_string()),
        )?;
        let queue = inner.queue_status();
        drop(inner);

        error!("任务失败: {}, 后端失联且重试额度耗尽", id);
        self.events
            .publish(ManagementEvent::TaskUpdate(TaskSummary::from(&snapshot)));
        self.events.publish(ManagementEvent::QueueUpdate(queue));
        Ok(LossOutcome::Failed)
    }

    /// 提交被拒绝等不可重试错误：任务直接失败
    pub async fn fail(
        &self,
        id: &str,
        error_kind: &str,
        error: &str,
    ) -> BalancerResult<Task> {
        let mut inner = self.inner.lock().await;
        let snapshot = inner.finalize(
            id,
            TaskState::Failed,
            Some(error_kind),
            Some(error.to_string()),
        )?;
        let queue = inner.queue_status();
        drop(inner);

        error!("任务失败: {} ({}): {}", id, error_kind, error);
        self.events
            .publish(ManagementEvent::TaskUpdate(TaskSummary::from(&snapshot)));
        self.events.publish(ManagementEvent::QueueUpdate(queue));
        Ok(snapshot)
    }

    /// 上游终止事件：按 (backend, prompt_id) 完成任务。
    /// 索引查不到（任务已取消或已终止）时返回 `None`，事件被丢弃。
    pub async fn complete_by_upstream(
        &self,
        backend: &str,
        prompt_id: &str,
        success: bool,
        error: Option<String>,
    ) -> Option<Task> {
        let mut inner = self.inner.lock().await;
        let key = (backend.to_string(), prompt_id.to_string());
        let id = inner.by_upstream.get(&key)?.clone();

        let state = if success {
            TaskState::Completed
        } else {
            TaskState::Failed
        };
        let error_kind = if success { None } else { Some("execution_error") };

        let snapshot = match inner.finalize(&id, state, error_kind, error) {
            Ok(task) => task,
            Err(e) => {
                // 并发终止事件：任务刚刚进入终态，按无操作处理
                warn!("丢弃重复的终止事件: {}/{}: {}", backend, prompt_id, e);
                return None;
            }
        };
        let queue = inner.queue_status();
        drop(inner);

        info!(
            "任务完成: {} ({})",
            snapshot.id,
            if success { "成功" } else { "失败" }
        );
        self.events
            .publish(ManagementEvent::TaskUpdate(TaskSummary::from(&snapshot)));
        self.events.publish(ManagementEvent::QueueUpdate(queue));
        Some(snapshot)
    }

    /// 取消任务。对终态任务幂等。
    pub async fn cancel(&self, id: &str) -> BalancerResult<CancelOutcome> {
        let mut inner = self.inner.lock().await;
        let task = inner
            .tasks
            .get(id)
            .ok_or_else(|| BalancerError::task_not_found(id))?;

        let outcome = match task.state {
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled => {
                return Ok(CancelOutcome::AlreadyTerminal)
            }
            TaskState::Pending => CancelOutcome::WasPending,
            TaskState::Dispatching => CancelOutcome::WasDispatching {
                backend: task.assigned_backend.clone(),
            },
            TaskState::Dispatched => CancelOutcome::WasDispatched {
                backend: task.assigned_backend.clone().unwrap_or_default(),
                prompt_id: task.upstream_prompt_id.clone().unwrap_or_default(),
            },
        };

        let snapshot = inner.finalize(id, TaskState::Cancelled, None, None)?;
        let queue = inner.queue_status();
        drop(inner);

        info!("任务已取消: {}", id);
        self.events
            .publish(ManagementEvent::TaskUpdate(TaskSummary::from(&snapshot)));
        self.events.publish(ManagementEvent::QueueUpdate(queue));
        Ok(outcome)
    }

    pub async fn get(&self, id: &str) -> Option<Task> {
        self.inner.lock().await.tasks.get(id).cloned()
    }

    /// 按上游prompt_id查找任务（含终态任务），/history 路由使用
    pub async fn find_by_prompt_id(&self, prompt_id: &str) -> Option<Task> {
        let inner = self.inner.lock().await;
        inner
            .tasks
            .values()
            .find(|t| t.upstream_prompt_id.as_deref() == Some(prompt_id))
            .cloned()
    }

    pub async fn by_upstream(&self, backend: &str, prompt_id: &str) -> Option<Task> {
        let inner = self.inner.lock().await;
        let id = inner
            .by_upstream
            .get(&(backend.to_string(), prompt_id.to_string()))?;
        inner.tasks.get(id).cloned()
    }

    /// 全部在途任务加上最近的终态任务
    pub async fn list(&self) -> Vec<Task> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<Task> = inner.tasks.values().filter(|t| t.is_live()).cloned().collect();
        tasks.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

        let recent: Vec<Task> = inner
            .history
            .iter()
            .rev()
            .take(100)
            .filter_map(|id| inner.tasks.get(id).cloned())
            .collect();
        tasks.extend(recent);
        tasks
    }

    /// 指定后端上的在途任务（dispatching/dispatched）
    pub async fn active_for_backend(&self, backend: &str) -> Vec<Task> {
        let inner = self.inner.lock().await;
        inner
            .tasks
            .values()
            .filter(|t| {
                matches!(t.state, TaskState::Dispatching | TaskState::Dispatched)
                    && t.assigned_backend.as_deref() == Some(backend)
            })
            .cloned()
            .collect()
    }

    /// 分发已久、适合历史轮询兜底的任务
    pub async fn dispatched_older_than(&self, age: Duration) -> Vec<(String, String, String)> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::seconds(10));
        let inner = self.inner.lock().await;
        inner
            .tasks
            .values()
            .filter(|t| {
                t.state == TaskState::Dispatched
                    && t.dispatched_at.map(|at| at < cutoff).unwrap_or(false)
            })
            .filter_map(|t| {
                Some((
                    t.id.clone(),
                    t.assigned_backend.clone()?,
                    t.upstream_prompt_id.clone()?,
                ))
            })
            .collect()
    }

    pub async fn queue_status(&self) -> QueueStatus {
        self.inner.lock().await.queue_status()
    }

    pub async fn live_count(&self) -> usize {
        self.inner.lock().await.live
    }

    pub async fn dispatching_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Dispatching)
            .count()
    }

    /// 停机：不再接收新任务
    pub async fn close(&self) {
        self.inner.lock().await.closed = true;
        info!("任务存储已关闭，不再接收新任务");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(max_size: usize) -> TaskStore {
        TaskStore::new(max_size, Arc::new(EventBus::new(256)))
    }

    #[tokio::test]
    async fn test_create_and_queue_full() {
        let store = store(2);
        store.create(json!({}), None, None).await.unwrap();
        store.create(json!({}), None, None).await.unwrap();

        let err = store.create(json!({}), None, None).await.unwrap_err();
        assert_eq!(err.kind(), "queue_full");
    }

    #[tokio::test]
    async fn test_resubmit_yields_distinct_ids() {
        let store = store(10);
        let payload = json!({"1": {"class_type": "KSampler"}});
        let t1 = store.create(payload.clone(), None, None).await.unwrap();
        let t2 = store.create(payload, None, None).await.unwrap();
        assert_ne!(t1.id, t2.id);
        assert_eq!(t1.number + 1, t2.number);
    }

    #[tokio::test]
    async fn test_fifo_pop_order() {
        let store = store(10);
        let t1 = store.create(json!({}), None, None).await.unwrap();
        let t2 = store.create(json!({}), None, None).await.unwrap();
        let t3 = store.create(json!({}), None, None).await.unwrap();

        assert_eq!(store.pop_next().await.unwrap().id, t1.id);
        assert_eq!(store.pop_next().await.unwrap().id, t2.id);
        assert_eq!(store.pop_next().await.unwrap().id, t3.id);
        assert!(store.pop_next().await.is_none());
    }

    #[tokio::test]
    async fn test_reinsert_preserves_head_position() {
        let store = store(10);
        let t1 = store.create(json!({}), None, None).await.unwrap();
        let _t2 = store.create(json!({}), None, None).await.unwrap();

        let popped = store.pop_next().await.unwrap();
        assert_eq!(popped.id, t1.id);
        store.reinsert(&popped).await;
        // 重新插入后仍在队列头部
        assert_eq!(store.pop_next().await.unwrap().id, t1.id);
    }

    #[tokio::test]
    async fn test_dispatch_lifecycle() {
        let store = store(10);
        let task = store.create(json!({}), None, None).await.unwrap();

        store.mark_dispatching(&task.id, "comfy-1").await.unwrap();
        let dispatched = store
            .mark_dispatched(&task.id, "comfy-1", "p-1")
            .await
            .unwrap();
        assert_eq!(dispatched.state, TaskState::Dispatched);
        assert_eq!(dispatched.upstream_prompt_id.as_deref(), Some("p-1"));

        let found = store.by_upstream("comfy-1", "p-1").await.unwrap();
        assert_eq!(found.id, task.id);

        let done = store
            .complete_by_upstream("comfy-1", "p-1", true, None)
            .await
            .unwrap();
        assert_eq!(done.state, TaskState::Completed);

        // 终止迁移幂等：重复事件被丢弃
        assert!(store
            .complete_by_upstream("comfy-1", "p-1", true, None)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_upstream_index_uniqueness() {
        let store = store(10);
        let t1 = store.create(json!({}), None, None).await.unwrap();
        let t2 = store.create(json!({}), None, None).await.unwrap();

        store.mark_dispatching(&t1.id, "comfy-1").await.unwrap();
        store.mark_dispatched(&t1.id, "comfy-1", "p-1").await.unwrap();

        store.mark_dispatching(&t2.id, "comfy-1").await.unwrap();
        let err = store
            .mark_dispatched(&t2.id, "comfy-1", "p-1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "internal");
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let store = store(10);
        let task = store.create(json!({}), None, None).await.unwrap();

        // pending 不能直接到 dispatched
        let err = store
            .mark_dispatched(&task.id, "comfy-1", "p-1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_transition");
        // 任务保持原状
        assert_eq!(store.get(&task.id).await.unwrap().state, TaskState::Pending);
    }

    #[tokio::test]
    async fn test_submit_failure_retry_then_exhausted() {
        let store = store(10);
        let task = store.create(json!({}), None, None).await.unwrap();

        store.mark_dispatching(&task.id, "comfy-1").await.unwrap();
        let outcome = store
            .note_submit_failure(&task.id, "连接被拒绝", 2)
            .await
            .unwrap();
        assert_eq!(outcome, SubmitRetry::Retry { attempts: 1 });

        store.back_to_pending(&task.id).await.unwrap();
        let again = store.pop_next().await.unwrap();
        assert_eq!(again.id, task.id);
        // 重新入队保留原始created_at
        assert_eq!(again.created_at, task.created_at);

        store.mark_dispatching(&task.id, "comfy-2").await.unwrap();
        let outcome = store
            .note_submit_failure(&task.id, "连接被拒绝", 2)
            .await
            .unwrap();
        assert_eq!(outcome, SubmitRetry::Exhausted);

        let failed = store.get(&task.id).await.unwrap();
        assert_eq!(failed.state, TaskState::Failed);
        assert_eq!(failed.error_kind.as_deref(), Some("submit_exhausted"));
        assert_eq!(failed.attempts, 2);
    }

    #[tokio::test]
    async fn test_requeue_for_loss() {
        let store = store(10);
        let task = store.create(json!({}), None, None).await.unwrap();
        store.mark_dispatching(&task.id, "comfy-1").await.unwrap();
        store.mark_dispatched(&task.id, "comfy-1", "p-1").await.unwrap();

        let outcome = store
            .requeue_for_loss(&task.id, 3, "后端失联: comfy-1")
            .await
            .unwrap();
        assert_eq!(outcome, LossOutcome::Requeued);

        let requeued = store.get(&task.id).await.unwrap();
        assert_eq!(requeued.state, TaskState::Pending);
        assert!(requeued.assigned_backend.is_none());
        assert!(requeued.upstream_prompt_id.is_none());
        // 旧索引被清理，之后的终止事件将被丢弃
        assert!(store.by_upstream("comfy-1", "p-1").await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_pending_and_idempotence() {
        let store = store(10);
        let task = store.create(json!({}), None, None).await.unwrap();

        let outcome = store.cancel(&task.id).await.unwrap();
        assert_eq!(outcome, CancelOutcome::WasPending);
        assert!(store.pop_next().await.is_none());

        // 终态任务取消是无操作且返回成功
        let outcome = store.cancel(&task.id).await.unwrap();
        assert_eq!(outcome, CancelOutcome::AlreadyTerminal);
    }

    #[tokio::test]
    async fn test_cancel_dispatched_discards_later_events() {
        let store = store(10);
        let task = store.create(json!({}), None, None).await.unwrap();
        store.mark_dispatching(&task.id, "comfy-1").await.unwrap();
        store.mark_dispatched(&task.id, "comfy-1", "p-9").await.unwrap();

        let outcome = store.cancel(&task.id).await.unwrap();
        assert_eq!(
            outcome,
            CancelOutcome::WasDispatched {
                backend: "comfy-1".to_string(),
                prompt_id: "p-9".to_string()
            }
        );

        // 之后到达的终止事件查不到任务，被丢弃
        assert!(store
            .complete_by_upstream("comfy-1", "p-9", true, None)
            .await
            .is_none());
        assert_eq!(
            store.get(&task.id).await.unwrap().state,
            TaskState::Cancelled
        );
    }

    #[tokio::test]
    async fn test_queue_status_counts() {
        let store = store(10);
        let t1 = store.create(json!({}), None, None).await.unwrap();
        let _t2 = store.create(json!({}), None, None).await.unwrap();
        store.mark_dispatching(&t1.id, "comfy-1").await.unwrap();
        store.mark_dispatched(&t1.id, "comfy-1", "p-1").await.unwrap();

        let status = store.queue_status().await;
        assert_eq!(status.pending, 1);
        assert_eq!(status.dispatched, 1);
        assert_eq!(status.total, 2);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_new_tasks() {
        let store = store(10);
        store.close().await;
        assert!(store.create(json!({}), None, None).await.is_err());
    }
}
