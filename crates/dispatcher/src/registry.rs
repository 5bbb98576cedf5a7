//! 后端注册表
//!
//! 后端记录的唯一归属地。内部以插入顺序保存（轮询与并列裁决依赖该顺序）。
//! 预留判定（容量读取 + reserved 递增）在同一把锁内完成；涉及任务存储时
//! 锁顺序固定为 注册表 → 任务存储。

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use balancer_config::BackendConfig;
use balancer_domain::{BackendState, BackendStatus, ManagementEvent};
use balancer_errors::{BalancerError, BalancerResult};

use crate::events::EventBus;

pub struct BackendRegistry {
    inner: RwLock<Vec<BackendState>>,
    events: Arc<EventBus>,
}

impl BackendRegistry {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            inner: RwLock::new(Vec::new()),
            events,
        }
    }

    /// 注册后端，名称冲突时拒绝
    pub async fn register(&self, config: &BackendConfig) -> BalancerResult<BackendState> {
        let mut backends = self.inner.write().await;
        if backends.iter().any(|b| b.name == config.name) {
            return Err(BalancerError::name_conflict(&config.name));
        }

        let state = BackendState {
            name: config.name.clone(),
            host: config.host.clone(),
            port: config.port,
            weight: config.weight,
            max_queue: config.max_queue,
            enabled: config.enabled,
            status: BackendStatus::Unknown,
            consecutive_ok: 0,
            consecutive_fail: 0,
            pending: 0,
            running: 0,
            reserved: 0,
            last_probe_at: None,
        };
        backends.push(state.clone());
        drop(backends);

        info!("注册后端: {} ({})", state.name, state.base_url());
        self.events
            .publish(ManagementEvent::BackendUpdate(state.clone()));
        Ok(state)
    }

    /// 注销后端。仅允许移除已禁用的后端；在途任务由调用方检查。
    pub async fn remove(&self, name: &str) -> BalancerResult<BackendState> {
        let mut backends = self.inner.write().await;
        let index = backends
            .iter()
            .position(|b| b.name == name)
            .ok_or_else(|| BalancerError::backend_not_found(name))?;
        if backends[index].enabled {
            return Err(BalancerError::backend_busy(name));
        }

        let removed = backends.remove(index);
        drop(backends);

        info!("注销后端: {}", name);
        self.events
            .publish(ManagementEvent::BackendUpdate(removed.clone()));
        Ok(removed)
    }

    pub async fn enable(&self, name: &str) -> BalancerResult<BackendState> {
        self.set_enabled(name, true).await
    }

    /// 禁用后立即停止新的预留，在途任务继续排空
    pub async fn disable(&self, name: &str) -> BalancerResult<BackendState> {
        self.set_enabled(name, false).await
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> BalancerResult<BackendState> {
        let mut backends = self.inner.write().await;
        let backend = backends
            .iter_mut()
            .find(|b| b.name == name)
            .ok_or_else(|| BalancerError::backend_not_found(name))?;
        backend.enabled = enabled;
        let state = backend.clone();
        drop(backends);

        info!("{}后端: {}", if enabled { "启用" } else { "禁用" }, name);
        self.events
            .publish(ManagementEvent::BackendUpdate(state.clone()));
        Ok(state)
    }

    pub async fn get(&self, name: &str) -> Option<BackendState> {
        self.inner
            .read()
            .await
            .iter()
            .find(|b| b.name == name)
            .cloned()
    }

    /// 按插入顺序的一致性快照
    pub async fn snapshot(&self) -> Vec<BackendState> {
        self.inner.read().await.clone()
    }

    /// 预留一个槽位。容量读取与 reserved 递增在同一临界区内，
    /// 保证任何时刻 reserved + pending + running <= max_queue。
    pub async fn try_reserve(&self, name: &str) -> BalancerResult<()> {
        let mut backends = self.inner.write().await;
        let backend = backends
            .iter_mut()
            .find(|b| b.name == name)
            .ok_or_else(|| BalancerError::backend_not_found(name))?;

        if !backend.is_available() {
            debug!("后端 {} 无可用容量，预留失败", name);
            return Err(BalancerError::NoCapacity);
        }
        backend.reserved += 1;
        Ok(())
    }

    /// 提交失败或任务被取消时释放预留
    pub async fn release_reservation(&self, name: &str) {
        let mut backends = self.inner.write().await;
        if let Some(backend) = backends.iter_mut().find(|b| b.name == name) {
            backend.reserved = backend.reserved.saturating_sub(1);
        }
    }

    /// 提交成功：预留转为本地pending计数，待健康检查以真实快照校准
    pub async fn confirm_dispatch(&self, name: &str) {
        let mut backends = self.inner.write().await;
        if let Some(backend) = backends.iter_mut().find(|b| b.name == name) {
            backend.reserved = backend.reserved.saturating_sub(1);
            backend.pending += 1;
        }
    }

    /// 任务终止：归还一个占用的槽位
    pub async fn release_slot(&self, name: &str) {
        let mut backends = self.inner.write().await;
        if let Some(backend) = backends.iter_mut().find(|b| b.name == name) {
            if backend.running > 0 {
                backend.running -= 1;
            } else {
                backend.pending = backend.pending.saturating_sub(1);
            }
        }
    }

    /// 记录一次探测结果并推进健康状态机。
    /// 返回发生的状态迁移 `(旧, 新)`，无迁移时为 `None`。
    pub async fn record_probe(
        &self,
        name: &str,
        queue_counts: Option<(usize, usize)>,
        healthy_threshold: u32,
        unhealthy_threshold: u32,
    ) -> Option<(BackendStatus, BackendStatus)> {
        let mut backends = self.inner.write().await;
        let backend = backends.iter_mut().find(|b| b.name == name)?;

        let old_status = backend.status;
        backend.last_probe_at = Some(Utc::now());

        match queue_counts {
            Some((pending, running)) => {
                backend.pending = pending;
                backend.running = running;
                backend.consecutive_ok += 1;
                backend.consecutive_fail = 0;
                if backend.consecutive_ok >= healthy_threshold {
                    backend.status = BackendStatus::Healthy;
                }
            }
            None => {
                backend.consecutive_fail += 1;
                backend.consecutive_ok = 0;
                if backend.consecutive_fail >= unhealthy_threshold {
                    backend.status = BackendStatus::Unhealthy;
                }
            }
        }

        let new_status = backend.status;
        let state = backend.clone();
        drop(backends);

        if old_status != new_status {
            match new_status {
                BackendStatus::Healthy => info!("后端恢复健康: {}", name),
                BackendStatus::Unhealthy => warn!("后端不健康: {}", name),
                BackendStatus::Unknown => {}
            }
            self.events.publish(ManagementEvent::BackendUpdate(state));
            return Some((old_status, new_status));
        }
        None
    }

    /// 是否存在可接收任务的后端
    pub async fn has_available(&self) -> bool {
        self.inner.read().await.iter().any(|b| b.is_available())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::backend_config;

    fn registry() -> BackendRegistry {
        BackendRegistry::new(Arc::new(EventBus::new(64)))
    }

    #[tokio::test]
    async fn test_register_and_conflict() {
        let registry = registry();
        registry.register(&backend_config("comfy-1", 2)).await.unwrap();

        let err = registry
            .register(&backend_config("comfy-1", 2))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "name_conflict");
        assert_eq!(registry.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_insertion_order_preserved() {
        let registry = registry();
        for name in ["c", "a", "b"] {
            registry.register(&backend_config(name, 1)).await.unwrap();
        }
        let names: Vec<String> = registry
            .snapshot()
            .await
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_reserve_enforces_capacity() {
        let registry = registry();
        registry.register(&backend_config("comfy-1", 2)).await.unwrap();
        // 未探测前状态unknown，不可预留
        assert!(registry.try_reserve("comfy-1").await.is_err());

        registry.record_probe("comfy-1", Some((0, 0)), 1, 3).await;
        registry.try_reserve("comfy-1").await.unwrap();
        registry.try_reserve("comfy-1").await.unwrap();
        // 容量2已满
        let err = registry.try_reserve("comfy-1").await.unwrap_err();
        assert_eq!(err.kind(), "no_capacity");

        let b = registry.get("comfy-1").await.unwrap();
        assert_eq!(b.reserved, 2);
        assert!(b.total_load() <= b.max_queue);
    }

    #[tokio::test]
    async fn test_reserve_counts_backend_queue() {
        let registry = registry();
        registry.register(&backend_config("comfy-1", 2)).await.unwrap();
        // 后端自身已有1个pending
        registry.record_probe("comfy-1", Some((1, 0)), 1, 3).await;

        registry.try_reserve("comfy-1").await.unwrap();
        assert!(registry.try_reserve("comfy-1").await.is_err());
    }

    #[tokio::test]
    async fn test_disable_blocks_reservation() {
        let registry = registry();
        registry.register(&backend_config("comfy-1", 2)).await.unwrap();
        registry.record_probe("comfy-1", Some((0, 0)), 1, 3).await;
        registry.disable("comfy-1").await.unwrap();

        assert!(registry.try_reserve("comfy-1").await.is_err());
        assert!(!registry.has_available().await);
    }

    #[tokio::test]
    async fn test_remove_requires_disabled() {
        let registry = registry();
        registry.register(&backend_config("comfy-1", 2)).await.unwrap();

        let err = registry.remove("comfy-1").await.unwrap_err();
        assert_eq!(err.kind(), "backend_busy");

        registry.disable("comfy-1").await.unwrap();
        registry.remove("comfy-1").await.unwrap();
        assert!(registry.get("comfy-1").await.is_none());

        let err = registry.remove("comfy-1").await.unwrap_err();
        assert_eq!(err.kind(), "backend_not_found");
    }

    #[tokio::test]
    async fn test_probe_status_transitions() {
        let registry = registry();
        registry.register(&backend_config("comfy-1", 2)).await.unwrap();

        // unknown -> healthy 需要 healthy_threshold 次成功
        let edge = registry.record_probe("comfy-1", Some((0, 0)), 1, 3).await;
        assert_eq!(
            edge,
            Some((BackendStatus::Unknown, BackendStatus::Healthy))
        );

        // 两次失败不够 unhealthy_threshold=3
        registry.record_probe("comfy-1", None, 1, 3).await;
        let edge = registry.record_probe("comfy-1", None, 1, 3).await;
        assert!(edge.is_none());

        // 第三次失败触发迁移
        let edge = registry.record_probe("comfy-1", None, 1, 3).await;
        assert_eq!(
            edge,
            Some((BackendStatus::Healthy, BackendStatus::Unhealthy))
        );

        // 一次成功即恢复
        let edge = registry.record_probe("comfy-1", Some((0, 1)), 1, 3).await;
        assert_eq!(
            edge,
            Some((BackendStatus::Unhealthy, BackendStatus::Healthy))
        );
        let b = registry.get("comfy-1").await.unwrap();
        assert_eq!(b.running, 1);
    }

    #[tokio::test]
    async fn test_confirm_and_release_slot() {
        let registry = registry();
        registry.register(&backend_config("comfy-1", 4)).await.unwrap();
        registry.record_probe("comfy-1", Some((0, 0)), 1, 3).await;

        registry.try_reserve("comfy-1").await.unwrap();
        registry.confirm_dispatch("comfy-1").await;
        let b = registry.get("comfy-1").await.unwrap();
        assert_eq!(b.reserved, 0);
        assert_eq!(b.pending, 1);

        registry.release_slot("comfy-1").await;
        let b = registry.get("comfy-1").await.unwrap();
        assert_eq!(b.pending, 0);
        assert_eq!(b.running, 0);
    }
}
