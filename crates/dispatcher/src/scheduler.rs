//! 调度器
//!
//! 基于注册表快照的纯选择器，自身不持有任何后端状态。
//! 策略可在运行时切换，下一次选择立即生效。

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use balancer_domain::{BackendState, Strategy};
use balancer_errors::{BalancerError, BalancerResult};

use crate::strategies::{
    DispatchStrategy, LeastBusyStrategy, RoundRobinStrategy, WeightedStrategy,
};

fn make_strategy(strategy: Strategy) -> Arc<dyn DispatchStrategy> {
    match strategy {
        Strategy::LeastBusy => Arc::new(LeastBusyStrategy),
        Strategy::RoundRobin => Arc::new(RoundRobinStrategy::new()),
        Strategy::Weighted => Arc::new(WeightedStrategy),
    }
}

pub struct Scheduler {
    current: RwLock<(Strategy, Arc<dyn DispatchStrategy>)>,
    prefer_idle: AtomicBool,
}

impl Scheduler {
    pub fn new(strategy: Strategy, prefer_idle: bool) -> Self {
        Self {
            current: RwLock::new((strategy, make_strategy(strategy))),
            prefer_idle: AtomicBool::new(prefer_idle),
        }
    }

    /// 从配置字符串构建
    pub fn from_config(strategy: &str, prefer_idle: bool) -> BalancerResult<Self> {
        Ok(Self::new(Strategy::from_str(strategy)?, prefer_idle))
    }

    /// 在快照中为等待任务选择一个后端
    pub async fn select(&self, snapshot: &[BackendState]) -> BalancerResult<String> {
        let candidates: Vec<BackendState> = snapshot
            .iter()
            .filter(|b| b.is_available())
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Err(BalancerError::NoCapacity);
        }

        // prefer_idle: 存在完全空闲的候选时，只在该子集内应用策略
        let pool: Vec<BackendState> = if self.prefer_idle.load(Ordering::Relaxed) {
            let idle: Vec<BackendState> = candidates
                .iter()
                .filter(|b| b.pending + b.running == 0)
                .cloned()
                .collect();
            if idle.is_empty() {
                candidates
            } else {
                idle
            }
        } else {
            candidates
        };

        let strategy = self.current.read().await.1.clone();
        strategy.select(&pool).ok_or(BalancerError::NoCapacity)
    }

    /// 运行时切换策略，下一次选择生效
    pub async fn set_strategy(&self, strategy: Strategy) {
        let mut current = self.current.write().await;
        *current = (strategy, make_strategy(strategy));
        info!("调度策略已切换为: {}", strategy.as_str());
    }

    pub async fn strategy(&self) -> Strategy {
        self.current.read().await.0
    }

    pub fn prefer_idle(&self) -> bool {
        self.prefer_idle.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use balancer_domain::BackendStatus;

    fn backend(name: &str, status: BackendStatus, load: usize, max_queue: usize) -> BackendState {
        BackendState {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port: 8188,
            weight: 1,
            max_queue,
            enabled: true,
            status,
            consecutive_ok: 0,
            consecutive_fail: 0,
            pending: load,
            running: 0,
            reserved: 0,
            last_probe_at: None,
        }
    }

    #[tokio::test]
    async fn test_no_candidates_is_no_capacity() {
        let scheduler = Scheduler::new(Strategy::LeastBusy, true);

        let err = scheduler.select(&[]).await.unwrap_err();
        assert_eq!(err.kind(), "no_capacity");

        // 不健康或容量占满的后端不是候选
        let snapshot = vec![
            backend("a", BackendStatus::Unhealthy, 0, 5),
            backend("b", BackendStatus::Healthy, 5, 5),
        ];
        assert!(scheduler.select(&snapshot).await.is_err());
    }

    #[tokio::test]
    async fn test_prefer_idle_restricts_pool() {
        let scheduler = Scheduler::new(Strategy::LeastBusy, true);
        // b 有1个在途但容量足够；c 完全空闲
        let snapshot = vec![
            backend("b", BackendStatus::Healthy, 1, 5),
            backend("c", BackendStatus::Healthy, 0, 5),
        ];
        assert_eq!(scheduler.select(&snapshot).await.unwrap(), "c");
    }

    #[tokio::test]
    async fn test_prefer_idle_disabled_uses_strategy_only() {
        let scheduler = Scheduler::new(Strategy::LeastBusy, false);
        let mut b = backend("b", BackendStatus::Healthy, 0, 5);
        b.weight = 5;
        let snapshot = vec![b, backend("c", BackendStatus::Healthy, 0, 5)];
        // 同负载下权重高者胜
        assert_eq!(scheduler.select(&snapshot).await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_strategy_switch_takes_effect() {
        let scheduler = Scheduler::new(Strategy::LeastBusy, false);
        assert_eq!(scheduler.strategy().await, Strategy::LeastBusy);

        scheduler.set_strategy(Strategy::RoundRobin).await;
        assert_eq!(scheduler.strategy().await, Strategy::RoundRobin);

        let snapshot = vec![
            backend("a", BackendStatus::Healthy, 0, 5),
            backend("b", BackendStatus::Healthy, 0, 5),
        ];
        let first = scheduler.select(&snapshot).await.unwrap();
        let second = scheduler.select(&snapshot).await.unwrap();
        assert_ne!(first, second);
    }
}
