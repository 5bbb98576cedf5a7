//! 调度策略实现
//!
//! 策略只在给定的候选列表上做选择，候选的筛选（健康、启用、容量）由
//! 调度器完成。候选列表保持注册表的插入顺序。

use std::sync::atomic::{AtomicUsize, Ordering};

use balancer_domain::BackendState;

pub trait DispatchStrategy: Send + Sync {
    /// 在候选中选择一个后端，返回其名称
    fn select(&self, candidates: &[BackendState]) -> Option<String>;

    fn name(&self) -> &'static str;
}

/// 最少忙碌：总占用最小者优先。并列时权重高者胜，再按插入顺序。
pub struct LeastBusyStrategy;

impl DispatchStrategy for LeastBusyStrategy {
    fn select(&self, candidates: &[BackendState]) -> Option<String> {
        candidates
            .iter()
            .enumerate()
            .min_by(|(ia, a), (ib, b)| {
                a.total_load()
                    .cmp(&b.total_load())
                    .then(b.weight.cmp(&a.weight))
                    .then(ia.cmp(ib))
            })
            .map(|(_, backend)| backend.name.clone())
    }

    fn name(&self) -> &'static str {
        "least_busy"
    }
}

/// 轮询：按插入顺序旋转，从上次选中的位置继续
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchStrategy for RoundRobinStrategy {
    fn select(&self, candidates: &[BackendState]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[index].name.clone())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// 加权：总占用除以权重，最小者优先。并列裁决同最少忙碌。
pub struct WeightedStrategy;

impl DispatchStrategy for WeightedStrategy {
    fn select(&self, candidates: &[BackendState]) -> Option<String> {
        fn score(backend: &BackendState) -> f64 {
            backend.total_load() as f64 / backend.weight.max(1) as f64
        }

        candidates
            .iter()
            .enumerate()
            .min_by(|(ia, a), (ib, b)| {
                score(a)
                    .partial_cmp(&score(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.weight.cmp(&a.weight))
                    .then(ia.cmp(ib))
            })
            .map(|(_, backend)| backend.name.clone())
    }

    fn name(&self) -> &'static str {
        "weighted"
    }
}
