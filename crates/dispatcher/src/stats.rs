//! 统计快照

use std::sync::Arc;

use balancer_domain::SystemStats;

use crate::registry::BackendRegistry;
use crate::task_store::TaskStore;

/// 采集一次一致的系统统计快照，管理API与stats_update聚合循环共用
pub async fn collect_stats(registry: &Arc<BackendRegistry>, store: &Arc<TaskStore>) -> SystemStats {
    let backends = registry.snapshot().await;
    let queue_status = store.queue_status().await;

    SystemStats {
        total_backends: backends.len(),
        healthy_backends: backends
            .iter()
            .filter(|b| b.status == balancer_domain::BackendStatus::Healthy && b.enabled)
            .count(),
        available_backends: backends.iter().filter(|b| b.is_available()).count(),
        idle_backends: backends.iter().filter(|b| b.is_idle()).count(),
        queue_status,
        backends,
    }
}
