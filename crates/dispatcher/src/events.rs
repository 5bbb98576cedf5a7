//! 管理事件总线
//!
//! 所有可变操作通过这里对外发布 `backend_update` / `queue_update` /
//! `task_update` 事件。`stats_update` 不直接发布：任何事件都会置脏标记，
//! 由聚合循环以至多200ms一次的节奏合并推送。

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

use balancer_domain::{ManagementEvent, SystemStats};

pub struct EventBus {
    tx: broadcast::Sender<ManagementEvent>,
    stats_dirty: AtomicBool,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            stats_dirty: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagementEvent> {
        self.tx.subscribe()
    }

    /// 发布一条事件并置脏统计标记。没有订阅者时发送失败是正常情况。
    pub fn publish(&self, event: ManagementEvent) {
        self.stats_dirty.store(true, Ordering::Relaxed);
        let _ = self.tx.send(event);
    }

    /// 取走脏标记，聚合循环据此决定是否推送 stats_update
    pub fn take_stats_dirty(&self) -> bool {
        self.stats_dirty.swap(false, Ordering::Relaxed)
    }

    /// 推送合并后的统计快照，不再置脏
    pub fn publish_stats(&self, stats: SystemStats) {
        let _ = self.tx.send(ManagementEvent::StatsUpdate(stats));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
