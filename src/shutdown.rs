//! 优雅关闭管理

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tracing::{debug, info};

/// 停机信号的发布者。所有长生命周期循环各持一个订阅，
/// 信号只会发出一次。
pub struct ShutdownManager {
    tx: broadcast::Sender<()>,
    fired: AtomicBool,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            tx,
            fired: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// 触发关闭；重复调用是无操作
    pub fn shutdown(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            debug!("关闭信号已触发过");
            return;
        }
        info!("触发系统关闭，通知 {} 个订阅者", self.tx.receiver_count());
        let _ = self.tx.send(());
    }

    pub fn is_shutdown(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
