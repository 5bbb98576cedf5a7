//! 应用装配
//!
//! 把各子系统组装为一个显式的 [`Application`] 值：配置后端、启动全部
//! 长生命周期循环、对外提供HTTP/WS服务，停机时按 停止接收 -> 等待
//! dispatching落定 -> 停止订阅 的顺序收尾。

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};
use uuid::Uuid;

use balancer_api::{create_routes, AppState};
use balancer_backend::HttpClientFactory;
use balancer_config::AppConfig;
use balancer_dispatcher::{
    collect_stats, BackendClients, BackendRegistry, Dispatcher, EventBus, EventHub, HealthMonitor,
    Scheduler, TaskStore,
};

use crate::shutdown::ShutdownManager;

/// stats_update 的合并节奏
const STATS_COALESCE_INTERVAL: Duration = Duration::from_millis(200);
/// 停机时等待dispatching任务落定的宽限期
const DRAIN_GRACE: Duration = Duration::from_secs(5);

pub struct Application {
    state: AppState,
}

impl Application {
    /// 组装全部子系统并注册配置文件中的后端
    pub async fn new(config: AppConfig) -> Result<Self> {
        let config = Arc::new(config);

        let events = Arc::new(EventBus::default());
        let registry = Arc::new(BackendRegistry::new(events.clone()));
        let store = Arc::new(TaskStore::new(config.queue.max_size, events.clone()));
        let scheduler = Arc::new(
            Scheduler::from_config(&config.scheduler.strategy, config.scheduler.prefer_idle)
                .context("调度器初始化失败")?,
        );
        let factory = Arc::new(HttpClientFactory::new(
            config.health_check.timeout_duration(),
        ));
        let clients = Arc::new(BackendClients::new(factory));

        // 上游提交与WS订阅共用的桥接身份
        let bridge_id = Uuid::new_v4().to_string();
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            store.clone(),
            scheduler.clone(),
            clients.clone(),
            config.queue.clone(),
            bridge_id.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            registry.clone(),
            store.clone(),
            clients.clone(),
            dispatcher.clone(),
            config.health_check.clone(),
            config.queue.clone(),
        ));
        let hub = Arc::new(EventHub::new(store.clone(), events.clone(), bridge_id));

        // 注册配置的后端并建立事件订阅；禁用的后端也保持订阅以便排空
        for backend_config in &config.backends {
            let state = dispatcher
                .add_backend(backend_config)
                .await
                .with_context(|| format!("注册后端失败: {}", backend_config.name))?;
            hub.watch_backend(&state.name, &state.ws_url()).await;
        }

        Ok(Self {
            state: AppState {
                config,
                registry,
                store,
                scheduler,
                dispatcher,
                health,
                hub,
                events,
                clients,
            },
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.state.config
    }

    /// 绑定监听地址；失败由调用方映射为退出码2
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let addr = format!(
            "{}:{}",
            self.state.config.server.host, self.state.config.server.port
        );
        TcpListener::bind(&addr).await
    }

    /// 启动全部循环并服务HTTP，直到停机信号
    pub async fn run(&self, listener: TcpListener, shutdown: Arc<ShutdownManager>) -> Result<()> {
        let state = &self.state;

        {
            let health = state.health.clone();
            let rx = shutdown.subscribe();
            tokio::spawn(async move { health.run(rx).await });
        }
        {
            let dispatcher = state.dispatcher.clone();
            let rx = shutdown.subscribe();
            tokio::spawn(async move { dispatcher.run(rx).await });
        }
        {
            let dispatcher = state.dispatcher.clone();
            let poll_interval = state.config.health_check.interval_duration();
            let rx = shutdown.subscribe();
            tokio::spawn(async move { dispatcher.run_completion_poller(poll_interval, rx).await });
        }
        {
            let hub = state.hub.clone();
            let dispatcher = state.dispatcher.clone();
            let rx = shutdown.subscribe();
            tokio::spawn(async move { hub.run(dispatcher, rx).await });
        }
        {
            let events = state.events.clone();
            let registry = state.registry.clone();
            let store = state.store.clone();
            let mut rx = shutdown.subscribe();
            tokio::spawn(async move {
                let mut ticker = interval(STATS_COALESCE_INTERVAL);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = rx.recv() => break,
                        _ = ticker.tick() => {
                            if events.take_stats_dirty() {
                                let stats = collect_stats(&registry, &store).await;
                                events.publish_stats(stats);
                            }
                        }
                    }
                }
            });
        }

        // 启动后立即做一轮健康检查，后端尽快可用
        state.health.check_all().await;

        info!("==================================================");
        info!("ComfyUI 负载均衡器已启动");
        info!(
            "监听地址: {}:{}",
            state.config.server.host, state.config.server.port
        );
        info!("后端数量: {}", state.config.backends.len());
        info!("调度策略: {}", state.config.scheduler.strategy);
        info!("==================================================");

        let router = create_routes(state.clone());
        let mut rx = shutdown.subscribe();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = rx.recv().await;
            })
            .await
            .context("HTTP服务异常退出")?;

        // 收尾：停止接收，等待提交中的任务落定，已分发任务原样保留
        state.store.close().await;
        state.dispatcher.drain(DRAIN_GRACE).await;
        state.hub.shutdown_readers().await;

        let remaining = state.store.queue_status().await;
        if remaining.dispatched > 0 {
            warn!(
                "停机时仍有 {} 个已分发任务，重启后将被报告为丢失",
                remaining.dispatched
            );
        }
        info!("ComfyUI 负载均衡器已停止");
        Ok(())
    }
}
