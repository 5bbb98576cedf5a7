use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use balancer_config::AppConfig;
use balancer_dispatcher::{
    BackendClients, BackendRegistry, Dispatcher, EventBus, EventHub, HealthMonitor, Scheduler,
    TaskStore,
};

use crate::handlers::{
    admin::{
        add_backend, cancel_task, disable_backend, enable_backend, get_scheduler, get_task,
        lb_stats, list_backends, list_tasks, remove_backend, set_strategy, trigger_health_check,
    },
    proxy::{get_history, get_history_by_id, get_queue, health, manage_queue, proxy_read, submit_prompt},
    ws::{client_ws, management_ws},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<BackendRegistry>,
    pub store: Arc<TaskStore>,
    pub scheduler: Arc<Scheduler>,
    pub dispatcher: Arc<Dispatcher>,
    pub health: Arc<HealthMonitor>,
    pub hub: Arc<EventHub>,
    pub events: Arc<EventBus>,
    pub clients: Arc<BackendClients>,
}

pub fn create_routes(state: AppState) -> Router {
    Router::new()
        // ComfyUI 兼容面
        .route("/prompt", post(submit_prompt))
        .route("/queue", get(get_queue).post(manage_queue))
        .route("/history", get(get_history))
        .route("/history/{prompt_id}", get(get_history_by_id))
        .route("/object_info", get(proxy_read))
        .route("/object_info/{node_class}", get(proxy_read))
        .route("/system_stats", get(proxy_read))
        .route("/embeddings", get(proxy_read))
        .route("/extensions", get(proxy_read))
        .route("/view", get(proxy_read))
        .route("/ws", get(client_ws))
        .route("/health", get(health))
        // 管理面
        .route("/lb/stats", get(lb_stats))
        .route("/lb/backends", get(list_backends).post(add_backend))
        .route("/lb/backends/{name}", axum::routing::delete(remove_backend))
        .route("/lb/backends/{name}/enable", post(enable_backend))
        .route("/lb/backends/{name}/disable", post(disable_backend))
        .route("/lb/tasks", get(list_tasks))
        .route(
            "/lb/tasks/{task_id}",
            get(get_task).delete(cancel_task),
        )
        .route("/lb/health-check", post(trigger_health_check))
        .route("/lb/scheduler", get(get_scheduler))
        .route("/lb/scheduler/strategy/{strategy}", post(set_strategy))
        .route("/lb/ws", get(management_ws))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
