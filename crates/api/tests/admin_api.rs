//! 管理面与ComfyUI兼容面的路由集成测试

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use balancer_api::{create_routes, AppState};
use balancer_backend::{BackendApi, ClientFactory, QueueSnapshot, RawResponse, SubmitResponse};
use balancer_config::AppConfig;
use balancer_dispatcher::{
    BackendClients, BackendRegistry, Dispatcher, EventBus, EventHub, HealthMonitor, Scheduler,
    TaskStore,
};
use balancer_domain::Strategy;

struct AcceptingBackend {
    name: String,
    counter: AtomicU64,
}

#[async_trait]
impl BackendApi for AcceptingBackend {
    async fn submit(
        &self,
        _payload: &Value,
        _client_id: Option<&str>,
        _extra: Option<&Value>,
    ) -> balancer_errors::BalancerResult<SubmitResponse> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SubmitResponse {
            prompt_id: format!("{}-p{}", self.name, n),
            number: n as i64,
        })
    }

    async fn query_queue(&self) -> balancer_errors::BalancerResult<QueueSnapshot> {
        Ok(QueueSnapshot::default())
    }

    async fn query_history(
        &self,
        _prompt_id: Option<&str>,
    ) -> balancer_errors::BalancerResult<Value> {
        Ok(json!({}))
    }

    async fn cancel(&self, _prompt_id: &str) -> balancer_errors::BalancerResult<()> {
        Ok(())
    }

    async fn fetch_raw(
        &self,
        _path_and_query: &str,
    ) -> balancer_errors::BalancerResult<RawResponse> {
        Ok(RawResponse {
            status: 200,
            content_type: Some("application/json".to_string()),
            body: b"{}".to_vec(),
        })
    }
}

struct AcceptingFactory;

impl ClientFactory for AcceptingFactory {
    fn make(
        &self,
        name: &str,
        _base_url: &str,
    ) -> balancer_errors::BalancerResult<Arc<dyn BackendApi>> {
        Ok(Arc::new(AcceptingBackend {
            name: name.to_string(),
            counter: AtomicU64::new(0),
        }))
    }
}

fn test_state(mut config: AppConfig) -> AppState {
    // 阻塞等待在测试里保持短暂
    config.queue.submit_timeout = 0.05;
    config.queue.retry_interval = 0.01;
    let config = Arc::new(config);

    let events = Arc::new(EventBus::new(1024));
    let registry = Arc::new(BackendRegistry::new(events.clone()));
    let store = Arc::new(TaskStore::new(config.queue.max_size, events.clone()));
    let scheduler = Arc::new(Scheduler::new(Strategy::LeastBusy, true));
    let clients = Arc::new(BackendClients::new(Arc::new(AcceptingFactory)));
    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        store.clone(),
        scheduler.clone(),
        clients.clone(),
        config.queue.clone(),
        "bridge-api-test".to_string(),
    ));
    let health = Arc::new(HealthMonitor::new(
        registry.clone(),
        store.clone(),
        clients.clone(),
        dispatcher.clone(),
        config.health_check.clone(),
        config.queue.clone(),
    ));
    let hub = Arc::new(EventHub::new(
        store.clone(),
        events.clone(),
        "bridge-api-test".to_string(),
    ));

    AppState {
        config,
        registry,
        store,
        scheduler,
        dispatcher,
        health,
        hub,
        events,
        clients,
    }
}

fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    match body {
        Some(value) => builder.body(Body::from(value.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn lb_stats_snapshot() {
    let state = test_state(AppConfig::default());
    let app = create_routes(state.clone());

    state
        .dispatcher
        .add_backend(&balancer_config::BackendConfig {
            name: "comfy-1".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8188,
            weight: 1,
            max_queue: 5,
            enabled: true,
        })
        .await
        .unwrap();

    let response = app
        .oneshot(request("GET", "/lb/stats", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["total_backends"], 1);
    assert_eq!(body["data"]["healthy_backends"], 0);
    assert_eq!(body["data"]["backends"][0]["name"], "comfy-1");
}

#[tokio::test]
async fn add_backend_then_conflict() {
    let state = test_state(AppConfig::default());
    let app = create_routes(state);

    let config = json!({ "name": "comfy-1", "host": "127.0.0.1", "port": 8188 });
    let response = app
        .clone()
        .oneshot(request("POST", "/lb/backends", Some(config.clone())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .clone()
        .oneshot(request("POST", "/lb/backends", Some(config)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let body = body_json(response).await;
    assert_eq!(body["error"]["kind"], "name_conflict");
}

#[tokio::test]
async fn add_backend_rejects_invalid_config() {
    let state = test_state(AppConfig::default());
    let app = create_routes(state);

    let config = json!({ "name": "bad", "port": 8188, "weight": 0 });
    let response = app
        .oneshot(request("POST", "/lb/backends", Some(config)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn strategy_switch_and_validation() {
    let state = test_state(AppConfig::default());
    let app = create_routes(state.clone());

    let response = app
        .clone()
        .oneshot(request("POST", "/lb/scheduler/strategy/weighted", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(state.scheduler.strategy().await, Strategy::Weighted);

    let response = app
        .clone()
        .oneshot(request("POST", "/lb/scheduler/strategy/random", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(request("GET", "/lb/scheduler", None))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["data"]["strategy"], "weighted");
}

#[tokio::test]
async fn prompt_queue_full_returns_503() {
    let mut config = AppConfig::default();
    config.queue.max_size = 2;
    let state = test_state(config);
    let app = create_routes(state);

    // 没有后端：前两个任务停在pending，第三个触发队列满
    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(request("POST", "/prompt", Some(json!({ "prompt": {} }))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    let response = app
        .oneshot(request("POST", "/prompt", Some(json!({ "prompt": {} }))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body = body_json(response).await;
    assert_eq!(body["error"]["kind"], "queue_full");
}

#[tokio::test]
async fn prompt_without_payload_is_rejected() {
    let state = test_state(AppConfig::default());
    let app = create_routes(state);

    let response = app
        .oneshot(request("POST", "/prompt", Some(json!({ "client_id": "x" }))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn queue_view_shows_pending_tasks() {
    let state = test_state(AppConfig::default());
    let app = create_routes(state.clone());

    let task = state
        .dispatcher
        .submit_task(json!({ "1": { "class_type": "KSampler" } }), None, None)
        .await
        .unwrap();

    let response = app.oneshot(request("GET", "/queue", None)).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["queue_pending"].as_array().unwrap().len(), 1);
    assert_eq!(body["queue_pending"][0][1], task.id);
    assert_eq!(body["queue_running"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn cancel_task_via_admin_api() {
    let state = test_state(AppConfig::default());
    let app = create_routes(state.clone());

    let task = state
        .dispatcher
        .submit_task(json!({}), None, None)
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(request("DELETE", &format!("/lb/tasks/{}", task.id), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // 重复取消幂等
    let response = app
        .clone()
        .oneshot(request("DELETE", &format!("/lb/tasks/{}", task.id), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // 未知任务 404
    let response = app
        .oneshot(request("DELETE", "/lb/tasks/unknown", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn task_detail_and_listing() {
    let state = test_state(AppConfig::default());
    let app = create_routes(state.clone());

    let task = state
        .dispatcher
        .submit_task(json!({}), Some("client-a".to_string()), None)
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(request("GET", &format!("/lb/tasks/{}", task.id), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["id"], task.id);
    assert_eq!(body["data"]["state"], "pending");

    let response = app.oneshot(request("GET", "/lb/tasks", None)).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn passthrough_requires_healthy_backend() {
    let state = test_state(AppConfig::default());
    let app = create_routes(state);

    let response = app
        .oneshot(request("GET", "/object_info", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn health_endpoint() {
    let state = test_state(AppConfig::default());
    let app = create_routes(state);

    let response = app.oneshot(request("GET", "/health", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}
