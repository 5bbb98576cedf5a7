//! ComfyUI 兼容端点
//!
//! 客户端沿用ComfyUI的HTTP协议：/prompt 提交在这里换成均衡器任务，
//! 响应里的 prompt_id 是内部task_id（事件中枢改写事件帧时保持同一映射），
//! 额外附带 task_id 与 upstream_prompt_id 字段。

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use axum::{
    body::Body,
    extract::{OriginalUri, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time::timeout_at;
use tracing::{debug, warn};

use balancer_backend::BackendApi;
use balancer_domain::{BackendStatus, ManagementEvent, Task, TaskState, TaskSummary};
use balancer_errors::BalancerError;

use crate::error::{ApiError, ApiResult};
use crate::routes::AppState;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// 提交prompt。响应阻塞到任务分发完成或 submit_timeout 到期；
/// 超时后返回202，任务继续排队。
pub async fn submit_prompt(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let Some(prompt) = body.get("prompt").cloned() else {
        return Err(ApiError::BadRequest("缺少 prompt 字段".to_string()));
    };
    let client_id = body
        .get("client_id")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let extra = body.get("extra_data").cloned();

    // 先订阅再入队，任务事件不会错过
    let mut events = state.events.subscribe();
    let task = state.dispatcher.submit_task(prompt, client_id, extra).await?;

    let deadline = tokio::time::Instant::now() + state.config.queue.submit_timeout_duration();
    loop {
        let update = match timeout_at(deadline, events.recv()).await {
            Err(_) => return Ok(accepted_response(&task)),
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                // 事件堆积，直接查询当前状态
                match state.store.get(&task.id).await {
                    Some(current) => TaskSummary::from(&current),
                    None => return Ok(accepted_response(&task)),
                }
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => {
                return Ok(accepted_response(&task))
            }
            Ok(Ok(ManagementEvent::TaskUpdate(summary))) if summary.id == task.id => summary,
            Ok(Ok(_)) => continue,
        };

        match update.state {
            TaskState::Dispatched => {
                return Ok(Json(json!({
                    "prompt_id": task.id,
                    "number": task.number,
                    "node_errors": {},
                    "task_id": task.id,
                    "upstream_prompt_id": update.upstream_prompt_id,
                }))
                .into_response());
            }
            TaskState::Failed => {
                // ComfyUI风格：200带错误载荷
                return Ok(Json(json!({
                    "prompt_id": task.id,
                    "number": task.number,
                    "node_errors": {},
                    "task_id": task.id,
                    "error": {
                        "type": update.error_kind.unwrap_or_else(|| "failed".to_string()),
                        "message": update.last_error.unwrap_or_default(),
                    },
                }))
                .into_response());
            }
            TaskState::Cancelled => {
                return Ok(Json(json!({
                    "prompt_id": task.id,
                    "number": task.number,
                    "node_errors": {},
                    "task_id": task.id,
                    "error": { "type": "cancelled", "message": "任务已取消" },
                }))
                .into_response());
            }
            _ => continue,
        }
    }
}

fn accepted_response(task: &Task) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "prompt_id": task.id,
            "number": task.number,
            "node_errors": {},
            "task_id": task.id,
        })),
    )
        .into_response()
}

fn comfy_queue_entry(task: &Task) -> Value {
    json!([
        task.number,
        task.id,
        task.payload,
        { "client_id": task.client_id }
    ])
}

/// 聚合视图：均衡器等待中的任务加上已分发的任务，ComfyUI格式
pub async fn get_queue(State(state): State<AppState>) -> Json<Value> {
    let mut queue_running = Vec::new();
    let mut queue_pending = Vec::new();

    for task in state.store.list().await {
        match task.state {
            TaskState::Dispatching | TaskState::Dispatched => {
                queue_running.push(comfy_queue_entry(&task))
            }
            TaskState::Pending => queue_pending.push(comfy_queue_entry(&task)),
            _ => {}
        }
    }

    Json(json!({
        "queue_running": queue_running,
        "queue_pending": queue_pending,
    }))
}

/// 队列管理：delete 取消指定任务，clear 清空等待中的任务
pub async fn manage_queue(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<StatusCode> {
    if let Some(ids) = body.get("delete").and_then(|v| v.as_array()) {
        for id in ids.iter().filter_map(|v| v.as_str()) {
            match state.dispatcher.cancel_task(id).await {
                Ok(()) => {}
                Err(BalancerError::TaskNotFound { .. }) => {
                    debug!("取消的任务不存在: {}", id);
                }
                Err(e) => warn!("取消任务 {} 失败: {}", id, e),
            }
        }
    }

    if body.get("clear").and_then(|v| v.as_bool()).unwrap_or(false) {
        for task in state.store.list().await {
            if task.state == TaskState::Pending {
                let _ = state.dispatcher.cancel_task(&task.id).await;
            }
        }
    }

    Ok(StatusCode::OK)
}

fn local_history_entry(task: &Task) -> Value {
    let success = task.state == TaskState::Completed;
    json!({
        "prompt": [task.number, task.id, task.payload, { "client_id": task.client_id }, []],
        "outputs": {},
        "status": {
            "status_str": if success { "success" } else { "error" },
            "completed": task.state.is_terminal(),
            "messages": task.last_error.as_ref().map(|e| vec![e.clone()]).unwrap_or_default(),
        }
    })
}

/// 本地终态任务的历史聚合
pub async fn get_history(State(state): State<AppState>) -> Json<Value> {
    let mut history = serde_json::Map::new();
    for task in state.store.list().await {
        if task.state.is_terminal() {
            history.insert(task.id.clone(), local_history_entry(&task));
        }
    }
    Json(Value::Object(history))
}

/// 单个任务的历史。任务仍在后端时代理到其归属后端，
/// 并把上游prompt_id映射回内部task_id。
pub async fn get_history_by_id(
    State(state): State<AppState>,
    Path(prompt_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let task = match state.store.get(&prompt_id).await {
        Some(task) => task,
        None => state
            .store
            .find_by_prompt_id(&prompt_id)
            .await
            .ok_or_else(|| ApiError::Balancer(BalancerError::task_not_found(&prompt_id)))?,
    };

    if let (Some(backend), Some(upstream_id)) =
        (task.assigned_backend.clone(), task.upstream_prompt_id.clone())
    {
        if let Some(client) = state.clients.get(&backend).await {
            match client.query_history(Some(&upstream_id)).await {
                Ok(mut history) => {
                    // 上游键换成客户端所知的task_id
                    if let Some(object) = history.as_object_mut() {
                        if let Some(entry) = object.remove(&upstream_id) {
                            object.insert(task.id.clone(), entry);
                        }
                    }
                    return Ok(Json(history));
                }
                Err(e) => warn!("获取后端历史失败: {}", e),
            }
        }
    }

    let mut object = serde_json::Map::new();
    object.insert(task.id.clone(), local_history_entry(&task));
    Ok(Json(Value::Object(object)))
}

/// 只读端点透传：按路径哈希确定性地选择一个健康后端
pub async fn proxy_read(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
) -> ApiResult<Response> {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    let healthy: Vec<_> = state
        .registry
        .snapshot()
        .await
        .into_iter()
        .filter(|b| b.enabled && b.status == BackendStatus::Healthy)
        .collect();
    if healthy.is_empty() {
        return Err(ApiError::ServiceUnavailable(
            "没有健康的后端".to_string(),
        ));
    }

    let mut hasher = DefaultHasher::new();
    uri.path().hash(&mut hasher);
    let backend = &healthy[(hasher.finish() as usize) % healthy.len()];

    let client = state
        .clients
        .get(&backend.name)
        .await
        .ok_or_else(|| ApiError::ServiceUnavailable(format!("后端客户端不存在: {}", backend.name)))?;

    let raw = client
        .fetch_raw(&path_and_query)
        .await
        .map_err(|e| ApiError::BadGateway(e.to_string()))?;

    let mut builder = Response::builder().status(
        StatusCode::from_u16(raw.status).unwrap_or(StatusCode::BAD_GATEWAY),
    );
    if let Some(content_type) = raw.content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    builder
        .body(Body::from(raw.body))
        .map_err(|e| ApiError::BadGateway(e.to_string()))
}
