//! 负载均衡器管理端点 /lb/*

use std::str::FromStr;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use balancer_config::{validation::validate_backend, BackendConfig};
use balancer_domain::{Strategy, TaskSummary};
use balancer_dispatcher::collect_stats;
use balancer_errors::BalancerError;

use crate::error::{ApiError, ApiResult};
use crate::response::{created, success, success_empty};
use crate::routes::AppState;

pub async fn lb_stats(State(state): State<AppState>) -> impl IntoResponse {
    let stats = collect_stats(&state.registry, &state.store).await;
    success(stats)
}

pub async fn list_backends(State(state): State<AppState>) -> impl IntoResponse {
    success(state.registry.snapshot().await)
}

pub async fn add_backend(
    State(state): State<AppState>,
    Json(config): Json<BackendConfig>,
) -> ApiResult<impl IntoResponse> {
    validate_backend(&config).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let backend = state.dispatcher.add_backend(&config).await?;
    state.hub.watch_backend(&backend.name, &backend.ws_url()).await;
    // 立即探测，不用等下一个周期
    state.health.probe(backend.name.clone()).await;

    let refreshed = state
        .registry
        .get(&backend.name)
        .await
        .unwrap_or(backend);
    Ok(created(refreshed))
}

pub async fn remove_backend(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.dispatcher.remove_backend(&name).await?;
    state.hub.unwatch_backend(&name).await;
    Ok(success_empty())
}

pub async fn enable_backend(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let backend = state.registry.enable(&name).await?;
    state.dispatcher.signal_capacity();
    Ok(success(backend))
}

pub async fn disable_backend(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let backend = state.registry.disable(&name).await?;
    Ok(success(backend))
}

pub async fn list_tasks(State(state): State<AppState>) -> impl IntoResponse {
    let summaries: Vec<TaskSummary> = state
        .store
        .list()
        .await
        .iter()
        .map(TaskSummary::from)
        .collect();
    success(summaries)
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let task = state
        .store
        .get(&task_id)
        .await
        .ok_or_else(|| ApiError::Balancer(BalancerError::task_not_found(&task_id)))?;
    Ok(success(task))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.dispatcher.cancel_task(&task_id).await?;
    Ok(success_empty())
}

pub async fn trigger_health_check(State(state): State<AppState>) -> impl IntoResponse {
    state.health.check_all().await;
    success_empty()
}

pub async fn get_scheduler(State(state): State<AppState>) -> impl IntoResponse {
    let strategy = state.scheduler.strategy().await;
    let has_available = state.registry.has_available().await;
    let idle = state
        .registry
        .snapshot()
        .await
        .iter()
        .any(|b| b.is_idle());

    success(json!({
        "strategy": strategy.as_str(),
        "prefer_idle": state.scheduler.prefer_idle(),
        "has_available_backend": has_available,
        "has_idle_backend": idle,
    }))
}

pub async fn set_strategy(
    State(state): State<AppState>,
    Path(strategy): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let strategy = Strategy::from_str(&strategy).map_err(ApiError::Balancer)?;
    state.scheduler.set_strategy(strategy).await;
    Ok(success(json!({ "strategy": strategy.as_str() })))
}
