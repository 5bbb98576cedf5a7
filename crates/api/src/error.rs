use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use balancer_errors::BalancerError;

/// API错误类型
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("均衡器错误: {0}")]
    Balancer(#[from] BalancerError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("服务不可用: {0}")]
    ServiceUnavailable(String),

    #[error("上游错误: {0}")]
    BadGateway(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Balancer(err) => match err {
                BalancerError::NameConflict { .. } | BalancerError::BackendBusy { .. } => {
                    StatusCode::CONFLICT
                }
                BalancerError::BackendNotFound { .. } | BalancerError::TaskNotFound { .. } => {
                    StatusCode::NOT_FOUND
                }
                BalancerError::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
                BalancerError::InvalidStrategy(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Balancer(err) => err.kind(),
            ApiError::BadRequest(_) => "bad_request",
            ApiError::ServiceUnavailable(_) => "service_unavailable",
            ApiError::BadGateway(_) => "bad_gateway",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "kind": self.kind(),
                "code": status.as_u16()
            }
        }));
        (status, body).into_response()
    }
}

/// API结果类型
pub type ApiResult<T> = Result<T, ApiError>;
