use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

/// 管理API的统一响应包装；ComfyUI兼容端点不经过这里
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl<T> ApiResponse<T>
where
    T: Serialize,
{
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            timestamp: chrono::Utc::now(),
        }
    }
}

impl ApiResponse<()> {
    pub fn success_empty() -> Self {
        Self {
            success: true,
            data: None,
            message: None,
            timestamp: chrono::Utc::now(),
        }
    }
}

impl<T> IntoResponse for ApiResponse<T>
where
    T: Serialize,
{
    fn into_response(self) -> axum::response::Response {
        Json(self).into_response()
    }
}

pub fn success<T: Serialize>(data: T) -> impl IntoResponse {
    (StatusCode::OK, ApiResponse::success(data))
}

pub fn created<T: Serialize>(data: T) -> impl IntoResponse {
    (StatusCode::CREATED, ApiResponse::success(data))
}

pub fn success_empty() -> impl IntoResponse {
    (StatusCode::OK, ApiResponse::success_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_wrapper() {
        let response = ApiResponse::success("data");
        assert!(response.success);
        assert_eq!(response.data, Some("data"));
        assert!(response.message.is_none());
    }

    #[test]
    fn test_serialization_shape() {
        let json = serde_json::to_string(&ApiResponse::success(1)).unwrap();
        assert!(json.contains("\"success\":true"));
        assert!(json.contains("\"data\":1"));
        assert!(json.contains("\"timestamp\""));
    }
}
