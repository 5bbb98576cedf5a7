//! 单个后端的HTTP适配器
//!
//! 封装ComfyUI的HTTP接口（提交、队列查询、历史、取消、只读代理）。
//! [`BackendApi`] 作为seam暴露给分发器与健康检查，测试中以Mock实现替换。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use balancer_errors::{BalancerError, BalancerResult};

/// /prompt 提交成功后的响应
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    /// 后端为该prompt分配的标识
    pub prompt_id: String,
    /// 后端队列中的序号
    #[serde(default)]
    pub number: i64,
}

/// /queue 返回的队列快照
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueSnapshot {
    #[serde(default)]
    pub queue_running: Vec<Value>,
    #[serde(default)]
    pub queue_pending: Vec<Value>,
}

impl QueueSnapshot {
    pub fn running(&self) -> usize {
        self.queue_running.len()
    }

    pub fn pending(&self) -> usize {
        self.queue_pending.len()
    }
}

/// 只读代理的原始响应
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// 后端HTTP操作接口
#[async_trait]
pub trait BackendApi: Send + Sync {
    /// 提交prompt，返回上游prompt_id。
    /// 4xx映射为 `SubmitRejected`（不可重试），网络错误与5xx映射为 `SubmitUnavailable`。
    async fn submit(
        &self,
        payload: &Value,
        client_id: Option<&str>,
        extra: Option<&Value>,
    ) -> BalancerResult<SubmitResponse>;

    /// 查询后端队列状态
    async fn query_queue(&self) -> BalancerResult<QueueSnapshot>;

    /// 查询历史记录；`prompt_id` 为 `None` 时返回全部
    async fn query_history(&self, prompt_id: Option<&str>) -> BalancerResult<Value>;

    /// 取消上游任务，尽力而为
    async fn cancel(&self, prompt_id: &str) -> BalancerResult<()>;

    /// 只读透传，`path_and_query` 形如 `/object_info` 或 `/view?filename=x.png`
    async fn fetch_raw(&self, path_and_query: &str) -> BalancerResult<RawResponse>;
}

/// 基于reqwest的生产实现，每个后端一个有界连接池
pub struct HttpBackendClient {
    name: String,
    base_url: String,
    client: reqwest::Client,
}

impl HttpBackendClient {
    pub fn new(name: &str, base_url: &str, timeout: Duration) -> BalancerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| BalancerError::internal(format!("创建HTTP客户端失败: {e}")))?;

        Ok(Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn read_error_body(response: reqwest::Response) -> String {
        response
            .text()
            .await
            .unwrap_or_else(|_| "<无法读取响应体>".to_string())
    }
}

#[async_trait]
impl BackendApi for HttpBackendClient {
    async fn submit(
        &self,
        payload: &Value,
        client_id: Option<&str>,
        extra: Option<&Value>,
    ) -> BalancerResult<SubmitResponse> {
        let mut body = serde_json::json!({ "prompt": payload });
        if let Some(client_id) = client_id {
            body["client_id"] = Value::String(client_id.to_string());
        }
        if let Some(extra) = extra {
            body["extra_data"] = extra.clone();
        }

        let response = self
            .client
            .post(format!("{}/prompt", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| BalancerError::SubmitUnavailable(format!("{}: {e}", self.name)))?;

        let status = response.status();
        if status.is_client_error() {
            let text = Self::read_error_body(response).await;
            return Err(BalancerError::SubmitRejected(format!(
                "HTTP {status}: {text}"
            )));
        }
        if !status.is_success() {
            let text = Self::read_error_body(response).await;
            return Err(BalancerError::SubmitUnavailable(format!(
                "HTTP {status}: {text}"
            )));
        }

        response
            .json::<SubmitResponse>()
            .await
            .map_err(|e| BalancerError::SubmitUnavailable(format!("解析提交响应失败: {e}")))
    }

    async fn query_queue(&self) -> BalancerResult<QueueSnapshot> {
        let response = self
            .client
            .get(format!("{}/queue", self.base_url))
            .send()
            .await
            .map_err(|e| BalancerError::network(format!("{}: {e}", self.name)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BalancerError::network(format!(
                "{}: HTTP {status}",
                self.name
            )));
        }

        response
            .json::<QueueSnapshot>()
            .await
            .map_err(|e| BalancerError::network(format!("解析队列快照失败: {e}")))
    }

    async fn query_history(&self, prompt_id: Option<&str>) -> BalancerResult<Value> {
        let url = match prompt_id {
            Some(id) => format!("{}/history/{id}", self.base_url),
            None => format!("{}/history", self.base_url),
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| BalancerError::network(format!("{}: {e}", self.name)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BalancerError::network(format!(
                "{}: HTTP {status}",
                self.name
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| BalancerError::network(format!("解析历史记录失败: {e}")))
    }

    async fn cancel(&self, prompt_id: &str) -> BalancerResult<()> {
        let body = serde_json::json!({ "delete": [prompt_id] });

        let response = self
            .client
            .post(format!("{}/queue", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| BalancerError::network(format!("{}: {e}", self.name)))?;

        if !response.status().is_success() {
            return Err(BalancerError::network(format!(
                "{}: 取消请求返回 HTTP {}",
                self.name,
                response.status()
            )));
        }
        Ok(())
    }

    async fn fetch_raw(&self, path_and_query: &str) -> BalancerResult<RawResponse> {
        let response = self
            .client
            .get(format!("{}{path_and_query}", self.base_url))
            .send()
            .await
            .map_err(|e| BalancerError::network(format!("{}: {e}", self.name)))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| BalancerError::network(format!("{}: {e}", self.name)))?
            .to_vec();

        Ok(RawResponse {
            status,
            content_type,
            body,
        })
    }
}

/// 客户端工厂，测试中可替换为Mock实现
pub trait ClientFactory: Send + Sync {
    fn make(&self, name: &str, base_url: &str) -> BalancerResult<Arc<dyn BackendApi>>;
}

pub struct HttpClientFactory {
    timeout: Duration,
}

impl HttpClientFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ClientFactory for HttpClientFactory {
    fn make(&self, name: &str, base_url: &str) -> BalancerResult<Arc<dyn BackendApi>> {
        Ok(Arc::new(HttpBackendClient::new(
            name,
            base_url,
            self.timeout,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_snapshot_parse() {
        let json = r#"{
            "queue_running": [[0, "a1", {}, {"client_id": "x"}]],
            "queue_pending": [[1, "b2", {}, {}], [2, "c3", {}, {}]]
        }"#;
        let snapshot: QueueSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.running(), 1);
        assert_eq!(snapshot.pending(), 2);
    }

    #[test]
    fn test_queue_snapshot_missing_fields() {
        let snapshot: QueueSnapshot = serde_json::from_str("{}").unwrap();
        assert_eq!(snapshot.running(), 0);
        assert_eq!(snapshot.pending(), 0);
    }

    #[test]
    fn test_submit_response_parse() {
        let json = r#"{"prompt_id": "abc-123", "number": 42, "node_errors": {}}"#;
        let resp: SubmitResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.prompt_id, "abc-123");
        assert_eq!(resp.number, 42);
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client =
            HttpBackendClient::new("comfy-1", "http://127.0.0.1:8188/", Duration::from_secs(3))
                .unwrap();
        assert_eq!(client.base_url, "http://127.0.0.1:8188");
    }
}
