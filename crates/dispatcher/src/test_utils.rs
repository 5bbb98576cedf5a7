//! 测试辅助：可编排的Mock后端客户端与构造函数

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use balancer_backend::{
    BackendApi, ClientFactory, QueueSnapshot, RawResponse, SubmitResponse,
};
use balancer_config::BackendConfig;
use balancer_errors::{BalancerError, BalancerResult};

pub fn backend_config(name: &str, max_queue: usize) -> BackendConfig {
    BackendConfig {
        name: name.to_string(),
        host: "127.0.0.1".to_string(),
        port: 8188,
        weight: 1,
        max_queue,
        enabled: true,
    }
}

/// 提交行为脚本
#[derive(Debug, Clone)]
pub enum SubmitScript {
    Accept,
    Reject(String),
    Unavailable(String),
}

pub struct MockBackendApi {
    name: String,
    counter: AtomicU64,
    scripted: Mutex<VecDeque<SubmitScript>>,
    queue_healthy: AtomicBool,
    queue_counts: Mutex<(usize, usize)>,
    history: Mutex<HashMap<String, Value>>,
    submitted: Mutex<Vec<Value>>,
    cancelled: Mutex<Vec<String>>,
}

impl MockBackendApi {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            counter: AtomicU64::new(0),
            scripted: Mutex::new(VecDeque::new()),
            queue_healthy: AtomicBool::new(true),
            queue_counts: Mutex::new((0, 0)),
            history: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        })
    }

    /// 预排一次提交结果；未排队时默认接受
    pub fn script_submit(&self, script: SubmitScript) {
        self.scripted.lock().unwrap().push_back(script);
    }

    pub fn set_queue_healthy(&self, healthy: bool) {
        self.queue_healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_queue_counts(&self, pending: usize, running: usize) {
        *self.queue_counts.lock().unwrap() = (pending, running);
    }

    pub fn add_history(&self, prompt_id: &str, entry: Value) {
        self.history
            .lock()
            .unwrap()
            .insert(prompt_id.to_string(), entry);
    }

    pub fn submitted_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }

    pub fn cancelled_ids(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackendApi for MockBackendApi {
    async fn submit(
        &self,
        payload: &Value,
        _client_id: Option<&str>,
        _extra: Option<&Value>,
    ) -> BalancerResult<SubmitResponse> {
        let script = self
            .scripted
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SubmitScript::Accept);

        match script {
            SubmitScript::Accept => {
                let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
                self.submitted.lock().unwrap().push(payload.clone());
                Ok(SubmitResponse {
                    prompt_id: format!("{}-p{}", self.name, n),
                    number: n as i64,
                })
            }
            SubmitScript::Reject(msg) => Err(BalancerError::SubmitRejected(msg)),
            SubmitScript::Unavailable(msg) => Err(BalancerError::SubmitUnavailable(msg)),
        }
    }

    async fn query_queue(&self) -> BalancerResult<QueueSnapshot> {
        if !self.queue_healthy.load(Ordering::SeqCst) {
            return Err(BalancerError::network(format!("{}: 连接被拒绝", self.name)));
        }
        let (pending, running) = *self.queue_counts.lock().unwrap();
        Ok(QueueSnapshot {
            queue_pending: vec![Value::Null; pending],
            queue_running: vec![Value::Null; running],
        })
    }

    async fn query_history(&self, prompt_id: Option<&str>) -> BalancerResult<Value> {
        let history = self.history.lock().unwrap();
        match prompt_id {
            Some(id) => match history.get(id) {
                Some(entry) => Ok(serde_json::json!({ id: entry })),
                None => Ok(serde_json::json!({})),
            },
            None => Ok(serde_json::to_value(&*history).unwrap()),
        }
    }

    async fn cancel(&self, prompt_id: &str) -> BalancerResult<()> {
        self.cancelled.lock().unwrap().push(prompt_id.to_string());
        Ok(())
    }

    async fn fetch_raw(&self, _path_and_query: &str) -> BalancerResult<RawResponse> {
        Ok(RawResponse {
            status: 200,
            content_type: Some("application/json".to_string()),
            body: b"{}".to_vec(),
        })
    }
}

/// 按名称复用Mock实例的工厂
pub struct MockClientFactory {
    clients: Mutex<HashMap<String, Arc<MockBackendApi>>>,
}

impl MockClientFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(HashMap::new()),
        })
    }

    pub fn mock(&self, name: &str) -> Arc<MockBackendApi> {
        self.clients
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| MockBackendApi::new(name))
            .clone()
    }
}

impl ClientFactory for MockClientFactory {
    fn make(&self, name: &str, _base_url: &str) -> BalancerResult<Arc<dyn BackendApi>> {
        Ok(self.mock(name))
    }
}
