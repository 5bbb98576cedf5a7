//! 事件中枢
//!
//! 订阅每个后端的WebSocket流，把上游帧扇出到下游客户端连接：
//! 按 (backend, upstream_prompt_id) 找到任务，把帧里的上游prompt_id改写为
//! 内部task_id（客户端只认 /prompt 返回的id），再路由给client_id匹配的
//! 订阅者。终止帧同时镜像到分发器的完成路径，省去历史轮询。
//!
//! 下游发送永不阻塞：订阅者的有界通道满了就视为慢消费者，当场摘除，
//! 由连接写端负责以 slow_consumer 理由关闭。

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use balancer_backend::{run_event_stream, EventStreamConfig, Terminal, UpstreamFrame, UpstreamMessage};
use balancer_domain::{ManagementEvent, TaskState, TaskSummary};

use crate::dispatcher::Dispatcher;
use crate::events::EventBus;
use crate::task_store::TaskStore;

/// 下游订阅者的有界缓冲，超过即判慢消费者
const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

struct Subscriber {
    client_id: String,
    prompt_filter: Option<String>,
    tx: mpsc::Sender<Value>,
}

pub struct EventHub {
    store: Arc<TaskStore>,
    events: Arc<EventBus>,
    subscribers: RwLock<HashMap<String, Subscriber>>,
    frame_tx: mpsc::Sender<UpstreamFrame>,
    frame_rx: Mutex<Option<mpsc::Receiver<UpstreamFrame>>>,
    readers: Mutex<HashMap<String, CancellationToken>>,
    bridge_id: String,
    buffer: usize,
}

impl EventHub {
    pub fn new(store: Arc<TaskStore>, events: Arc<EventBus>, bridge_id: String) -> Self {
        Self::with_buffer(store, events, bridge_id, DEFAULT_SUBSCRIBER_BUFFER)
    }

    pub fn with_buffer(
        store: Arc<TaskStore>,
        events: Arc<EventBus>,
        bridge_id: String,
        buffer: usize,
    ) -> Self {
        let (frame_tx, frame_rx) = mpsc::channel(1024);
        Self {
            store,
            events,
            subscribers: RwLock::new(HashMap::new()),
            frame_tx,
            frame_rx: Mutex::new(Some(frame_rx)),
            readers: Mutex::new(HashMap::new()),
            bridge_id,
            buffer,
        }
    }

    /// 上游帧入口，WS读取循环与测试都经由这里
    pub fn frame_sender(&self) -> mpsc::Sender<UpstreamFrame> {
        self.frame_tx.clone()
    }

    /// 为后端启动WS读取循环。桥接身份作为clientId附在连接上，
    /// 使得以桥接身份提交的任务事件都会回流到这条连接。
    pub async fn watch_backend(&self, name: &str, ws_url: &str) {
        let mut readers = self.readers.lock().await;
        if readers.contains_key(name) {
            return;
        }

        let token = CancellationToken::new();
        readers.insert(name.to_string(), token.clone());
        drop(readers);

        let full_url = format!("{}?clientId={}", ws_url, self.bridge_id);
        let config = EventStreamConfig::new(name, &full_url);
        let tx = self.frame_tx.clone();
        tokio::spawn(async move {
            run_event_stream(config, tx, token).await;
        });
        info!("已启动后端 {} 的事件订阅", name);
    }

    /// 停止后端的WS读取循环（仅在移除后端时调用；禁用的后端继续排空）
    pub async fn unwatch_backend(&self, name: &str) {
        if let Some(token) = self.readers.lock().await.remove(name) {
            token.cancel();
            info!("已停止后端 {} 的事件订阅", name);
        }
    }

    /// 停止全部读取循环
    pub async fn shutdown_readers(&self) {
        let mut readers = self.readers.lock().await;
        for (_, token) in readers.drain() {
            token.cancel();
        }
    }

    /// 注册一个下游订阅者，返回其接收端
    pub async fn subscribe(
        &self,
        conn_id: &str,
        client_id: &str,
        prompt_filter: Option<String>,
    ) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let subscriber = Subscriber {
            client_id: client_id.to_string(),
            prompt_filter,
            tx,
        };
        self.subscribers
            .write()
            .await
            .insert(conn_id.to_string(), subscriber);
        info!("WebSocket客户端订阅: {} (连接 {})", client_id, conn_id);
        rx
    }

    pub async fn unsubscribe(&self, conn_id: &str) {
        if self.subscribers.write().await.remove(conn_id).is_some() {
            info!("WebSocket客户端退订: 连接 {}", conn_id);
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// 事件循环：消费上游帧并监听任务事件以合成均衡器侧的失败终止帧
    pub async fn run(&self, dispatcher: Arc<Dispatcher>, mut shutdown: broadcast::Receiver<()>) {
        let Some(mut frame_rx) = self.frame_rx.lock().await.take() else {
            error!("事件中枢已在运行，拒绝重复启动");
            return;
        };
        let mut bus_rx = self.events.subscribe();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                frame = frame_rx.recv() => {
                    let Some(frame) = frame else { break };
                    self.handle_frame(frame, &dispatcher).await;
                }
                event = bus_rx.recv() => {
                    match event {
                        Ok(ManagementEvent::TaskUpdate(summary)) => {
                            self.maybe_synthesize_failure(&summary).await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("事件中枢落后管理事件 {} 条", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        info!("事件中枢已退出");
    }

    /// 处理一条上游帧：改写、扇出、镜像终止
    pub async fn handle_frame(&self, frame: UpstreamFrame, dispatcher: &Dispatcher) {
        let UpstreamFrame { backend, mut raw } = frame;

        // 类型化解析用于prompt定位与终止判定；解析失败不影响转发
        let parsed: Option<UpstreamMessage> = serde_json::from_value(raw.clone()).ok();
        let prompt_id = parsed
            .as_ref()
            .and_then(|m| m.prompt_id().map(str::to_string))
            .or_else(|| {
                raw.pointer("/data/prompt_id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            });

        let task = match &prompt_id {
            Some(pid) => self.store.by_upstream(&backend, pid).await,
            None => None,
        };

        // 改写：打后端标签，上游prompt_id换成内部task_id
        if let Some(object) = raw.as_object_mut() {
            object.insert("_backend".to_string(), json!(backend));
        }
        if let Some(task) = &task {
            if let Some(data) = raw.get_mut("data").and_then(|d| d.as_object_mut()) {
                if data.contains_key("prompt_id") {
                    data.insert("prompt_id".to_string(), json!(task.id));
                }
            }
        }

        let target_client = task.as_ref().and_then(|t| t.client_id.clone());
        let internal_id = task.as_ref().map(|t| t.id.clone());
        self.fan_out(&raw, target_client.as_deref(), internal_id.as_deref())
            .await;

        // 终止帧镜像到完成路径；对已取消任务的事件在存储层被丢弃
        if let (Some(message), Some(pid)) = (&parsed, &prompt_id) {
            if let Some(terminal) = message.terminal() {
                let (success, error) = match terminal {
                    Terminal::Success => (true, None),
                    Terminal::Error(message) => (false, Some(message)),
                    Terminal::Interrupted => (false, Some("执行被中断".to_string())),
                };
                dispatcher
                    .complete_upstream(&backend, pid, success, error)
                    .await;
            }
        }
    }

    /// 均衡器侧的任务失败（提交被拒、重试耗尽、后端失联）没有上游终止帧，
    /// 在这里合成一条发给客户端。
    async fn maybe_synthesize_failure(&self, summary: &TaskSummary) {
        if summary.state != TaskState::Failed {
            return;
        }
        let kind = summary.error_kind.as_deref().unwrap_or("");
        if !matches!(kind, "submit_rejected" | "submit_exhausted" | "backend_lost") {
            return;
        }

        let frame = json!({
            "type": "execution_error",
            "data": {
                "prompt_id": summary.id,
                "node_id": "",
                "exception_type": kind,
                "exception_message": summary
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "任务失败".to_string()),
            },
            "_balancer": true,
        });
        self.fan_out(&frame, summary.client_id.as_deref(), Some(&summary.id))
            .await;
    }

    /// 扇出到订阅者。`target_client` 为 `None` 的帧（status等）广播给
    /// 未设prompt过滤的订阅者。
    async fn fan_out(&self, frame: &Value, target_client: Option<&str>, task_id: Option<&str>) {
        let subscribers = self.subscribers.read().await;
        let mut dropped: Vec<(String, String)> = Vec::new();

        for (conn_id, subscriber) in subscribers.iter() {
            let matched = match target_client {
                Some(client_id) => {
                    subscriber.client_id == client_id
                        && match &subscriber.prompt_filter {
                            Some(filter) => task_id == Some(filter.as_str()),
                            None => true,
                        }
                }
                None => subscriber.prompt_filter.is_none(),
            };
            if !matched {
                continue;
            }

            match subscriber.tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "下游消费过慢，断开连接: {} (客户端 {})",
                        conn_id, subscriber.client_id
                    );
                    dropped.push((conn_id.clone(), subscriber.client_id.clone()));
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("下游连接已关闭: {}", conn_id);
                    dropped.push((conn_id.clone(), subscriber.client_id.clone()));
                }
            }
        }
        drop(subscribers);

        if !dropped.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for (conn_id, _) in &dropped {
                subscribers.remove(conn_id);
            }
        }
    }
}
