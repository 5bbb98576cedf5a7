//! 上游WebSocket读取循环
//!
//! 每个后端维护一条到其 `/ws` 端点的连接，解码后的帧打上后端名标签送入
//! 事件通道。连接断开后按指数退避重连：1秒起步、30秒封顶、全抖动，
//! 连接成功即重置退避。

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// 上游事件帧，带后端名标签
#[derive(Debug, Clone)]
pub struct UpstreamFrame {
    pub backend: String,
    pub raw: Value,
}

/// 重连退避参数
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// 首次重连前的延迟上限
    pub initial: Duration,
    /// 延迟上限
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

/// 全抖动退避：在 `(0, cap]` 内随机取延迟，cap翻倍直到上限
pub fn next_backoff(cap: Duration, config: &BackoffConfig) -> (Duration, Duration) {
    let jittered = cap.mul_f64(rand::random::<f64>().max(0.01));
    let next_cap = (cap * 2).min(config.max);
    (jittered, next_cap)
}

/// 单个后端WS读取循环的参数
#[derive(Debug, Clone)]
pub struct EventStreamConfig {
    /// 后端名称，作为帧标签
    pub backend: String,
    /// 完整WS地址，含 clientId 查询参数
    pub ws_url: String,
    /// 读超时，每收到一帧即刷新；超时后先发Ping探活
    pub read_deadline: Duration,
    pub backoff: BackoffConfig,
}

impl EventStreamConfig {
    pub fn new(backend: &str, ws_url: &str) -> Self {
        Self {
            backend: backend.to_string(),
            ws_url: ws_url.to_string(),
            read_deadline: Duration::from_secs(60),
            backoff: BackoffConfig::default(),
        }
    }
}

/// 运行一个后端的WS读取循环，直到取消
pub async fn run_event_stream(
    config: EventStreamConfig,
    tx: mpsc::Sender<UpstreamFrame>,
    cancel: CancellationToken,
) {
    let mut cap = config.backoff.initial;
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        attempt += 1;
        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            result = connect_async(&config.ws_url) => match result {
                Ok((stream, _response)) => {
                    info!("已连接后端WebSocket: {} (第{}次尝试)", config.backend, attempt);
                    // 连接成功，重置退避
                    cap = config.backoff.initial;
                    attempt = 0;
                    read_frames(&config, stream, &tx, &cancel).await
                }
                Err(e) => {
                    warn!("连接后端WebSocket失败: {}, {}", config.backend, e);
                    ReadOutcome::Reconnect
                }
            }
        };

        if matches!(connected, ReadOutcome::Stop) {
            return;
        }

        let (delay, next_cap) = next_backoff(cap, &config.backoff);
        cap = next_cap;
        debug!(
            "后端 {} 将在 {}ms 后重连",
            config.backend,
            delay.as_millis()
        );
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(delay) => {}
        }
    }
}

enum ReadOutcome {
    Reconnect,
    Stop,
}

async fn read_frames(
    config: &EventStreamConfig,
    mut stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    tx: &mpsc::Sender<UpstreamFrame>,
    cancel: &CancellationToken,
) -> ReadOutcome {
    // 读超时后发一次Ping探活；连续两次超时视为连接失效
    let mut idle_strikes = 0u8;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return ReadOutcome::Stop,
            result = timeout(config.read_deadline, stream.next()) => result,
        };

        let message = match next {
            Err(_) => {
                idle_strikes += 1;
                if idle_strikes >= 2 {
                    warn!("后端 {} WebSocket读超时，重连", config.backend);
                    return ReadOutcome::Reconnect;
                }
                if stream.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return ReadOutcome::Reconnect;
                }
                continue;
            }
            Ok(None) => {
                info!("后端 {} WebSocket流结束", config.backend);
                return ReadOutcome::Reconnect;
            }
            Ok(Some(Err(e))) => {
                warn!("后端 {} WebSocket读取错误: {}", config.backend, e);
                return ReadOutcome::Reconnect;
            }
            Ok(Some(Ok(message))) => {
                idle_strikes = 0;
                message
            }
        };

        match message {
            Message::Text(text) => match serde_json::from_str::<Value>(text.as_str()) {
                Ok(raw) => {
                    let frame = UpstreamFrame {
                        backend: config.backend.clone(),
                        raw,
                    };
                    if tx.send(frame).await.is_err() {
                        // 事件中枢已关闭
                        return ReadOutcome::Stop;
                    }
                }
                Err(e) => {
                    warn!(
                        "后端 {} 发来无效的WebSocket消息: {}",
                        config.backend, e
                    );
                }
            },
            Message::Binary(_) => {
                // 预览图等二进制帧不参与事件路由
                trace!("忽略后端 {} 的二进制帧", config.backend);
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(frame) => {
                info!("后端 {} 关闭WebSocket: {:?}", config.backend, frame);
                return ReadOutcome::Reconnect;
            }
            Message::Frame(_) => {}
        }
    }
}
