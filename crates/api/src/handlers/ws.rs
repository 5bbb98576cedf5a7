//! WebSocket端点
//!
//! /ws 是ComfyUI兼容的客户端事件通道，按 clientId 订阅事件中枢；
//! /lb/ws 是管理通道，推送 {type, data} 标签事件。

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::routes::AppState;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(rename = "clientId")]
    pub client_id: Option<String>,
    #[serde(rename = "promptId")]
    pub prompt_id: Option<String>,
}

pub async fn client_ws(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_client_socket(socket, state, params))
}

async fn handle_client_socket(socket: WebSocket, state: AppState, params: WsParams) {
    let conn_id = Uuid::new_v4().to_string();
    let client_id = params.client_id.unwrap_or_else(|| conn_id.clone());
    info!("WebSocket客户端连接: {} (连接 {})", client_id, conn_id);

    let mut rx = state
        .hub
        .subscribe(&conn_id, &client_id, params.prompt_id)
        .await;

    let (mut sink, mut stream) = socket.split();

    // 写端：把事件中枢的帧转发到连接上
    let writer_conn_id = conn_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(value) = rx.recv().await {
            let text = match serde_json::to_string(&value) {
                Ok(text) => text,
                Err(e) => {
                    warn!("序列化事件帧失败: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                debug!("WebSocket写入端关闭: 连接 {}", writer_conn_id);
                return;
            }
        }
        // 通道被事件中枢关闭：慢消费者被摘除，带原因关闭连接
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "slow_consumer".into(),
            })))
            .await;
    });

    // 读端：客户端消息仅用于保活
    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("WebSocket读取错误: 连接 {}: {}", conn_id, e);
                break;
            }
        }
    }

    state.hub.unsubscribe(&conn_id).await;
    send_task.abort();
    info!("WebSocket客户端断开: {} (连接 {})", client_id, conn_id);
}

pub async fn management_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_management_socket(socket, state))
}

async fn handle_management_socket(socket: WebSocket, state: AppState) {
    let mut events = state.events.subscribe();
    let (mut sink, mut stream) = socket.split();
    info!("管理WebSocket连接建立");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("序列化管理事件失败: {}", e);
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("管理WebSocket落后 {} 条事件", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    info!("管理WebSocket连接断开");
}
