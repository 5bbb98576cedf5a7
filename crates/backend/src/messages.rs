//! ComfyUI WebSocket 消息类型与解析
//!
//! 后端通过WebSocket推送 `{"type": "<kind>", "data": {...}}` 形状的JSON消息，
//! 本模块将其反序列化为强类型的 [`UpstreamMessage`]。未知类型解析失败时，
//! 调用方按原样转发，不得丢弃。

use serde::Deserialize;

/// 已知的ComfyUI WebSocket消息类型
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum UpstreamMessage {
    /// 服务端状态广播（队列深度等）
    #[serde(rename = "status")]
    Status(StatusData),

    /// prompt开始执行
    #[serde(rename = "execution_start")]
    ExecutionStart(PromptScoped),

    /// 部分节点命中缓存被跳过
    #[serde(rename = "execution_cached")]
    ExecutionCached(ExecutionCachedData),

    /// 正在执行某个节点；`node` 为 `None` 时表示该prompt执行完毕
    #[serde(rename = "executing")]
    Executing(ExecutingData),

    /// 长时间运行节点的进度（如 KSampler）
    #[serde(rename = "progress")]
    Progress(ProgressData),

    /// 某个节点执行完成并产生输出
    #[serde(rename = "executed")]
    Executed(ExecutedData),

    /// 整个prompt执行成功
    #[serde(rename = "execution_success")]
    ExecutionSuccess(PromptScoped),

    /// 执行被中断
    #[serde(rename = "execution_interrupted")]
    ExecutionInterrupted(PromptScoped),

    /// 执行失败
    #[serde(rename = "execution_error")]
    ExecutionError(ErrorData),
}

/// 队列状态信息
#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatusData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatusData {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i64,
}

/// 仅携带prompt_id的消息载荷
#[derive(Debug, Clone, Deserialize)]
pub struct PromptScoped {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    /// 当前步数
    pub value: i64,
    /// 总步数
    pub max: i64,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    pub node: String,
    pub output: serde_json::Value,
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: String,
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

/// 终止标记
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Success,
    Error(String),
    Interrupted,
}

impl UpstreamMessage {
    /// 消息关联的上游prompt_id
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            UpstreamMessage::Status(_) => None,
            UpstreamMessage::ExecutionStart(d)
            | UpstreamMessage::ExecutionSuccess(d)
            | UpstreamMessage::ExecutionInterrupted(d) => Some(&d.prompt_id),
            UpstreamMessage::ExecutionCached(d) => Some(&d.prompt_id),
            UpstreamMessage::Executing(d) => Some(&d.prompt_id),
            UpstreamMessage::Progress(d) => d.prompt_id.as_deref(),
            UpstreamMessage::Executed(d) => Some(&d.prompt_id),
            UpstreamMessage::ExecutionError(d) => Some(&d.prompt_id),
        }
    }

    /// 是否为终止标记。`executing` 且 `node == None` 等价于执行成功。
    pub fn terminal(&self) -> Option<Terminal> {
        match self {
            UpstreamMessage::ExecutionSuccess(_) => Some(Terminal::Success),
            UpstreamMessage::Executing(d) if d.node.is_none() => Some(Terminal::Success),
            UpstreamMessage::ExecutionError(d) => {
                Some(Terminal::Error(d.exception_message.clone()))
            }
            UpstreamMessage::ExecutionInterrupted(_) => Some(Terminal::Interrupted),
            _ => None,
        }
    }
}

/// 解析一条WebSocket文本消息
pub fn parse_message(text: &str) -> Result<UpstreamMessage, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_status_message() {
        let json = r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":3}}}}"#;
        let msg = parse_message(json).unwrap();
        match msg {
            UpstreamMessage::Status(data) => {
                assert_eq!(data.status.exec_info.queue_remaining, 3);
            }
            other => panic!("期望 Status, 实际 {other:?}"),
        }
        assert!(parse_message(json).unwrap().prompt_id().is_none());
    }

    #[test]
    fn parse_execution_start_message() {
        let json = r#"{"type":"execution_start","data":{"prompt_id":"abc-123"}}"#;
        let msg = parse_message(json).unwrap();
        assert_eq!(msg.prompt_id(), Some("abc-123"));
        assert!(msg.terminal().is_none());
    }

    #[test]
    fn executing_with_node_is_not_terminal() {
        let json = r#"{"type":"executing","data":{"node":"5","prompt_id":"abc"}}"#;
        let msg = parse_message(json).unwrap();
        assert!(msg.terminal().is_none());
    }

    #[test]
    fn executing_without_node_is_success() {
        let json = r#"{"type":"executing","data":{"node":null,"prompt_id":"abc"}}"#;
        let msg = parse_message(json).unwrap();
        assert_eq!(msg.terminal(), Some(Terminal::Success));
    }

    #[test]
    fn execution_success_is_terminal() {
        let json = r#"{"type":"execution_success","data":{"prompt_id":"abc"}}"#;
        let msg = parse_message(json).unwrap();
        assert_eq!(msg.terminal(), Some(Terminal::Success));
    }

    #[test]
    fn execution_error_carries_message() {
        let json = r#"{"type":"execution_error","data":{"prompt_id":"abc","node_id":"7","exception_message":"CUDA out of memory","exception_type":"RuntimeError"}}"#;
        let msg = parse_message(json).unwrap();
        match msg.terminal() {
            Some(Terminal::Error(message)) => assert!(message.contains("CUDA")),
            other => panic!("期望 Error, 实际 {other:?}"),
        }
    }

    #[test]
    fn unknown_type_fails_parse() {
        let json = r#"{"type":"crystools.monitor","data":{"cpu":1.0}}"#;
        assert!(parse_message(json).is_err());
    }

    #[test]
    fn parse_progress_without_prompt_id() {
        // 旧版本ComfyUI的progress消息不带prompt_id
        let json = r#"{"type":"progress","data":{"value":4,"max":20}}"#;
        let msg = parse_message(json).unwrap();
        assert!(msg.prompt_id().is_none());
    }
}
