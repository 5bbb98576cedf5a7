//! Domain Entities
//!
//! 核心领域实体定义，包含后端实例状态、任务与任务状态机等业务核心概念。
//! 这些实体不依赖于外部技术实现。

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use balancer_errors::BalancerError;

// ============================================================================
// 后端相关实体
// ============================================================================

/// 后端健康状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// 后端实例状态
///
/// 配置部分（name/host/port/weight/max_queue/enabled）来自配置文件或管理API；
/// 其余字段由健康检查与分发过程维护。
///
/// # 字段说明
///
/// - `reserved`: 已预留但尚未确认提交的任务数
/// - `pending`/`running`: 后端队列快照，由健康检查刷新
/// - `consecutive_ok`/`consecutive_fail`: 健康状态迁移使用的滚动计数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendState {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub max_queue: usize,
    pub enabled: bool,
    pub status: BackendStatus,
    pub consecutive_ok: u32,
    pub consecutive_fail: u32,
    pub pending: usize,
    pub running: usize,
    pub reserved: usize,
    pub last_probe_at: Option<DateTime<Utc>>,
}

impl BackendState {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/ws", self.host, self.port)
    }

    /// 总占用量，预留计入在内
    pub fn total_load(&self) -> usize {
        self.reserved + self.pending + self.running
    }

    /// 是否可接收新任务
    pub fn is_available(&self) -> bool {
        self.enabled && self.status == BackendStatus::Healthy && self.total_load() < self.max_queue
    }

    /// 是否完全空闲
    pub fn is_idle(&self) -> bool {
        self.is_available() && self.pending + self.running == 0
    }
}

// ============================================================================
// 任务相关实体
// ============================================================================

/// 任务状态
///
/// # 变体说明
///
/// - `Pending`: 在均衡器队列中等待分发
/// - `Dispatching`: 已预留后端容量，提交进行中
/// - `Dispatched`: 已提交到后端，等待执行完成
/// - `Completed`/`Failed`/`Cancelled`: 终止状态，不再变化
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Dispatching,
    Dispatched,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// 状态机允许的迁移边
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Dispatching)
                | (Pending, Cancelled)
                | (Dispatching, Dispatched)
                | (Dispatching, Pending)
                | (Dispatching, Failed)
                | (Dispatching, Cancelled)
                | (Dispatched, Completed)
                | (Dispatched, Failed)
                | (Dispatched, Pending)
                | (Dispatched, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Dispatching => "dispatching",
            TaskState::Dispatched => "dispatched",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

/// 任务
///
/// 一个客户端提交的prompt，从接收直到终止状态都由均衡器跟踪。
/// `payload` 是不透明的prompt JSON，核心逻辑从不解析其节点结构。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// 进程内单调递增的序号，兼容ComfyUI响应中的 number 字段
    pub number: u64,
    pub state: TaskState,
    pub payload: serde_json::Value,
    pub extra: Option<serde_json::Value>,
    pub client_id: Option<String>,
    pub assigned_backend: Option<String>,
    pub upstream_prompt_id: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub error_kind: Option<String>,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        number: u64,
        payload: serde_json::Value,
        client_id: Option<String>,
        extra: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            number,
            state: TaskState::Pending,
            payload,
            extra,
            client_id,
            assigned_backend: None,
            upstream_prompt_id: None,
            attempts: 0,
            last_error: None,
            error_kind: None,
            created_at: Utc::now(),
            dispatched_at: None,
            completed_at: None,
        }
    }

    pub fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }
}

// ============================================================================
// 调度与统计
// ============================================================================

/// 调度策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    LeastBusy,
    RoundRobin,
    Weighted,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::LeastBusy => "least_busy",
            Strategy::RoundRobin => "round_robin",
            Strategy::Weighted => "weighted",
        }
    }
}

impl FromStr for Strategy {
    type Err = BalancerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "least_busy" => Ok(Strategy::LeastBusy),
            "round_robin" => Ok(Strategy::RoundRobin),
            "weighted" => Ok(Strategy::Weighted),
            other => Err(BalancerError::InvalidStrategy(other.to_string())),
        }
    }
}

/// 队列状态
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub dispatching: usize,
    pub dispatched: usize,
    pub total: usize,
}

/// 系统统计信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStats {
    pub total_backends: usize,
    pub healthy_backends: usize,
    pub available_backends: usize,
    pub idle_backends: usize,
    pub queue_status: QueueStatus,
    pub backends: Vec<BackendState>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backend(status: BackendStatus, enabled: bool) -> BackendState {
        BackendState {
            name: "comfy-1".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8188,
            weight: 1,
            max_queue: 2,
            enabled,
            status,
            consecutive_ok: 0,
            consecutive_fail: 0,
            pending: 0,
            running: 0,
            reserved: 0,
            last_probe_at: None,
        }
    }

    #[test]
    fn test_backend_availability() {
        let mut b = backend(BackendStatus::Healthy, true);
        assert!(b.is_available());
        assert!(b.is_idle());

        // 容量占满后不可用
        b.pending = 1;
        b.reserved = 1;
        assert_eq!(b.total_load(), 2);
        assert!(!b.is_available());

        // 禁用或不健康都不可用
        let b = backend(BackendStatus::Healthy, false);
        assert!(!b.is_available());
        let b = backend(BackendStatus::Unknown, true);
        assert!(!b.is_available());
    }

    #[test]
    fn test_backend_urls() {
        let b = backend(BackendStatus::Healthy, true);
        assert_eq!(b.base_url(), "http://127.0.0.1:8188");
        assert_eq!(b.ws_url(), "ws://127.0.0.1:8188/ws");
    }

    #[test]
    fn test_allowed_transitions() {
        use TaskState::*;

        assert!(Pending.can_transition_to(Dispatching));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Dispatching.can_transition_to(Dispatched));
        assert!(Dispatching.can_transition_to(Pending));
        assert!(Dispatching.can_transition_to(Failed));
        assert!(Dispatching.can_transition_to(Cancelled));
        assert!(Dispatched.can_transition_to(Completed));
        assert!(Dispatched.can_transition_to(Failed));
        assert!(Dispatched.can_transition_to(Pending));
        assert!(Dispatched.can_transition_to(Cancelled));
    }

    #[test]
    fn test_forbidden_transitions() {
        use TaskState::*;

        // 不允许跳级
        assert!(!Pending.can_transition_to(Dispatched));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        // 终止状态被冻结
        for terminal in [Completed, Failed, Cancelled] {
            for next in [Pending, Dispatching, Dispatched, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_task_new_defaults() {
        let task = Task::new(7, json!({"1": {"class_type": "KSampler"}}), None, None);
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.number, 7);
        assert_eq!(task.attempts, 0);
        assert!(task.is_live());
        assert!(task.assigned_backend.is_none());
        assert!(task.upstream_prompt_id.is_none());
    }

    #[test]
    fn test_strategy_round_trip() {
        for s in ["least_busy", "round_robin", "weighted"] {
            assert_eq!(s.parse::<Strategy>().unwrap().as_str(), s);
        }
        assert!("random".parse::<Strategy>().is_err());
    }

    #[test]
    fn test_state_serde_rename() {
        let json = serde_json::to_string(&TaskState::Pending).unwrap();
        assert_eq!(json, "\"pending\"");
        let json = serde_json::to_string(&BackendStatus::Unhealthy).unwrap();
        assert_eq!(json, "\"unhealthy\"");
    }
}
