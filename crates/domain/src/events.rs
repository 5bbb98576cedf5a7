//! 管理通道事件
//!
//! 管理WebSocket上发布的消息，序列化为 `{type, data}` 的标签对象。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::{BackendState, QueueStatus, SystemStats, Task, TaskState};

/// 任务摘要，不携带prompt载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    pub number: u64,
    pub state: TaskState,
    pub client_id: Option<String>,
    pub assigned_backend: Option<String>,
    pub upstream_prompt_id: Option<String>,
    pub attempts: u32,
    pub error_kind: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            number: task.number,
            state: task.state,
            client_id: task.client_id.clone(),
            assigned_backend: task.assigned_backend.clone(),
            upstream_prompt_id: task.upstream_prompt_id.clone(),
            attempts: task.attempts,
            error_kind: task.error_kind.clone(),
            last_error: task.last_error.clone(),
            created_at: task.created_at,
        }
    }
}

/// 管理事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ManagementEvent {
    StatsUpdate(SystemStats),
    BackendUpdate(BackendState),
    QueueUpdate(QueueStatus),
    TaskUpdate(TaskSummary),
}
