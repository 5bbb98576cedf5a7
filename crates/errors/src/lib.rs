use thiserror::Error;


/// 负载均衡器统一错误类型
#[derive(Debug, Error)]
pub enum BalancerError {
    #[error("后端名称已存在: {name}")]
    NameConflict { name: String },
    #[error("后端未找到: {name}")]
    BackendNotFound { name: String },
    #[error("后端尚未排空或未禁用，无法移除: {name}")]
    BackendBusy { name: String },
    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },
    #[error("任务队列已满，容量: {capacity}")]
    QueueFull { capacity: usize },
    #[error("当前没有可接收任务的后端")]
    NoCapacity,
    #[error("后端拒绝了提交: {0}")]
    SubmitRejected(String),
    #[error("后端暂时不可用: {0}")]
    SubmitUnavailable(String),
    #[error("提交重试次数已耗尽: {0}")]
    SubmitExhausted(String),
    #[error("后端失联: {0}")]
    BackendLost(String),
    #[error("非法的任务状态转换: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("下游连接消费过慢: {client_id}")]
    SlowConsumer { client_id: String },
    #[error("无效的调度策略: {0}")]
    InvalidStrategy(String),
    #[error("网络错误: {0}")]
    Network(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type BalancerResult<T> = Result<T, BalancerError>;

impl BalancerError {
    pub fn name_conflict<S: Into<String>>(name: S) -> Self {
        Self::NameConflict { name: name.into() }
    }
    pub fn backend_not_found<S: Into<String>>(name: S) -> Self {
        Self::BackendNotFound { name: name.into() }
    }
    pub fn backend_busy<S: Into<String>>(name: S) -> Self {
        Self::BackendBusy { name: name.into() }
    }
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }
    pub fn invalid_transition<S: Into<String>>(from: S, to: S) -> Self {
        Self::InvalidTransition {
            from: from.into(),
            to: to.into(),
        }
    }
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// 是否属于可重试的瞬时失败
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BalancerError::SubmitUnavailable(_)
                | BalancerError::BackendLost(_)
                | BalancerError::Network(_)
        )
    }

    /// 稳定的错误种类标识，用于任务详情与终止WS帧
    pub fn kind(&self) -> &'static str {
        match self {
            BalancerError::NameConflict { .. } => "name_conflict",
            BalancerError::BackendNotFound { .. } => "backend_not_found",
            BalancerError::BackendBusy { .. } => "backend_busy",
            BalancerError::TaskNotFound { .. } => "task_not_found",
            BalancerError::QueueFull { .. } => "queue_full",
            BalancerError::NoCapacity => "no_capacity",
            BalancerError::SubmitRejected(_) => "submit_rejected",
            BalancerError::SubmitUnavailable(_) => "submit_unavailable",
            BalancerError::SubmitExhausted(_) => "submit_exhausted",
            BalancerError::BackendLost(_) => "backend_lost",
            BalancerError::InvalidTransition { .. } => "invalid_transition",
            BalancerError::SlowConsumer { .. } => "slow_consumer",
            BalancerError::InvalidStrategy(_) => "invalid_strategy",
            BalancerError::Network(_) => "network",
            BalancerError::Serialization(_) => "serialization",
            BalancerError::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for BalancerError {
    fn from(err: serde_json::Error) -> Self {
        BalancerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for BalancerError {
    fn from(err: anyhow::Error) -> Self {
        BalancerError::Internal(err.to_string())
    }
}
