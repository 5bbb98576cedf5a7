pub mod models;
pub mod validation;

pub use models::{
    AppConfig, BackendConfig, HealthCheckConfig, QueueConfig, SchedulerConfig, ServerConfig,
};
pub use validation::ConfigValidator;

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// 配置错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("配置验证失败: {0}")]
    Validation(String),

    #[error("配置文件错误: {0}")]
    File(String),

    #[error("配置解析错误: {0}")]
    Parse(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::File(err.to_string())
    }
}
