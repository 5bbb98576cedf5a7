use std::path::Path;
use std::time::Duration;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::validation::ConfigValidator;
use crate::{ConfigError, ConfigResult};

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 监听地址
    pub host: String,
    /// 监听端口
    pub port: u16,
    /// 调试模式，放宽日志级别
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8100,
            debug: false,
        }
    }
}

/// 调度器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 调度策略: least_busy(最少忙碌), round_robin(轮询), weighted(加权)
    pub strategy: String,
    /// 优先选择完全空闲的实例
    pub prefer_idle: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: "least_busy".to_string(),
            prefer_idle: true,
        }
    }
}

/// 健康检查配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// 检查间隔（秒）
    pub interval: f64,
    /// 单次探测超时（秒）
    pub timeout: f64,
    /// 连续失败多少次标记为不健康
    pub unhealthy_threshold: u32,
    /// 连续成功多少次标记为健康
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: 5.0,
            timeout: 3.0,
            unhealthy_threshold: 3,
            healthy_threshold: 1,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval_duration(&self) -> Duration {
        Duration::from_secs_f64(self.interval)
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }
}

/// 任务队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 在途任务总量上限
    pub max_size: usize,
    /// 提交失败的重试间隔（秒）
    pub retry_interval: f64,
    /// 最大重试次数
    pub max_retries: u32,
    /// /prompt 阻塞等待分发的超时（秒），超时后返回202风格响应
    pub submit_timeout: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            retry_interval: 1.0,
            max_retries: 3,
            submit_timeout: 5.0,
        }
    }
}

impl QueueConfig {
    pub fn retry_interval_duration(&self) -> Duration {
        Duration::from_secs_f64(self.retry_interval)
    }

    pub fn submit_timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.submit_timeout)
    }
}

/// 单个ComfyUI后端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// 后端名称，全局唯一
    pub name: String,
    /// 后端地址
    #[serde(default = "default_backend_host")]
    pub host: String,
    /// 后端端口
    pub port: u16,
    /// 权重，用于加权调度
    #[serde(default = "default_backend_weight")]
    pub weight: u32,
    /// 最大队列长度，达到后不再分发
    #[serde(default = "default_backend_max_queue")]
    pub max_queue: usize,
    /// 是否启用
    #[serde(default = "default_backend_enabled")]
    pub enabled: bool,
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

fn default_backend_weight() -> u32 {
    1
}

fn default_backend_max_queue() -> usize {
    10
}

fn default_backend_enabled() -> bool {
    true
}

impl BackendConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// 全局配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub health_check: HealthCheckConfig,
    pub queue: QueueConfig,
    pub backends: Vec<BackendConfig>,
}

impl AppConfig {
    /// 加载配置。环境变量（COMFYUI_LB_ 前缀，`__` 分隔嵌套）覆盖YAML文件中的值。
    pub fn load(config_path: Option<&str>) -> ConfigResult<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Yaml));
            } else {
                return Err(ConfigError::File(format!("配置文件不存在: {path}")));
            }
        } else {
            // 探测默认配置文件路径，全部不存在时使用内置默认值
            let default_paths = ["config.yaml", "config.yml", "/etc/comfy-balancer/config.yaml"];
            for path in &default_paths {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Yaml));
                    break;
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("COMFYUI_LB")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        let app_config: AppConfig = config
            .try_deserialize()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        app_config.validate()?;
        Ok(app_config)
    }

    /// 从YAML文本加载，测试与嵌入场景使用
    pub fn from_yaml(text: &str) -> ConfigResult<Self> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(text, FileFormat::Yaml))
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        let app_config: AppConfig = config
            .try_deserialize()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        app_config.validate()?;
        Ok(app_config)
    }
}
