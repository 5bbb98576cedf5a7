use std::collections::HashSet;

use crate::models::{AppConfig, BackendConfig};
use crate::{ConfigError, ConfigResult};

/// 配置校验接口
pub trait ConfigValidator {
    fn validate(&self) -> ConfigResult<()>;
}

const VALID_STRATEGIES: [&str; 3] = ["least_busy", "round_robin", "weighted"];

/// 校验单个后端配置，管理API添加后端时也会调用
pub fn validate_backend(backend: &BackendConfig) -> ConfigResult<()> {
    if backend.name.trim().is_empty() {
        return Err(ConfigError::Validation(
            "backends[].name 不能为空".to_string(),
        ));
    }
    if backend.host.trim().is_empty() {
        return Err(ConfigError::Validation(format!(
            "后端 {} 的 host 不能为空",
            backend.name
        )));
    }
    if backend.port == 0 {
        return Err(ConfigError::Validation(format!(
            "后端 {} 的 port 无效",
            backend.name
        )));
    }
    if backend.weight == 0 {
        return Err(ConfigError::Validation(format!(
            "后端 {} 的 weight 必须 >= 1",
            backend.name
        )));
    }
    if backend.max_queue == 0 {
        return Err(ConfigError::Validation(format!(
            "后端 {} 的 max_queue 必须 >= 1",
            backend.name
        )));
    }
    Ok(())
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.server.port == 0 {
            return Err(ConfigError::Validation("server.port 无效".to_string()));
        }

        if !VALID_STRATEGIES.contains(&self.scheduler.strategy.as_str()) {
            return Err(ConfigError::Validation(format!(
                "无效的调度策略: {}，可用: {:?}",
                self.scheduler.strategy, VALID_STRATEGIES
            )));
        }

        if self.health_check.interval <= 0.0 || self.health_check.timeout <= 0.0 {
            return Err(ConfigError::Validation(
                "health_check.interval / timeout 必须为正数".to_string(),
            ));
        }
        if self.health_check.healthy_threshold == 0 || self.health_check.unhealthy_threshold == 0 {
            return Err(ConfigError::Validation(
                "health_check 阈值必须 >= 1".to_string(),
            ));
        }

        if self.queue.max_size == 0 {
            return Err(ConfigError::Validation(
                "queue.max_size 必须 >= 1".to_string(),
            ));
        }
        if self.queue.retry_interval <= 0.0 {
            return Err(ConfigError::Validation(
                "queue.retry_interval 必须为正数".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for backend in &self.backends {
            validate_backend(backend)?;
            if !names.insert(backend.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "后端名称重复: {}",
                    backend.name
                )));
            }
        }

        Ok(())
    }
}
