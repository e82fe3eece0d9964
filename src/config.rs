use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::services::balancer::BUILTIN_STRATEGIES;
use crate::services::registry::{DEFAULT_MAX_FAILURES, DEFAULT_WEIGHT};

/// 环境变量前缀
pub const ENV_PREFIX: &str = "REGISTRY_";
/// 配置文件路径的环境变量
pub const CONFIG_PATH_ENV: &str = "REGISTRY_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid environment override: {0}")]
    Env(#[from] envy::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub registry: RegistryConfig,
    pub discovery: DiscoveryConfig,
    pub logging: LoggingConfig,
}

/// 注册表与健康检查配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// 健康检查周期（秒）
    pub health_check_interval_secs: u64,
    /// 心跳超时（秒）
    pub heartbeat_timeout_secs: u64,
    /// 单次 HTTP 探测超时（秒）
    pub probe_timeout_secs: u64,
    /// 每轮并发探测上限
    pub max_concurrent_probes: usize,
    /// 事件广播通道容量
    pub event_channel_capacity: usize,
    pub default_weight: u32,
    pub default_max_failures: u32,
}

impl RegistryConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            heartbeat_timeout_secs: 120,
            probe_timeout_secs: 5,
            max_concurrent_probes: 32,
            event_channel_capacity: 1024,
            default_weight: DEFAULT_WEIGHT,
            default_max_failures: DEFAULT_MAX_FAILURES,
        }
    }
}

/// 客户端服务发现配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// 缓存过期时间（秒）
    pub cache_expiry_secs: u64,
    pub default_load_balancer: String,
}

impl DiscoveryConfig {
    pub fn cache_expiry(&self) -> Duration {
        Duration::from_secs(self.cache_expiry_secs)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            cache_expiry_secs: 30,
            default_load_balancer: "round_robin".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// 通过 REGISTRY_* 环境变量覆盖的字段
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    health_check_interval_secs: Option<u64>,
    heartbeat_timeout_secs: Option<u64>,
    probe_timeout_secs: Option<u64>,
    max_concurrent_probes: Option<usize>,
    cache_expiry_secs: Option<u64>,
    default_load_balancer: Option<String>,
    log_level: Option<String>,
    log_json: Option<bool>,
}

impl Config {
    /// 加载顺序：.env -> 配置文件 -> REGISTRY_* 环境变量
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = if Path::new(&path).exists() {
            Self::from_file(&path)?
        } else {
            tracing::debug!(path = %path, "Config file not found, using defaults");
            Self::default()
        };

        let overrides: EnvOverrides = envy::prefixed(ENV_PREFIX).from_env()?;
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config_str = fs::read_to_string(path)?;
        Self::from_toml(&config_str)
    }

    pub fn from_toml(config_str: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(config_str)?;
        Ok(config)
    }

    fn apply_overrides(&mut self, overrides: EnvOverrides) {
        if let Some(v) = overrides.health_check_interval_secs {
            self.registry.health_check_interval_secs = v;
        }
        if let Some(v) = overrides.heartbeat_timeout_secs {
            self.registry.heartbeat_timeout_secs = v;
        }
        if let Some(v) = overrides.probe_timeout_secs {
            self.registry.probe_timeout_secs = v;
        }
        if let Some(v) = overrides.max_concurrent_probes {
            self.registry.max_concurrent_probes = v;
        }
        if let Some(v) = overrides.cache_expiry_secs {
            self.discovery.cache_expiry_secs = v;
        }
        if let Some(v) = overrides.default_load_balancer {
            self.discovery.default_load_balancer = v;
        }
        if let Some(v) = overrides.log_level {
            self.logging.level = v;
        }
        if let Some(v) = overrides.log_json {
            self.logging.json = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let registry = &self.registry;
        let non_zero = [
            ("registry.health_check_interval_secs", registry.health_check_interval_secs),
            ("registry.heartbeat_timeout_secs", registry.heartbeat_timeout_secs),
            ("registry.probe_timeout_secs", registry.probe_timeout_secs),
            ("registry.max_concurrent_probes", registry.max_concurrent_probes as u64),
            ("registry.event_channel_capacity", registry.event_channel_capacity as u64),
            ("registry.default_weight", registry.default_weight as u64),
            ("registry.default_max_failures", registry.default_max_failures as u64),
        ];
        if let Some((field, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{field} must be greater than zero")));
        }

        if !BUILTIN_STRATEGIES.contains(&self.discovery.default_load_balancer.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "unknown load balancer: {}",
                self.discovery.default_load_balancer
            )));
        }

        Ok(())
    }
}
