use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// 实例的默认权重
pub const DEFAULT_WEIGHT: u32 = 100;
/// 默认的连续失败阈值
pub const DEFAULT_MAX_FAILURES: u32 = 3;

/// 服务实例状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Healthy,
    Unhealthy,
    /// 刚注册、尚未完成第一次健康检查
    Unknown,
    /// 管理员标记为下线中，不再接收新流量
    Draining,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Unhealthy => "unhealthy",
            ServiceStatus::Unknown => "unknown",
            ServiceStatus::Draining => "draining",
        };
        f.write_str(s)
    }
}

// 服务实例
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub health_check_url: Option<String>,
    pub status: ServiceStatus,
    pub metadata: HashMap<String, String>,
    pub tags: HashSet<String>,
    pub version: String,
    pub weight: u32,
    pub last_seen: SystemTime,
    pub failure_count: u32,
    pub max_failures: u32,
}

impl ServiceInstance {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn is_healthy(&self) -> bool {
        self.status == ServiceStatus::Healthy
    }

    /// 实例的标签集合是否包含所有请求的标签
    pub fn has_tags<S: AsRef<str>>(&self, tags: &[S]) -> bool {
        tags.iter().all(|tag| self.tags.contains(tag.as_ref()))
    }

    /// 距离上次心跳（或成功探测）的时长
    pub fn since_last_seen(&self, now: SystemTime) -> Duration {
        now.duration_since(self.last_seen).unwrap_or_default()
    }

    pub(crate) fn has_health_check(&self) -> bool {
        self.health_check_url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty())
    }
}

/// 注册请求
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationRequest {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub health_check_url: Option<String>,
    pub metadata: HashMap<String, String>,
    pub tags: Vec<String>,
    pub version: String,
    pub weight: Option<u32>,
    pub max_failures: Option<u32>,
}

impl RegistrationRequest {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_health_check(mut self, url: impl Into<String>) -> Self {
        self.health_check_url = Some(url.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = Some(max_failures);
        self
    }
}

/// 注册表变更事件
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Registered(ServiceInstance),
    Deregistered(ServiceInstance),
    StatusChanged {
        instance: ServiceInstance,
        old: ServiceStatus,
        new: ServiceStatus,
    },
}

impl RegistryEvent {
    pub fn instance(&self) -> &ServiceInstance {
        match self {
            RegistryEvent::Registered(instance)
            | RegistryEvent::Deregistered(instance)
            | RegistryEvent::StatusChanged { instance, .. } => instance,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.instance().name
    }
}

/// 同步观察者：在注册表变更之后（已释放锁）被调用
pub trait RegistryWatcher: Send + Sync {
    fn on_event(&self, event: &RegistryEvent);
}

// 注册表统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total_instances: usize,
    pub total_services: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub draining: usize,
}
