//! 负载均衡模块
//!
//! 五种可互换的实例选择策略，全部作用于已过滤的健康实例列表，
//! 以及按名称管理策略的 `LoadBalancerManager`。

pub mod manager;
pub mod strategies;

use std::fmt;

use thiserror::Error;

use crate::services::registry::ServiceInstance;

pub use manager::LoadBalancerManager;
pub use strategies::{
    ConsistentHashBalancer, LeastConnectionsBalancer, RandomBalancer, RoundRobinBalancer,
    WeightedRoundRobinBalancer,
};

pub const ROUND_ROBIN: &str = "round_robin";
pub const RANDOM: &str = "random";
pub const WEIGHTED_ROUND_ROBIN: &str = "weighted_round_robin";
pub const CONSISTENT_HASH: &str = "consistent_hash";
pub const LEAST_CONNECTIONS: &str = "least_connections";

/// 内置策略名称
pub const BUILTIN_STRATEGIES: [&str; 5] = [
    ROUND_ROBIN,
    RANDOM,
    WEIGHTED_ROUND_ROBIN,
    CONSISTENT_HASH,
    LEAST_CONNECTIONS,
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BalancerError {
    #[error("no instances available")]
    NoInstances,
    #[error("load balancer not found: {0}")]
    UnknownStrategy(String),
}

/// 负载均衡策略
pub trait LoadBalancer: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// 从健康实例中选出一个；`key` 为可选的路由键
    fn select(
        &self,
        instances: &[ServiceInstance],
        key: Option<&str>,
    ) -> Result<ServiceInstance, BalancerError>;

    /// 请求结束后归还连接，只有最少连接策略关心
    fn release(&self, _instance_id: &str) {}
}
