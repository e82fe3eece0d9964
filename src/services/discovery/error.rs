use thiserror::Error;

use crate::services::balancer::BalancerError;

/// 服务发现客户端错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("no available instances for service: {0}")]
    NoAvailableInstances(String),

    #[error("load balancer not found: {0}")]
    UnknownLoadBalancer(String),

    #[error("load balancer error: {0}")]
    Balancer(#[from] BalancerError),
}
