use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::{
    BalancerError, ConsistentHashBalancer, LeastConnectionsBalancer, LoadBalancer, RandomBalancer,
    RoundRobinBalancer, WeightedRoundRobinBalancer, ROUND_ROBIN,
};

/// 按名称管理负载均衡策略
#[derive(Debug)]
pub struct LoadBalancerManager {
    balancers: RwLock<HashMap<String, Arc<dyn LoadBalancer>>>,
    default_name: RwLock<String>,
}

impl Default for LoadBalancerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancerManager {
    /// 注册全部内置策略，默认使用轮询
    pub fn new() -> Self {
        let manager = Self {
            balancers: RwLock::new(HashMap::new()),
            default_name: RwLock::new(ROUND_ROBIN.to_string()),
        };
        manager.register(Arc::new(RoundRobinBalancer::new()));
        manager.register(Arc::new(RandomBalancer));
        manager.register(Arc::new(WeightedRoundRobinBalancer::new()));
        manager.register(Arc::new(ConsistentHashBalancer));
        manager.register(Arc::new(LeastConnectionsBalancer::new()));
        manager
    }

    /// 以策略自身的名称注册（同名覆盖）
    pub fn register(&self, balancer: Arc<dyn LoadBalancer>) {
        let name = balancer.name().to_string();
        tracing::debug!(load_balancer = %name, "Registered load balancer");
        self.balancers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, balancer);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn LoadBalancer>, BalancerError> {
        self.balancers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| BalancerError::UnknownStrategy(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.balancers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn default_name(&self) -> String {
        self.default_name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn default_balancer(&self) -> Result<Arc<dyn LoadBalancer>, BalancerError> {
        self.get(&self.default_name())
    }

    pub fn set_default(&self, name: &str) -> Result<(), BalancerError> {
        if !self.contains(name) {
            return Err(BalancerError::UnknownStrategy(name.to_string()));
        }
        *self.default_name.write().unwrap_or_else(PoisonError::into_inner) = name.to_string();
        Ok(())
    }

    /// 向所有策略归还连接，避免切换策略后计数泄漏
    pub fn release(&self, instance_id: &str) {
        let balancers: Vec<Arc<dyn LoadBalancer>> = self
            .balancers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for balancer in balancers {
            balancer.release(instance_id);
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .balancers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
