use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use rand::Rng;

use super::{
    BalancerError, CONSISTENT_HASH, LEAST_CONNECTIONS, LoadBalancer, RANDOM, ROUND_ROBIN,
    WEIGHTED_ROUND_ROBIN,
};
use crate::services::registry::ServiceInstance;

fn ensure_not_empty(instances: &[ServiceInstance]) -> Result<(), BalancerError> {
    if instances.is_empty() {
        Err(BalancerError::NoInstances)
    } else {
        Ok(())
    }
}

// 按服务名取游标并自增
fn next_cursor(cursors: &DashMap<String, u64>, service_name: &str) -> u64 {
    let mut cursor = cursors.entry(service_name.to_string()).or_insert(0);
    let current = *cursor;
    *cursor = cursor.wrapping_add(1);
    current
}

/// 轮询：每个服务名独立计数
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    cursors: DashMap<String, u64>,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn name(&self) -> &str {
        ROUND_ROBIN
    }

    fn select(
        &self,
        instances: &[ServiceInstance],
        _key: Option<&str>,
    ) -> Result<ServiceInstance, BalancerError> {
        ensure_not_empty(instances)?;
        let cursor = next_cursor(&self.cursors, &instances[0].name);
        Ok(instances[(cursor % instances.len() as u64) as usize].clone())
    }
}

/// 均匀随机
#[derive(Debug, Default)]
pub struct RandomBalancer;

impl LoadBalancer for RandomBalancer {
    fn name(&self) -> &str {
        RANDOM
    }

    fn select(
        &self,
        instances: &[ServiceInstance],
        _key: Option<&str>,
    ) -> Result<ServiceInstance, BalancerError> {
        ensure_not_empty(instances)?;
        let idx = rand::rng().random_range(0..instances.len());
        Ok(instances[idx].clone())
    }
}

/// 加权轮询：一个周期（总权重次）内各实例被选中次数与权重成正比
#[derive(Debug, Default)]
pub struct WeightedRoundRobinBalancer {
    cursors: DashMap<String, u64>,
}

impl WeightedRoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for WeightedRoundRobinBalancer {
    fn name(&self) -> &str {
        WEIGHTED_ROUND_ROBIN
    }

    fn select(
        &self,
        instances: &[ServiceInstance],
        _key: Option<&str>,
    ) -> Result<ServiceInstance, BalancerError> {
        ensure_not_empty(instances)?;

        let weight = |instance: &ServiceInstance| u64::from(instance.weight.max(1));
        let total_weight: u64 = instances.iter().map(weight).sum();
        let idx = next_cursor(&self.cursors, &instances[0].name) % total_weight;

        let mut running = 0;
        for instance in instances {
            running += weight(instance);
            if running > idx {
                return Ok(instance.clone());
            }
        }
        // idx < total_weight，上面的循环必然返回
        Ok(instances[instances.len() - 1].clone())
    }
}

/// 32 位 FNV-1a
pub(crate) fn fnv1a_32(key: &str) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    key.bytes().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(PRIME)
    })
}

/// 按路由键哈希选择；同一列表顺序下相同的键总落在同一位置
#[derive(Debug, Default)]
pub struct ConsistentHashBalancer;

impl LoadBalancer for ConsistentHashBalancer {
    fn name(&self) -> &str {
        CONSISTENT_HASH
    }

    fn select(
        &self,
        instances: &[ServiceInstance],
        key: Option<&str>,
    ) -> Result<ServiceInstance, BalancerError> {
        ensure_not_empty(instances)?;

        let idx = match key.filter(|key| !key.is_empty()) {
            Some(key) => fnv1a_32(key) as usize % instances.len(),
            None => {
                // 没有路由键时退化为基于时间的伪随机
                let nanos = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .subsec_nanos();
                nanos as usize % instances.len()
            }
        };
        Ok(instances[idx].clone())
    }
}

/// 最少连接：选择时计数加一，`release` 时减一
#[derive(Debug, Default)]
pub struct LeastConnectionsBalancer {
    connections: Mutex<HashMap<String, usize>>,
}

impl LeastConnectionsBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_connections(&self, instance_id: &str) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instance_id)
            .copied()
            .unwrap_or(0)
    }
}

impl LoadBalancer for LeastConnectionsBalancer {
    fn name(&self) -> &str {
        LEAST_CONNECTIONS
    }

    fn select(
        &self,
        instances: &[ServiceInstance],
        _key: Option<&str>,
    ) -> Result<ServiceInstance, BalancerError> {
        ensure_not_empty(instances)?;

        // 扫描与自增在同一把锁内完成
        let mut connections = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        let mut winner = &instances[0];
        let mut least = connections.get(&winner.id).copied().unwrap_or(0);
        for instance in &instances[1..] {
            let count = connections.get(&instance.id).copied().unwrap_or(0);
            if count < least {
                winner = instance;
                least = count;
            }
        }

        *connections.entry(winner.id.clone()).or_insert(0) += 1;
        Ok(winner.clone())
    }

    fn release(&self, instance_id: &str) {
        let mut connections = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = connections.get_mut(instance_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                connections.remove(instance_id);
            }
        }
    }
}
