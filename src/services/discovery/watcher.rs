use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::services::registry::ServiceInstance;

/// 服务实例集合变化时的回调：服务名 + 最新健康实例列表
pub type WatchCallback = Arc<dyn Fn(&str, &[ServiceInstance]) + Send + Sync>;

/// 服务名 -> 回调列表
#[derive(Default)]
pub struct WatcherTable {
    callbacks: RwLock<HashMap<String, Vec<WatchCallback>>>,
}

impl fmt::Debug for WatcherTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let callbacks = self.callbacks.read().unwrap_or_else(PoisonError::into_inner);
        let counts: HashMap<&str, usize> = callbacks
            .iter()
            .map(|(name, list)| (name.as_str(), list.len()))
            .collect();
        f.debug_struct("WatcherTable").field("callbacks", &counts).finish()
    }
}

impl WatcherTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, service: &str, callback: WatchCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(service.to_string())
            .or_default()
            .push(callback);
    }

    /// 删除服务的全部回调，返回删除数量
    pub fn remove(&self, service: &str) -> usize {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(service)
            .map(|list| list.len())
            .unwrap_or(0)
    }

    /// 回调列表的快照，调用方在锁外执行回调
    pub fn get(&self, service: &str) -> Vec<WatchCallback> {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_watched(&self, service: &str) -> bool {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .is_some_and(|list| !list.is_empty())
    }
}
