use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::services::registry::ServiceInstance;

/// 缓存键：服务名 + 排序去重后的标签
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub service: String,
    pub tags: Vec<String>,
}

impl CacheKey {
    pub fn new(service: &str, tags: &[String]) -> Self {
        let mut tags = tags.to_vec();
        tags.sort();
        tags.dedup();
        Self {
            service: service.to_string(),
            tags,
        }
    }

    pub fn service(service: &str) -> Self {
        Self::new(service, &[])
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    instances: Vec<ServiceInstance>,
    cached_at: Instant,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    // 每个服务的失效代数，防止失效之前发起的查询把旧结果写回
    generations: HashMap<String, u64>,
}

/// 缓存统计信息
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// 带 TTL 的实例列表缓存
#[derive(Debug)]
pub struct DiscoveryCache {
    state: RwLock<CacheState>,
    expiry: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DiscoveryCache {
    pub fn new(expiry: Duration) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            expiry,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// 未过期时返回缓存的实例列表
    pub fn get(&self, key: &CacheKey) -> Option<Vec<ServiceInstance>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        match state.entries.get(key) {
            Some(entry) if entry.cached_at.elapsed() <= self.expiry => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.instances.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// 查询注册表之前记录的代数
    pub fn generation(&self, service: &str) -> u64 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .generations
            .get(service)
            .copied()
            .unwrap_or(0)
    }

    /// 只有代数未变（期间没有失效）才写入，返回是否写入
    pub fn insert(&self, key: CacheKey, instances: Vec<ServiceInstance>, generation: u64) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let current = state.generations.get(&key.service).copied().unwrap_or(0);
        if current != generation {
            return false;
        }
        state.entries.insert(
            key,
            CacheEntry {
                instances,
                cached_at: Instant::now(),
            },
        );
        true
    }

    /// 删除服务的所有缓存项（包括带标签的），返回删除数量
    pub fn invalidate_service(&self, service: &str) -> usize {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        *state.generations.entry(service.to_string()).or_insert(0) += 1;
        let before = state.entries.len();
        state.entries.retain(|key, _| key.service != service);
        before - state.entries.len()
    }

    pub fn clear(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let services: Vec<String> = state.entries.keys().map(|key| key.service.clone()).collect();
        for service in services {
            *state.generations.entry(service).or_insert(0) += 1;
        }
        state.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self
                .state
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .entries
                .len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
