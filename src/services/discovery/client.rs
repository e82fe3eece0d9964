use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;

use super::cache::{CacheKey, CacheStats, DiscoveryCache};
use super::error::DiscoveryError;
use super::watcher::{WatchCallback, WatcherTable};
use crate::config::DiscoveryConfig;
use crate::services::balancer::LoadBalancerManager;
use crate::services::registry::{
    RegistryEvent, RegistryWatcher, ServiceInstance, ServiceRegistry, WatcherId,
};

/// 客户端服务发现：缓存 + 变更回调 + 负载均衡
///
/// 注册表的每个事件都会同步清除对应服务的缓存，然后在独立任务中重新查询
/// 注册表并把最新实例列表推送给该服务的回调。
/// 创建客户端时所在的运行时会被记住，非运行时线程上的注册表变更也能
/// 投递回调；两者都没有时只做缓存失效。
#[derive(Debug, Clone)]
pub struct ServiceDiscoveryClient {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    registry: ServiceRegistry,
    cache: DiscoveryCache,
    watchers: WatcherTable,
    balancers: LoadBalancerManager,
    task_tracker: TaskTracker,
    runtime: Option<Handle>,
    registration: Mutex<Option<WatcherId>>,
}

// 挂在注册表上的观察者，只持有弱引用避免循环
struct RegistryHook {
    inner: Weak<ClientInner>,
}

impl RegistryWatcher for RegistryHook {
    fn on_event(&self, event: &RegistryEvent) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_event(event);
        }
    }
}

impl ClientInner {
    fn handle_event(&self, event: &RegistryEvent) {
        let service = event.service_name();
        let removed = self.cache.invalidate_service(service);
        tracing::debug!(
            service_name = %service,
            removed_entries = removed,
            "Invalidated discovery cache"
        );

        if !self.watchers.is_watched(service) {
            return;
        }

        let handle = match Handle::try_current().ok().or_else(|| self.runtime.clone()) {
            Some(handle) => handle,
            None => {
                tracing::warn!(
                    service_name = %service,
                    "No async runtime available, skipping watcher notification"
                );
                return;
            }
        };

        let registry = self.registry.clone();
        let watchers = self.watchers.get(service);
        let tracker = self.task_tracker.clone();
        let service = service.to_string();

        self.task_tracker.spawn_on(
            async move {
                let instances: Arc<[ServiceInstance]> = registry.discover(&service).into();
                for callback in watchers {
                    let service = service.clone();
                    let instances = instances.clone();
                    tracker.spawn(async move {
                        callback(&service, &instances);
                    });
                }
            },
            &handle,
        );
    }
}

// 未调用 close 就被丢弃时，同样从注册表摘除
impl Drop for ClientInner {
    fn drop(&mut self) {
        let registration = self
            .registration
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = registration {
            self.registry.remove_watcher(id);
            tracing::debug!("Discovery client dropped, detached from registry");
        }
    }
}

impl ServiceDiscoveryClient {
    pub fn new(registry: ServiceRegistry, config: &DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let balancers = LoadBalancerManager::new();
        balancers
            .set_default(&config.default_load_balancer)
            .map_err(|_| DiscoveryError::UnknownLoadBalancer(config.default_load_balancer.clone()))?;

        let inner = Arc::new(ClientInner {
            registry: registry.clone(),
            cache: DiscoveryCache::new(config.cache_expiry()),
            watchers: WatcherTable::new(),
            balancers,
            task_tracker: TaskTracker::new(),
            runtime: Handle::try_current().ok(),
            registration: Mutex::new(None),
        });

        let watcher_id = registry.add_watcher(Arc::new(RegistryHook {
            inner: Arc::downgrade(&inner),
        }));
        *inner
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(watcher_id);

        Ok(Self { inner })
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    pub fn load_balancers(&self) -> &LoadBalancerManager {
        &self.inner.balancers
    }

    /// 获取服务的健康实例（优先走缓存）
    pub fn get_instances(&self, name: &str) -> Result<Vec<ServiceInstance>, DiscoveryError> {
        self.get_instances_with_tags(name, &[])
    }

    /// 获取包含全部标签的健康实例（优先走缓存）
    pub fn get_instances_with_tags(
        &self,
        name: &str,
        tags: &[String],
    ) -> Result<Vec<ServiceInstance>, DiscoveryError> {
        let key = CacheKey::new(name, tags);
        if let Some(instances) = self.inner.cache.get(&key) {
            tracing::trace!(service_name = %name, tags = ?key.tags, "Discovery cache hit");
            return Ok(instances);
        }

        let generation = self.inner.cache.generation(name);
        let instances = self.inner.registry.discover_with_tags(name, &key.tags);
        tracing::debug!(
            service_name = %name,
            tags = ?key.tags,
            instances = instances.len(),
            "Discovery cache miss, queried registry"
        );
        self.inner.cache.insert(key, instances.clone(), generation);
        Ok(instances)
    }

    /// 用当前负载均衡策略选择一个实例
    pub fn select_instance(
        &self,
        name: &str,
        routing_key: Option<&str>,
    ) -> Result<ServiceInstance, DiscoveryError> {
        self.select_instance_with_tags(name, &[], routing_key)
    }

    pub fn select_instance_with_tags(
        &self,
        name: &str,
        tags: &[String],
        routing_key: Option<&str>,
    ) -> Result<ServiceInstance, DiscoveryError> {
        let instances = self.get_instances_with_tags(name, tags)?;
        if instances.is_empty() {
            return Err(DiscoveryError::NoAvailableInstances(name.to_string()));
        }

        let balancer = self.inner.balancers.default_balancer()?;
        let instance = balancer.select(&instances, routing_key)?;
        tracing::trace!(
            service_name = %name,
            instance_id = %instance.id,
            load_balancer = %balancer.name(),
            "Selected service instance"
        );
        Ok(instance)
    }

    /// 请求完成后调用，最少连接策略据此减少计数
    pub fn release_connection(&self, instance_id: &str) {
        self.inner.balancers.release(instance_id);
    }

    pub fn set_load_balancer(&self, name: &str) -> Result<(), DiscoveryError> {
        self.inner
            .balancers
            .set_default(name)
            .map_err(|_| DiscoveryError::UnknownLoadBalancer(name.to_string()))?;
        tracing::info!(load_balancer = %name, "Switched load balancer");
        Ok(())
    }

    pub fn current_load_balancer(&self) -> String {
        self.inner.balancers.default_name()
    }

    pub fn watch_service<F>(&self, name: &str, callback: F)
    where
        F: Fn(&str, &[ServiceInstance]) + Send + Sync + 'static,
    {
        let callback: WatchCallback = Arc::new(callback);
        self.inner.watchers.add(name, callback);
        tracing::debug!(service_name = %name, "Added service watcher");
    }

    pub fn unwatch_service(&self, name: &str) {
        let removed = self.inner.watchers.remove(name);
        tracing::debug!(service_name = %name, removed, "Removed service watchers");
    }

    pub fn invalidate_cache(&self, name: &str) {
        self.inner.cache.invalidate_service(name);
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// 从注册表摘除并等待进行中的回调任务
    pub async fn close(&self) {
        let registration = self
            .inner
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = registration {
            self.inner.registry.remove_watcher(id);
        }
        self.inner.task_tracker.close();
        self.inner.task_tracker.wait().await;
        self.inner.cache.clear();
    }
}
