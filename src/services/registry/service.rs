use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::error::RegistryError;
use super::health::HealthChecker;
use super::types::{
    RegistrationRequest, RegistryEvent, RegistryStats, RegistryWatcher, ServiceInstance,
    ServiceStatus,
};
use crate::config::RegistryConfig;

pub(super) type InstanceMap = HashMap<String, ServiceInstance>;

/// 观察者句柄，用于 `remove_watcher`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherId(u64);

/// 进程内的权威服务注册表
///
/// 实例表由一把读写锁保护：查询走读锁，注册/注销/状态变更/心跳以及健康检查
/// 结果的写回走写锁。返回给调用方的总是实例快照（克隆），从不暴露内部表。
/// 观察者在锁释放之后才被通知。
#[derive(Clone)]
pub struct ServiceRegistry {
    pub(super) instances: Arc<RwLock<InstanceMap>>,
    watchers: Arc<RwLock<Vec<(WatcherId, Arc<dyn RegistryWatcher>)>>>,
    next_watcher_id: Arc<AtomicU64>,
    events: broadcast::Sender<RegistryEvent>,
    pub(super) checker: HealthChecker,
    pub(super) config: RegistryConfig,
    pub(super) task_tracker: TaskTracker,
    pub(super) shutdown: CancellationToken,
    pub(super) started: Arc<AtomicBool>,
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("instances", &self.read_instances().len())
            .field("config", &self.config)
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl ServiceRegistry {
    /// 创建注册表；后台健康检查需通过 `start_health_checks` 显式启动
    pub fn new(config: RegistryConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        Self {
            instances: Arc::new(RwLock::new(HashMap::new())),
            watchers: Arc::new(RwLock::new(Vec::new())),
            next_watcher_id: Arc::new(AtomicU64::new(1)),
            events,
            checker: HealthChecker::new(config.probe_timeout(), config.max_concurrent_probes),
            config,
            task_tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub(super) fn read_instances(&self) -> RwLockReadGuard<'_, InstanceMap> {
        self.instances.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn write_instances(&self) -> RwLockWriteGuard<'_, InstanceMap> {
        self.instances.write().unwrap_or_else(PoisonError::into_inner)
    }

    // 注册服务实例
    pub fn register(&self, request: RegistrationRequest) -> Result<ServiceInstance, RegistryError> {
        Self::validate(&request)?;

        let RegistrationRequest {
            name,
            address,
            port,
            health_check_url,
            metadata,
            tags,
            version,
            weight,
            max_failures,
        } = request;
        let name = name.trim().to_string();
        let address = address.trim().to_string();

        let instance = ServiceInstance {
            id: Self::generate_id(&name, &address, port),
            health_check_url: health_check_url.filter(|url| !url.trim().is_empty()),
            status: ServiceStatus::Unknown,
            metadata,
            tags: tags.into_iter().filter(|tag| !tag.is_empty()).collect(),
            version,
            weight: weight.unwrap_or(self.config.default_weight),
            last_seen: SystemTime::now(),
            failure_count: 0,
            max_failures: max_failures.unwrap_or(self.config.default_max_failures),
            name,
            address,
            port,
        };

        self.write_instances()
            .insert(instance.id.clone(), instance.clone());

        tracing::info!(
            service_name = %instance.name,
            instance_id = %instance.id,
            endpoint = %instance.endpoint(),
            "Registered service instance"
        );

        self.notify(RegistryEvent::Registered(instance.clone()));
        Ok(instance)
    }

    fn validate(request: &RegistrationRequest) -> Result<(), RegistryError> {
        if request.name.trim().is_empty() {
            return Err(RegistryError::validation("name", "is required"));
        }
        if request.address.trim().is_empty() {
            return Err(RegistryError::validation("address", "is required"));
        }
        if request.port == 0 {
            return Err(RegistryError::validation("port", "must be non-zero"));
        }
        if request.weight == Some(0) {
            return Err(RegistryError::validation("weight", "must be positive"));
        }
        if request.max_failures == Some(0) {
            return Err(RegistryError::validation("max_failures", "must be positive"));
        }
        Ok(())
    }

    // 名称+地址+端口+时间戳，附加随机后缀保证不重复
    fn generate_id(name: &str, address: &str, port: u16) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{name}-{address}-{port}-{nanos}-{}", &suffix[..8])
    }

    // 注销服务实例
    pub fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        let removed = self
            .write_instances()
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        tracing::info!(
            service_name = %removed.name,
            instance_id = %removed.id,
            "Deregistered service instance"
        );

        self.notify(RegistryEvent::Deregistered(removed));
        Ok(())
    }

    /// 返回指定服务下所有健康实例
    pub fn discover(&self, name: &str) -> Vec<ServiceInstance> {
        self.discover_with_tags(name, &[])
    }

    /// 返回指定服务下所有健康且包含全部请求标签的实例
    pub fn discover_with_tags(&self, name: &str, tags: &[String]) -> Vec<ServiceInstance> {
        self.read_instances()
            .values()
            .filter(|instance| instance.name == name && instance.is_healthy())
            .filter(|instance| instance.has_tags(tags))
            .cloned()
            .collect()
    }

    // 获取实例快照（不区分状态）
    pub fn get_service(&self, id: &str) -> Result<ServiceInstance, RegistryError> {
        self.read_instances()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// 指定服务的全部实例，包括不健康的
    pub fn get_all_instances(&self, name: &str) -> Vec<ServiceInstance> {
        self.read_instances()
            .values()
            .filter(|instance| instance.name == name)
            .cloned()
            .collect()
    }

    pub fn list_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .read_instances()
            .values()
            .map(|instance| instance.name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn stats(&self) -> RegistryStats {
        let instances = self.read_instances();
        let mut stats = RegistryStats {
            total_instances: instances.len(),
            ..Default::default()
        };
        let mut services = std::collections::HashSet::new();

        for instance in instances.values() {
            services.insert(instance.name.as_str());
            match instance.status {
                ServiceStatus::Healthy => stats.healthy += 1,
                ServiceStatus::Unhealthy => stats.unhealthy += 1,
                ServiceStatus::Unknown => stats.unknown += 1,
                ServiceStatus::Draining => stats.draining += 1,
            }
        }
        stats.total_services = services.len();
        stats
    }

    // 手动更新实例状态
    pub fn update_status(&self, id: &str, status: ServiceStatus) -> Result<(), RegistryError> {
        let event = {
            let mut instances = self.write_instances();
            let instance = instances
                .get_mut(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

            let old = instance.status;
            if status == ServiceStatus::Healthy {
                instance.failure_count = 0;
                instance.last_seen = SystemTime::now();
            }
            instance.status = status;

            (old != status).then(|| RegistryEvent::StatusChanged {
                instance: instance.clone(),
                old,
                new: status,
            })
        };

        if let Some(event) = event {
            if let RegistryEvent::StatusChanged { instance, old, new } = &event {
                tracing::info!(
                    service_name = %instance.name,
                    instance_id = %instance.id,
                    old_status = %old,
                    new_status = %new,
                    "Updated service instance status"
                );
            }
            self.notify(event);
        }

        Ok(())
    }

    /// 心跳：刷新 last_seen；不健康或未知状态的实例恢复为健康
    pub fn heartbeat(&self, id: &str) -> Result<(), RegistryError> {
        let event = {
            let mut instances = self.write_instances();
            let instance = instances
                .get_mut(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

            instance.last_seen = SystemTime::now();
            tracing::debug!(instance_id = %id, "Received heartbeat");

            match instance.status {
                ServiceStatus::Unhealthy | ServiceStatus::Unknown => {
                    let old = instance.status;
                    instance.status = ServiceStatus::Healthy;
                    instance.failure_count = 0;
                    Some(RegistryEvent::StatusChanged {
                        instance: instance.clone(),
                        old,
                        new: ServiceStatus::Healthy,
                    })
                }
                ServiceStatus::Healthy | ServiceStatus::Draining => None,
            }
        };

        if let Some(event) = event {
            tracing::info!(
                service_name = %event.service_name(),
                instance_id = %id,
                "Service instance recovered by heartbeat"
            );
            self.notify(event);
        }

        Ok(())
    }

    /// 添加同步观察者
    pub fn add_watcher(&self, watcher: Arc<dyn RegistryWatcher>) -> WatcherId {
        let id = WatcherId(self.next_watcher_id.fetch_add(1, Ordering::Relaxed));
        self.watchers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, watcher));
        id
    }

    pub fn remove_watcher(&self, id: WatcherId) -> bool {
        let mut watchers = self.watchers.write().unwrap_or_else(PoisonError::into_inner);
        let before = watchers.len();
        watchers.retain(|(watcher_id, _)| *watcher_id != id);
        watchers.len() != before
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// 订阅注册表事件流；落后太多的订阅者会丢失旧事件
    pub fn subscribe(&self) -> impl Stream<Item = RegistryEvent> + Send + use<> {
        BroadcastStream::new(self.events.subscribe()).filter_map(|result| match result {
            Ok(event) => Some(event),
            Err(err) => {
                tracing::warn!(error = %err, "Registry event subscriber lagged");
                None
            }
        })
    }

    pub(super) fn notify(&self, event: RegistryEvent) {
        let watchers: Vec<Arc<dyn RegistryWatcher>> = self
            .watchers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, watcher)| watcher.clone())
            .collect();

        for watcher in watchers {
            watcher.on_event(&event);
        }

        if self.events.send(event).is_err() {
            tracing::trace!("No active registry event subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingWatcher {
        events: Mutex<Vec<RegistryEvent>>,
    }

    impl RegistryWatcher for RecordingWatcher {
        fn on_event(&self, event: &RegistryEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn request(port: u16) -> RegistrationRequest {
        RegistrationRequest::new("api", "127.0.0.1", port)
    }

    #[test]
    fn test_register_applies_defaults() {
        let registry = ServiceRegistry::default();
        let instance = registry.register(request(8080)).unwrap();

        assert_eq!(instance.status, ServiceStatus::Unknown);
        assert_eq!(instance.weight, 100);
        assert_eq!(instance.max_failures, 3);
        assert_eq!(instance.failure_count, 0);
        assert!(instance.id.starts_with("api-127.0.0.1-8080-"));
        assert_eq!(registry.get_service(&instance.id).unwrap(), instance);
    }

    #[test]
    fn test_register_rejects_invalid_requests() {
        let registry = ServiceRegistry::default();

        let cases = [
            (RegistrationRequest::new("", "127.0.0.1", 80), "name"),
            (RegistrationRequest::new("api", "  ", 80), "address"),
            (RegistrationRequest::new("api", "127.0.0.1", 0), "port"),
            (request(80).with_weight(0), "weight"),
            (request(80).with_max_failures(0), "max_failures"),
        ];
        for (req, expected) in cases {
            match registry.register(req) {
                Err(RegistryError::Validation { field, .. }) => assert_eq!(field, expected),
                other => panic!("expected validation error for {expected}, got {other:?}"),
            }
        }
        assert_eq!(registry.stats().total_instances, 0);
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = ServiceRegistry::default();
        let a = registry.register(request(8080)).unwrap();
        let b = registry.register(request(8080)).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_discover_only_returns_healthy() {
        let registry = ServiceRegistry::default();
        let a = registry.register(request(1)).unwrap();
        let b = registry.register(request(2)).unwrap();
        let c = registry.register(request(3)).unwrap();

        assert!(registry.discover("api").is_empty());

        registry.update_status(&a.id, ServiceStatus::Healthy).unwrap();
        registry.update_status(&b.id, ServiceStatus::Draining).unwrap();
        registry.update_status(&c.id, ServiceStatus::Unhealthy).unwrap();

        let found = registry.discover("api");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, a.id);
        assert_eq!(registry.get_all_instances("api").len(), 3);
    }

    #[test]
    fn test_update_status_resets_failures_and_notifies_on_change() {
        let registry = ServiceRegistry::default();
        let watcher = Arc::new(RecordingWatcher::default());
        let instance = registry.register(request(1)).unwrap();
        registry.add_watcher(watcher.clone());

        registry.write_instances().get_mut(&instance.id).unwrap().failure_count = 2;
        registry.update_status(&instance.id, ServiceStatus::Healthy).unwrap();
        registry.update_status(&instance.id, ServiceStatus::Healthy).unwrap();

        assert_eq!(registry.get_service(&instance.id).unwrap().failure_count, 0);
        let events = watcher.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            RegistryEvent::StatusChanged {
                old: ServiceStatus::Unknown,
                new: ServiceStatus::Healthy,
                ..
            }
        ));
    }

    #[test]
    fn test_not_found_errors() {
        let registry = ServiceRegistry::default();
        let missing = RegistryError::NotFound("nope".to_string());

        assert_eq!(registry.deregister("nope"), Err(missing.clone()));
        assert_eq!(registry.get_service("nope"), Err(missing.clone()));
        assert_eq!(registry.heartbeat("nope"), Err(missing.clone()));
        assert_eq!(
            registry.update_status("nope", ServiceStatus::Healthy),
            Err(missing)
        );
    }

    #[test]
    fn test_heartbeat_recovers_unhealthy_but_not_draining() {
        let registry = ServiceRegistry::default();
        let a = registry.register(request(1)).unwrap();
        let b = registry.register(request(2)).unwrap();

        registry.update_status(&a.id, ServiceStatus::Unhealthy).unwrap();
        registry.write_instances().get_mut(&a.id).unwrap().failure_count = 5;
        registry.update_status(&b.id, ServiceStatus::Draining).unwrap();

        registry.heartbeat(&a.id).unwrap();
        registry.heartbeat(&b.id).unwrap();

        let a = registry.get_service(&a.id).unwrap();
        assert_eq!(a.status, ServiceStatus::Healthy);
        assert_eq!(a.failure_count, 0);
        assert_eq!(
            registry.get_service(&b.id).unwrap().status,
            ServiceStatus::Draining
        );
    }

    #[test]
    fn test_watchers_see_register_and_deregister() {
        let registry = ServiceRegistry::default();
        let watcher = Arc::new(RecordingWatcher::default());
        let id = registry.add_watcher(watcher.clone());

        let instance = registry.register(request(1)).unwrap();
        registry.deregister(&instance.id).unwrap();
        assert!(registry.remove_watcher(id));
        registry.register(request(2)).unwrap();

        let events = watcher.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], RegistryEvent::Registered(_)));
        assert!(matches!(events[1], RegistryEvent::Deregistered(_)));
    }

    #[test]
    fn test_list_services_and_stats() {
        let registry = ServiceRegistry::default();
        let a = registry.register(RegistrationRequest::new("web", "10.0.0.1", 80)).unwrap();
        registry.register(RegistrationRequest::new("api", "10.0.0.2", 80)).unwrap();
        registry.register(RegistrationRequest::new("api", "10.0.0.3", 80)).unwrap();
        registry.update_status(&a.id, ServiceStatus::Healthy).unwrap();

        assert_eq!(registry.list_services(), vec!["api".to_string(), "web".to_string()]);
        let stats = registry.stats();
        assert_eq!(stats.total_instances, 3);
        assert_eq!(stats.total_services, 2);
        assert_eq!(stats.healthy, 1);
        assert_eq!(stats.unknown, 2);
    }
}
