mod common;

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::timeout;
use tokio_stream::StreamExt;

use common::{MockHealthServer, closed_port_url, eventually, fast_config, register_healthy};
use registry_core::config::RegistryConfig;
use registry_core::services::registry::{
    RegistrationRequest, RegistryError, RegistryEvent, ServiceRegistry, ServiceStatus,
};

fn probe_config() -> RegistryConfig {
    RegistryConfig {
        probe_timeout_secs: 1,
        ..Default::default()
    }
}

#[test]
fn test_registration_visibility() {
    let registry = ServiceRegistry::default();

    let mut expected = HashSet::new();
    for port in 8001..=8003 {
        let instance = register_healthy(&registry, RegistrationRequest::new("orders", "10.0.0.5", port));
        expected.insert(instance.id);
    }
    // 未检查过的实例不可见
    registry
        .register(RegistrationRequest::new("orders", "10.0.0.5", 8004))
        .unwrap();
    register_healthy(&registry, RegistrationRequest::new("billing", "10.0.0.6", 8001));

    let found: HashSet<String> = registry.discover("orders").into_iter().map(|i| i.id).collect();
    assert_eq!(found, expected);
    assert!(registry.discover("unknown-service").is_empty());
}

#[test]
fn test_deregistration_removes_visibility() {
    let registry = ServiceRegistry::default();
    let instance = register_healthy(&registry, RegistrationRequest::new("orders", "10.0.0.5", 8001));

    registry.deregister(&instance.id).unwrap();

    assert!(registry.discover("orders").iter().all(|i| i.id != instance.id));
    assert_eq!(
        registry.deregister(&instance.id),
        Err(RegistryError::NotFound(instance.id.clone()))
    );
    assert!(registry.get_service(&instance.id).is_err());
}

#[test]
fn test_recovery_round_trip() {
    let registry = ServiceRegistry::default();
    let a = register_healthy(&registry, RegistrationRequest::new("orders", "10.0.0.5", 8001));
    register_healthy(&registry, RegistrationRequest::new("orders", "10.0.0.5", 8002));
    let before = registry.discover("orders").len();

    registry.update_status(&a.id, ServiceStatus::Unhealthy).unwrap();
    assert!(registry.discover("orders").iter().all(|i| i.id != a.id));
    assert_eq!(registry.discover("orders").len(), before - 1);

    registry.update_status(&a.id, ServiceStatus::Healthy).unwrap();
    assert!(registry.discover("orders").iter().any(|i| i.id == a.id));
    assert_eq!(registry.discover("orders").len(), before);
}

#[test]
fn test_tag_filtering_is_set_containment() {
    let registry = ServiceRegistry::default();
    let tagged = register_healthy(
        &registry,
        RegistrationRequest::new("search", "10.0.0.7", 9200)
            .with_tag("v2")
            .with_tag("eu")
            .with_tag("primary"),
    );
    register_healthy(&registry, RegistrationRequest::new("search", "10.0.0.8", 9200).with_tag("v1"));

    let tags = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();

    let subset = registry.discover_with_tags("search", &tags(&["eu", "v2"]));
    assert_eq!(subset.len(), 1);
    assert_eq!(subset[0].id, tagged.id);

    assert!(registry.discover_with_tags("search", &tags(&["eu", "v3"])).is_empty());
    assert_eq!(registry.discover_with_tags("search", &[]).len(), 2);
}

#[tokio::test]
async fn test_http_probe_threshold_and_recovery() {
    let server = MockHealthServer::start(200).await;
    let registry = ServiceRegistry::new(probe_config());
    let instance = registry
        .register(RegistrationRequest::new("orders", "127.0.0.1", 8001).with_health_check(&server.url))
        .unwrap();
    assert_eq!(instance.status, ServiceStatus::Unknown);

    let summary = registry.run_health_check().await;
    assert_eq!(summary.probed, 1);
    assert_eq!(summary.transitions, 1);
    assert_eq!(registry.get_service(&instance.id).unwrap().status, ServiceStatus::Healthy);

    server.set_status(503);
    for expected_failures in 1..=2 {
        registry.run_health_check().await;
        let current = registry.get_service(&instance.id).unwrap();
        assert_eq!(current.status, ServiceStatus::Healthy);
        assert_eq!(current.failure_count, expected_failures);
    }

    registry.run_health_check().await;
    let current = registry.get_service(&instance.id).unwrap();
    assert_eq!(current.status, ServiceStatus::Unhealthy);
    assert_eq!(current.failure_count, 3);
    assert!(registry.discover("orders").is_empty());

    server.set_status(204);
    registry.run_health_check().await;
    let current = registry.get_service(&instance.id).unwrap();
    assert_eq!(current.status, ServiceStatus::Healthy);
    assert_eq!(current.failure_count, 0);
    assert!(server.hits() >= 5);
}

#[tokio::test]
async fn test_transport_errors_count_as_failures() {
    let registry = ServiceRegistry::new(probe_config());
    let instance = registry
        .register(
            RegistrationRequest::new("orders", "127.0.0.1", 8001)
                .with_health_check(closed_port_url())
                .with_max_failures(1),
        )
        .unwrap();
    let healthy = register_healthy(&registry, RegistrationRequest::new("orders", "127.0.0.1", 8002));

    let summary = registry.run_health_check().await;
    assert_eq!(summary.failures, 1);

    assert_eq!(registry.get_service(&instance.id).unwrap().status, ServiceStatus::Unhealthy);
    // 其他实例不受影响
    let other = registry.get_service(&healthy.id).unwrap();
    assert_eq!(other.status, ServiceStatus::Healthy);
    assert_eq!(other.failure_count, 0);
}

#[tokio::test]
async fn test_heartbeat_timeout_marks_unhealthy() {
    let registry = ServiceRegistry::new(fast_config());
    let instance = registry
        .register(RegistrationRequest::new("worker", "10.0.0.9", 7000))
        .unwrap();

    registry.heartbeat(&instance.id).unwrap();
    assert_eq!(registry.get_service(&instance.id).unwrap().status, ServiceStatus::Healthy);

    // 超时之前的检查不改变状态
    registry.run_health_check().await;
    assert_eq!(registry.get_service(&instance.id).unwrap().status, ServiceStatus::Healthy);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    registry.run_health_check().await;
    let current = registry.get_service(&instance.id).unwrap();
    assert_eq!(current.status, ServiceStatus::Unhealthy);
    assert_eq!(current.failure_count, 1);

    registry.heartbeat(&instance.id).unwrap();
    let current = registry.get_service(&instance.id).unwrap();
    assert_eq!(current.status, ServiceStatus::Healthy);
    assert_eq!(current.failure_count, 0);
}

#[tokio::test]
async fn test_heartbeat_timeout_with_health_url() {
    let server = MockHealthServer::start(503).await;
    let registry = ServiceRegistry::new(fast_config());
    let instance = registry
        .register(RegistrationRequest::new("orders", "127.0.0.1", 8001).with_health_check(&server.url))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;

    // 心跳超时叠加探测失败，一轮即判定不健康
    let summary = registry.run_health_check().await;
    assert_eq!(summary.failures, 1);
    let current = registry.get_service(&instance.id).unwrap();
    assert_eq!(current.status, ServiceStatus::Unhealthy);
    assert_eq!(current.failure_count, 1);
    assert!(registry.discover("orders").is_empty());

    // 探测恢复后自动回到健康，并刷新 last_seen
    server.set_status(200);
    registry.run_health_check().await;
    let current = registry.get_service(&instance.id).unwrap();
    assert_eq!(current.status, ServiceStatus::Healthy);
    assert_eq!(current.failure_count, 0);
    assert!(current.last_seen > instance.last_seen);
    assert_eq!(registry.discover("orders").len(), 1);
}

#[tokio::test]
async fn test_background_loop_start_and_stop() {
    let server = MockHealthServer::start(200).await;
    let registry = ServiceRegistry::new(fast_config());
    let instance = registry
        .register(RegistrationRequest::new("orders", "127.0.0.1", 8001).with_health_check(&server.url))
        .unwrap();

    registry.start_health_checks();
    registry.start_health_checks();

    let became_healthy = eventually(Duration::from_secs(3), || {
        let registry = registry.clone();
        let id = instance.id.clone();
        async move { registry.get_service(&id).map(|i| i.is_healthy()).unwrap_or(false) }
    })
    .await;
    assert!(became_healthy);

    timeout(Duration::from_secs(3), registry.shutdown())
        .await
        .expect("health check loop did not stop");
    registry.stop();

    // 停止后不再探测
    let hits = server.hits();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(server.hits(), hits);
}

#[tokio::test]
async fn test_event_stream_reports_changes() {
    let registry = ServiceRegistry::default();
    let mut events = Box::pin(registry.subscribe());

    let instance = registry
        .register(RegistrationRequest::new("orders", "10.0.0.5", 8001))
        .unwrap();
    registry.update_status(&instance.id, ServiceStatus::Draining).unwrap();
    registry.deregister(&instance.id).unwrap();

    let mut received = Vec::new();
    for _ in 0..3 {
        let event = timeout(Duration::from_secs(1), events.next())
            .await
            .expect("timed out waiting for event")
            .expect("event stream ended");
        received.push(event);
    }

    assert!(matches!(&received[0], RegistryEvent::Registered(i) if i.id == instance.id));
    assert!(matches!(
        &received[1],
        RegistryEvent::StatusChanged { old: ServiceStatus::Unknown, new: ServiceStatus::Draining, .. }
    ));
    assert!(matches!(&received[2], RegistryEvent::Deregistered(i) if i.id == instance.id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_registration_and_discovery() {
    let registry = ServiceRegistry::default();

    let mut handles = Vec::new();
    for worker in 0..8u16 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..25u16 {
                register_healthy(
                    &registry,
                    RegistrationRequest::new("bulk", "10.1.0.1", 1000 + worker * 100 + i),
                );
                let _ = registry.discover("bulk");
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(registry.discover("bulk").len(), 200);
    let stats = registry.stats();
    assert_eq!(stats.total_instances, 200);
    assert_eq!(stats.healthy, 200);
}

#[test]
fn test_instance_json_shape() {
    let registry = ServiceRegistry::default();
    let instance = registry
        .register(
            RegistrationRequest::new("orders", "10.0.0.5", 8001)
                .with_metadata("zone", "eu-1")
                .with_version("1.4.0"),
        )
        .unwrap();

    let json = serde_json::to_value(&instance).unwrap();
    assert_eq!(json["status"], "unknown");
    assert_eq!(json["port"], 8001);
    assert_eq!(json["weight"], 100);
    assert_eq!(json["metadata"]["zone"], "eu-1");
    assert_eq!(json["version"], "1.4.0");
}
