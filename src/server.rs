use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LoggingConfig};
use crate::services::discovery::ServiceDiscoveryClient;
use crate::services::registry::{RegistryEvent, ServiceRegistry};

/// 初始化日志；RUST_LOG 优先于配置中的级别。重复调用无副作用。
pub fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "Tracing subscriber already initialised");
    }
}

/// 运行注册表守护进程直到收到 Ctrl-C
pub async fn start(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    // 初始化服务注册表
    let registry = ServiceRegistry::new(config.registry.clone());
    registry.start_health_checks();

    let client = ServiceDiscoveryClient::new(registry.clone(), &config.discovery)?;

    // 事件日志
    let mut events = Box::pin(registry.subscribe());
    let event_logger = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match &event {
                RegistryEvent::Registered(instance) => {
                    tracing::debug!(service_name = %instance.name, instance_id = %instance.id, "event: registered");
                }
                RegistryEvent::Deregistered(instance) => {
                    tracing::debug!(service_name = %instance.name, instance_id = %instance.id, "event: deregistered");
                }
                RegistryEvent::StatusChanged { instance, old, new } => {
                    tracing::debug!(
                        service_name = %instance.name,
                        instance_id = %instance.id,
                        old_status = %old,
                        new_status = %new,
                        "event: status changed"
                    );
                }
            }
        }
    });

    tracing::info!(
        health_check_interval_secs = config.registry.health_check_interval_secs,
        cache_expiry_secs = config.discovery.cache_expiry_secs,
        load_balancer = %client.current_load_balancer(),
        "Service registry started"
    );

    let mut stats_interval = tokio::time::interval(config.registry.health_check_interval());
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Failed to listen for shutdown signal");
                }
                break;
            }
            _ = stats_interval.tick() => {
                let stats = registry.stats();
                let cache = client.cache_stats();
                tracing::info!(
                    services = stats.total_services,
                    instances = stats.total_instances,
                    healthy = stats.healthy,
                    unhealthy = stats.unhealthy,
                    unknown = stats.unknown,
                    draining = stats.draining,
                    cache_entries = cache.entries,
                    cache_hits = cache.hits,
                    cache_misses = cache.misses,
                    "Registry stats"
                );
            }
        }
    }

    tracing::info!("Shutting down service registry...");
    client.close().await;
    registry.shutdown().await;
    event_logger.abort();
    tracing::info!("Service registry stopped");

    Ok(())
}
