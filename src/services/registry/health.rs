use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::{Duration, SystemTime};

use futures::stream::{self, StreamExt};
use reqwest::Client;
use tokio::time::MissedTickBehavior;

use super::service::ServiceRegistry;
use super::types::{RegistryEvent, ServiceInstance, ServiceStatus};

/// HTTP 健康探测器
#[derive(Debug, Clone)]
pub struct HealthChecker {
    client: Client,
    timeout: Duration,
    max_concurrent: usize,
}

/// 单次探测结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success,
    Failure(String),
}

impl HealthChecker {
    pub fn new(timeout: Duration, max_concurrent: usize) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .or_else(|e| {
                tracing::error!(error = %e, "Failed to build health check client, retrying with request timeout only");
                Client::builder().timeout(timeout).build()
            })
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "Failed to build health check client, falling back to defaults");
                Client::new()
            });

        Self {
            client,
            timeout,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// 2xx 视为成功，其余状态码或传输错误都是失败
    ///
    /// 探测总时长不超过构造时给定的超时，与客户端自身配置无关。
    pub async fn probe(&self, url: &str) -> ProbeOutcome {
        match tokio::time::timeout(self.timeout, self.client.get(url).send()).await {
            Ok(Ok(response)) if response.status().is_success() => ProbeOutcome::Success,
            Ok(Ok(response)) => ProbeOutcome::Failure(format!("status {}", response.status())),
            Ok(Err(e)) => ProbeOutcome::Failure(e.to_string()),
            Err(_) => ProbeOutcome::Failure(format!("timed out after {:?}", self.timeout)),
        }
    }

    async fn probe_all(&self, targets: Vec<(String, String)>) -> HashMap<String, ProbeOutcome> {
        stream::iter(targets)
            .map(|(id, url)| async move {
                let outcome = self.probe(&url).await;
                tracing::debug!(instance_id = %id, url = %url, outcome = ?outcome, "Health probe finished");
                (id, outcome)
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await
    }
}

/// 一轮健康检查的汇总
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthSweepSummary {
    pub checked: usize,
    pub probed: usize,
    pub failures: usize,
    pub transitions: usize,
}

impl ServiceRegistry {
    /// 启动后台健康检查循环；重复调用无效。必须在 Tokio 运行时内调用。
    pub fn start_health_checks(&self) {
        if self.shutdown.is_cancelled() {
            tracing::warn!("Registry already stopped, health checks not started");
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::debug!("Health checks already running");
            return;
        }

        let registry = self.clone();
        let shutdown = self.shutdown.clone();
        let period = self.config.health_check_interval();

        tracing::info!(interval_secs = period.as_secs(), "Starting health check loop");

        self.task_tracker.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    summary = registry.run_health_check() => {
                        tracing::debug!(
                            checked = summary.checked,
                            probed = summary.probed,
                            failures = summary.failures,
                            transitions = summary.transitions,
                            "Health check sweep completed"
                        );
                    }
                }
            }
            tracing::info!("Health check loop stopped");
        });
    }

    /// 停止后台循环；幂等，未启动时调用也安全
    pub fn stop(&self) {
        self.shutdown.cancel();
        self.task_tracker.close();
    }

    /// 停止并等待后台任务退出
    pub async fn shutdown(&self) {
        self.stop();
        self.task_tracker.wait().await;
    }

    /// 立即执行一轮健康检查
    ///
    /// 探测在不持有锁的情况下并发进行，结果在一次写锁内统一写回，
    /// 写回时按实例当前的状态和 last_seen 重新判定。
    pub async fn run_health_check(&self) -> HealthSweepSummary {
        let targets: Vec<(String, String)> = self
            .read_instances()
            .values()
            .filter_map(|instance| {
                instance
                    .health_check_url
                    .as_ref()
                    .filter(|_| instance.has_health_check())
                    .map(|url| (instance.id.clone(), url.clone()))
            })
            .collect();

        let mut summary = HealthSweepSummary {
            probed: targets.len(),
            ..Default::default()
        };
        let outcomes = self.checker.probe_all(targets).await;

        let heartbeat_timeout = self.config.heartbeat_timeout();
        let mut events = Vec::new();
        {
            let mut instances = self.write_instances();
            let now = SystemTime::now();
            summary.checked = instances.len();

            for instance in instances.values_mut() {
                let timed_out = instance.since_last_seen(now) > heartbeat_timeout;
                let outcome = match outcomes.get(&instance.id) {
                    Some(outcome) => outcome.clone(),
                    // 未配置健康检查地址的实例仅依赖心跳
                    None if instance.has_health_check() => continue,
                    None if timed_out => ProbeOutcome::Failure("heartbeat timeout".to_string()),
                    None => continue,
                };

                if matches!(outcome, ProbeOutcome::Failure(_)) {
                    summary.failures += 1;
                }
                if let Some(event) = apply_outcome(instance, &outcome, timed_out, now) {
                    summary.transitions += 1;
                    events.push(event);
                }
            }
        }

        for event in events {
            self.notify(event);
        }
        summary
    }
}

// 写锁内调用：根据探测结果推进单个实例的状态机
fn apply_outcome(
    instance: &mut ServiceInstance,
    outcome: &ProbeOutcome,
    timed_out: bool,
    now: SystemTime,
) -> Option<RegistryEvent> {
    let old = instance.status;
    match outcome {
        ProbeOutcome::Success => {
            instance.failure_count = 0;
            instance.last_seen = now;
            if old == ServiceStatus::Healthy || old == ServiceStatus::Draining {
                return None;
            }
            instance.status = ServiceStatus::Healthy;
            tracing::info!(
                service_name = %instance.name,
                instance_id = %instance.id,
                old_status = %old,
                "Service instance passed health check"
            );
        }
        ProbeOutcome::Failure(reason) => {
            instance.failure_count = instance.failure_count.saturating_add(1);
            let tripped = timed_out || instance.failure_count >= instance.max_failures;
            if !tripped || old == ServiceStatus::Unhealthy || old == ServiceStatus::Draining {
                return None;
            }
            instance.status = ServiceStatus::Unhealthy;
            tracing::warn!(
                service_name = %instance.name,
                instance_id = %instance.id,
                failure_count = instance.failure_count,
                heartbeat_timeout = timed_out,
                reason = %reason,
                "Service instance marked unhealthy"
            );
        }
    }

    Some(RegistryEvent::StatusChanged {
        instance: instance.clone(),
        old,
        new: instance.status,
    })
}
