#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use registry_core::config::RegistryConfig;
use registry_core::services::registry::{
    RegistrationRequest, ServiceInstance, ServiceRegistry, ServiceStatus,
};

/// 最小化的 HTTP 健康检查端点，返回可调的状态码
pub struct MockHealthServer {
    pub url: String,
    status: Arc<AtomicU16>,
    hits: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl MockHealthServer {
    pub async fn start(status: u16) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let status = Arc::new(AtomicU16::new(status));
        let hits = Arc::new(AtomicUsize::new(0));

        let (status_clone, hits_clone) = (status.clone(), hits.clone());
        let handle = tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let code = status_clone.load(Ordering::SeqCst);
                hits_clone.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    let _ = socket.read(&mut buf).await;
                    let reason = if (200..300).contains(&code) { "OK" } else { "Error" };
                    let response = format!(
                        "HTTP/1.1 {code} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self {
            url: format!("http://{addr}/health"),
            status,
            hits,
            handle,
        }
    }

    pub fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for MockHealthServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// 一个当前无人监听的地址
pub fn closed_port_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}/health")
}

pub fn fast_config() -> RegistryConfig {
    RegistryConfig {
        health_check_interval_secs: 1,
        heartbeat_timeout_secs: 1,
        probe_timeout_secs: 1,
        ..Default::default()
    }
}

pub fn register_healthy(registry: &ServiceRegistry, request: RegistrationRequest) -> ServiceInstance {
    let instance = registry.register(request).unwrap();
    registry
        .update_status(&instance.id, ServiceStatus::Healthy)
        .unwrap();
    registry.get_service(&instance.id).unwrap()
}

/// 轮询直到条件成立或超时
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check().await
}
