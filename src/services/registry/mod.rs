//! Registry service module
//!
//! The authoritative in-process service registry, split into:
//! - `types`: instances, statuses, registration requests and events
//! - `service`: registration, discovery and status operations
//! - `health`: background health check loop and HTTP prober
//! - `error`: registry error type

pub mod error;
pub mod health;
pub mod service;
pub mod types;

pub use error::RegistryError;
pub use health::{HealthChecker, HealthSweepSummary, ProbeOutcome};
pub use service::{ServiceRegistry, WatcherId};
pub use types::{
    DEFAULT_MAX_FAILURES, DEFAULT_WEIGHT, RegistrationRequest, RegistryEvent, RegistryStats,
    RegistryWatcher, ServiceInstance, ServiceStatus,
};
