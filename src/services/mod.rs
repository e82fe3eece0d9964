pub mod balancer;
pub mod discovery;
pub mod registry;

pub use balancer::{BalancerError, LoadBalancer, LoadBalancerManager};
pub use discovery::{DiscoveryError, ServiceDiscoveryClient};
pub use registry::{
    RegistrationRequest, RegistryError, RegistryEvent, ServiceInstance, ServiceRegistry,
    ServiceStatus,
};
