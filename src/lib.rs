//! Service registry, health tracking and client-side discovery.
//!
//! - [`services::registry`]: the authoritative in-process registry and its
//!   background health check loop
//! - [`services::balancer`]: instance selection strategies
//! - [`services::discovery`]: cached discovery client with change callbacks

pub mod config;
pub mod server;
pub mod services;

pub use config::Config;
