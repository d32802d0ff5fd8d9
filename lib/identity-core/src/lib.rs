//! Core configuration and host resolution for the identity-aware proxy
//!
//! This library provides:
//! - Process-lifetime proxy configuration (proxy and tunnel modes)
//! - Per-request target configuration
//! - Host resolution from an inbound request to an upstream

pub mod config;
pub mod error;
pub mod resolver;
pub mod target;

pub use config::{ProxyConfig, ProxyConfigBuilder, ProxyMode};
pub use error::{CoreError, Result};
pub use resolver::HostResolver;
pub use target::TargetConfig;
