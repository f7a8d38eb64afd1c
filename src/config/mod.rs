//! Configuration module for the gateway
//!
//! This module provides configuration management and loading utilities.

mod config;
mod environment;

pub use config::{
    AgentsConfig, EncryptionConfig, GatewayConfig, GuardianConfig, LoggingConfig, OAuthConfig,
    ProxyConfig, RetryConfig, WorkflowsConfig,
};
pub use environment::{active_overrides, parse_bool, EnvVars};
