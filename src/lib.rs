//! Gram Gateway - tool proxy, agent runtime and durable workflows
//!
//! This crate proxies LLM tool calls to HTTP APIs, serverless functions and
//! prompt templates, runs tool-calling agents with parallel sub-agents over
//! server-sent events, and drives background work through a workflow engine.

pub mod agents;
pub mod background;
pub mod cache;
pub mod config;
pub mod encryption;
pub mod environments;
pub mod error;
pub mod gateway;
pub mod guardian;
pub mod metrics;
pub mod startup;
pub mod toolconfig;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
