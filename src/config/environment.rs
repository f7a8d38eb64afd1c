//! Environment variable names recognised by the gateway

use crate::error::{GatewayError, Result};

/// Environment variable names used by the gateway
pub struct EnvVars;

impl EnvVars {
    /// Selects `.env.{GRAM_ENV}`
    pub const ENV: &'static str = "GRAM_ENV";
    pub const LOG_LEVEL: &'static str = "GRAM_LOG_LEVEL";
    pub const LOG_FORMAT: &'static str = "GRAM_LOG_FORMAT";
    pub const ENCRYPTION_KEY: &'static str = "GRAM_ENCRYPTION_KEY";
    pub const ALLOW_LOOPBACK: &'static str = "GRAM_ALLOW_LOOPBACK";
    pub const OPENROUTER_API_KEY: &'static str = "GRAM_OPENROUTER_API_KEY";
    pub const OPENROUTER_BASE_URL: &'static str = "GRAM_OPENROUTER_BASE_URL";
    pub const AGENT_MODEL: &'static str = "GRAM_AGENT_MODEL";
    pub const PROXY_TIMEOUT_SECS: &'static str = "GRAM_PROXY_TIMEOUT_SECS";

    pub fn all() -> &'static [&'static str] {
        &[
            Self::ENV,
            Self::LOG_LEVEL,
            Self::LOG_FORMAT,
            Self::ENCRYPTION_KEY,
            Self::ALLOW_LOOPBACK,
            Self::OPENROUTER_API_KEY,
            Self::OPENROUTER_BASE_URL,
            Self::AGENT_MODEL,
            Self::PROXY_TIMEOUT_SECS,
        ]
    }

    /// Whether the variable holds a secret that must not be echoed
    pub fn is_secret(name: &str) -> bool {
        name == Self::ENCRYPTION_KEY || name == Self::OPENROUTER_API_KEY
    }
}

/// Parse a boolean environment value (true/false, 1/0, yes/no, on/off)
pub fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(GatewayError::config(format!(
            "Invalid {}: {} (valid options: true, false)",
            name, value
        ))),
    }
}

/// Names of the recognised variables currently set, secrets included by name only
pub fn active_overrides() -> Vec<String> {
    EnvVars::all()
        .iter()
        .filter_map(|name| {
            let value = std::env::var(name).ok().filter(|v| !v.is_empty())?;
            if EnvVars::is_secret(name) {
                Some(format!("{}=<set>", name))
            } else {
                Some(format!("{}={}", name, value))
            }
        })
        .collect()
}
