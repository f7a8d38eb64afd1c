use crate::error::{GatewayError, Result};
use crate::guardian::{ClientOptions, Policy};
use base64::Engine as _;
use ipnetwork::IpNetwork;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::environment::{parse_bool, EnvVars};

/// Main gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub guardian: GuardianConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub workflows: WorkflowsConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Outbound transport for tool calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Overall per-request timeout in seconds
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub pool_idle_timeout_secs: u64,
    /// Idle connections kept per host (defaults to available parallelism + 1)
    pub pool_max_idle_per_host: Option<usize>,
    /// Honour HTTP(S)_PROXY from the environment
    pub use_env_proxy: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            connect_timeout_secs: 10,
            pool_idle_timeout_secs: 90,
            pool_max_idle_per_host: None,
            use_env_proxy: true,
        }
    }
}

impl ProxyConfig {
    pub fn client_options(&self) -> ClientOptions {
        let defaults = ClientOptions::default();
        ClientOptions {
            timeout: Duration::from_secs(self.timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            pool_idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
            pool_max_idle_per_host: self
                .pool_max_idle_per_host
                .unwrap_or(defaults.pool_max_idle_per_host),
            use_env_proxy: self.use_env_proxy,
        }
    }
}

/// Retry behaviour for upstream tool calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub backoff_multiplier: f64,
    pub retryable_status_codes: Vec<u16>,
    pub retryable_methods: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval_ms: 500,
            max_interval_ms: 5000,
            backoff_multiplier: 2.0,
            retryable_status_codes: vec![408, 429, 500, 502, 503, 504, 509, 521, 522, 523, 524],
            retryable_methods: vec!["GET".to_string()],
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(GatewayError::config("retry.max_attempts must be at least 1"));
        }
        if self.max_interval_ms < self.initial_interval_ms {
            return Err(GatewayError::config(format!(
                "retry.max_interval_ms ({}) must not be below retry.initial_interval_ms ({})",
                self.max_interval_ms, self.initial_interval_ms
            )));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(GatewayError::config(format!(
                "retry.backoff_multiplier must be at least 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }
}

/// SSRF policy settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GuardianConfig {
    pub allow_loopback: bool,
    /// Replaces the default blocked ranges when set
    pub blocked_cidrs: Option<Vec<String>>,
}

impl GuardianConfig {
    pub fn build_policy(&self) -> Result<Policy> {
        let policy = match &self.blocked_cidrs {
            Some(cidrs) => Policy::unsafe_policy(cidrs)?,
            None => Policy::new(),
        };
        Ok(policy.with_allow_loopback(self.allow_loopback))
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(cidrs) = &self.blocked_cidrs {
            for cidr in cidrs {
                cidr.parse::<IpNetwork>().map_err(|e| {
                    GatewayError::config(format!("Invalid guardian CIDR '{}': {}", cidr, e))
                })?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub token_request_timeout_secs: u64,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            token_request_timeout_secs: 10,
        }
    }
}

impl OAuthConfig {
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            timeout: Duration::from_secs(self.token_request_timeout_secs),
            ..ClientOptions::token_exchange()
        }
    }
}

/// Agent runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub model: String,
    /// OpenAI-compatible chat completions base URL
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<SecretString>,
    /// Maximum sub-agent nesting depth; 0 disables spawning
    pub max_depth: usize,
    pub max_iterations: usize,
    pub sub_agent_max_iterations: usize,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            model: "openai/gpt-4o".to_string(),
            base_url: "https://openrouter.ai/api/v1".to_string(),
            api_key: None,
            max_depth: 3,
            max_iterations: 20,
            sub_agent_max_iterations: 15,
        }
    }
}

/// Workflow worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowsConfig {
    pub task_queue: String,
    /// Domains processed per reconcile run before continuing as new
    pub reconcile_batch_size: usize,
    pub reconcile_item_delay_ms: u64,
    pub reconcile_interval_secs: u64,
}

impl Default for WorkflowsConfig {
    fn default() -> Self {
        Self {
            task_queue: "main".to_string(),
            reconcile_batch_size: 100,
            reconcile_item_delay_ms: 100,
            reconcile_interval_secs: 3600,
        }
    }
}

/// Environment entry encryption
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Base64 encoded 32 byte key
    #[serde(skip_serializing)]
    pub key: Option<SecretString>,
}

impl EncryptionConfig {
    /// Decoded key bytes, if a key is configured
    pub fn key_bytes(&self) -> Result<Option<Vec<u8>>> {
        let Some(key) = &self.key else {
            return Ok(None);
        };
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(key.expose_secret().trim())
            .map_err(|e| GatewayError::config(format!("Invalid encryption key encoding: {}", e)))?;
        if bytes.len() != 32 {
            return Err(GatewayError::config(format!(
                "Encryption key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Some(bytes))
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (text, pretty, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.to_lowercase().as_str()) {
            return Err(GatewayError::config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["text", "pretty", "json"];
        if !valid_formats.contains(&self.format.as_str()) {
            return Err(GatewayError::config(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.format,
                valid_formats.join(", ")
            )));
        }
        Ok(())
    }
}

impl GatewayConfig {
    /// Load .env files in order of precedence
    fn load_env_files() {
        let env = std::env::var(EnvVars::ENV).unwrap_or_else(|_| "development".to_string());

        let env_specific_file = format!(".env.{}", env);
        let env_files = [".env", env_specific_file.as_str(), ".env.local"];

        for env_file in env_files {
            match dotenvy::from_filename(env_file) {
                Ok(_) => tracing::info!("Loaded environment variables from {}", env_file),
                Err(e) if e.not_found() => {
                    tracing::debug!("No {} file found, skipping", env_file);
                }
                Err(e) => tracing::warn!("Failed to load {}: {}", env_file, e),
            }
        }
    }

    /// Load configuration from file with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_env_files();

        let mut config = if path.as_ref().exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;
            Self::from_yaml(&content)?
        } else {
            tracing::warn!("Config file not found, using defaults");
            Self::default()
        };

        config.apply_environment_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| GatewayError::config(format!("Failed to parse config file: {}", e)))
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_environment_overrides(&mut self) -> Result<()> {
        if let Some(level) = non_empty_var(EnvVars::LOG_LEVEL) {
            self.logging.level = level;
        }
        if let Some(format) = non_empty_var(EnvVars::LOG_FORMAT) {
            self.logging.format = format;
        }
        if let Some(key) = non_empty_var(EnvVars::ENCRYPTION_KEY) {
            self.encryption.key = Some(SecretString::new(key));
        }
        if let Some(value) = non_empty_var(EnvVars::ALLOW_LOOPBACK) {
            self.guardian.allow_loopback = parse_bool(EnvVars::ALLOW_LOOPBACK, &value)?;
        }
        if let Some(key) = non_empty_var(EnvVars::OPENROUTER_API_KEY) {
            self.agents.api_key = Some(SecretString::new(key));
        }
        if let Some(url) = non_empty_var(EnvVars::OPENROUTER_BASE_URL) {
            self.agents.base_url = url;
        }
        if let Some(model) = non_empty_var(EnvVars::AGENT_MODEL) {
            self.agents.model = model;
        }
        if let Some(timeout) = non_empty_var(EnvVars::PROXY_TIMEOUT_SECS) {
            self.proxy.timeout_secs = timeout.parse().map_err(|e| {
                GatewayError::config(format!(
                    "Invalid {} environment variable: {}",
                    EnvVars::PROXY_TIMEOUT_SECS,
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        self.guardian.validate()?;
        self.encryption.key_bytes()?;
        self.logging.validate()?;

        if self.proxy.timeout_secs == 0 {
            return Err(GatewayError::config("proxy.timeout_secs must be greater than 0"));
        }
        if self.workflows.reconcile_batch_size == 0 {
            return Err(GatewayError::config(
                "workflows.reconcile_batch_size must be greater than 0",
            ));
        }
        if self.agents.max_iterations == 0 || self.agents.sub_agent_max_iterations == 0 {
            return Err(GatewayError::config("agent iteration limits must be greater than 0"));
        }
        Ok(())
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
