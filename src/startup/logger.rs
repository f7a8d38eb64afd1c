//! Startup information logging

use crate::config::{active_overrides, GatewayConfig};
use tracing::{info, warn};

/// Display the startup banner
pub fn display_startup_banner(version: &str) {
    info!("🚀 Gram Gateway v{} starting...", version);
}

/// Startup logger for the worker process
pub struct StartupLogger;

impl StartupLogger {
    /// Display configuration and registered workflow information
    pub fn display_startup_info(config: &GatewayConfig, workflows: &[String], schedules: &[String]) {
        info!("📁 Configuration:");
        info!("   Task queue: {}", config.workflows.task_queue);
        info!("   Agent model: {}", config.agents.model);
        info!(
            "   Retry: {} attempts, {}ms..{}ms",
            config.retry.max_attempts, config.retry.initial_interval_ms, config.retry.max_interval_ms
        );

        if config.guardian.allow_loopback {
            warn!("   ⚠️  Guardian allows loopback addresses");
        }
        if config.guardian.blocked_cidrs.is_some() {
            warn!("   ⚠️  Guardian uses a custom blocked range list");
        }
        if config.encryption.key.is_none() {
            warn!("   ⚠️  No encryption key configured, a development key is derived");
        }
        if config.agents.api_key.is_none() {
            warn!("   ⚠️  No chat completion API key configured");
        }

        let overrides = active_overrides();
        if !overrides.is_empty() {
            info!("🔧 Environment Overrides:");
            for entry in overrides {
                info!("   ✅ {}", entry);
            }
        }

        info!("🎯 Workflows registered: {}", workflows.join(", "));
        info!("⏰ Schedules: {}", schedules.join(", "));
    }
}
