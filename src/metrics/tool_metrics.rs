//! Per-tool call counters
//!
//! The proxy reports one outcome per completed tool call. Counters are keyed
//! by organization, tool URN and status code so dashboards can split success
//! and failure rates per tenant.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Sink for tool call outcomes
#[async_trait]
pub trait ToolMetrics: Send + Sync {
    async fn record_tool_call(&self, organization_id: &str, tool_urn: &str, status_code: u16);
}

/// Counter key for one (organization, tool, status) triple
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolCallKey {
    pub organization_id: String,
    pub tool_urn: String,
    pub status_code: u16,
}

/// Aggregated counts for one tool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallSummary {
    pub tool_urn: String,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
}

impl ToolCallSummary {
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.successful_calls as f64 / self.total_calls as f64
    }
}

/// In-process tool call counter
#[derive(Debug, Clone, Default)]
pub struct ToolCallCounter {
    counts: Arc<RwLock<HashMap<ToolCallKey, u64>>>,
}

impl ToolCallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count for one exact triple
    pub async fn count(&self, organization_id: &str, tool_urn: &str, status_code: u16) -> u64 {
        let key = ToolCallKey {
            organization_id: organization_id.to_string(),
            tool_urn: tool_urn.to_string(),
            status_code,
        };
        self.counts.read().await.get(&key).copied().unwrap_or(0)
    }

    /// Totals for a tool across organizations and statuses
    pub async fn summary(&self, tool_urn: &str) -> ToolCallSummary {
        let counts = self.counts.read().await;
        let mut summary = ToolCallSummary {
            tool_urn: tool_urn.to_string(),
            ..Default::default()
        };
        for (key, count) in counts.iter().filter(|(k, _)| k.tool_urn == tool_urn) {
            summary.total_calls += count;
            if (200..400).contains(&key.status_code) {
                summary.successful_calls += count;
            } else {
                summary.failed_calls += count;
            }
        }
        summary
    }

    pub async fn reset(&self) {
        self.counts.write().await.clear();
    }
}

#[async_trait]
impl ToolMetrics for ToolCallCounter {
    async fn record_tool_call(&self, organization_id: &str, tool_urn: &str, status_code: u16) {
        let key = ToolCallKey {
            organization_id: organization_id.to_string(),
            tool_urn: tool_urn.to_string(),
            status_code,
        };
        let mut counts = self.counts.write().await;
        *counts.entry(key).or_insert(0) += 1;
        debug!(
            organization_id = %organization_id,
            tool_urn = %tool_urn,
            http_status = status_code,
            "Recorded tool call"
        );
    }
}

/// Discards every outcome
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopToolMetrics;

#[async_trait]
impl ToolMetrics for NoopToolMetrics {
    async fn record_tool_call(&self, _organization_id: &str, _tool_urn: &str, _status_code: u16) {}
}
