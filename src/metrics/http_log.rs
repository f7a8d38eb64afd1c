//! Structured HTTP logs for tool calls
//!
//! Only sizes of request and response bodies are kept. Request headers pass
//! through an allowlist; headers set by the security resolver are kept but
//! redacted.

use crate::toolconfig::ToolDescriptor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const REDACT_REVEAL_PREFIX_LEN: usize = 3;
const REDACT_MIN_TOKEN_LEN: usize = 10;

/// Standard header names that are safe to log
pub const ALLOWED_LOG_HEADERS: &[&str] = &[
    "accept-encoding",
    "accept-language",
    "content-type",
    "content-length",
    "content-encoding",
    "cache-control",
    "etag",
    "last-modified",
    "age",
    "expires",
    "pragma",
    "vary",
    "user-agent",
    "referer",
    "location",
    "content-location",
    "range",
    "accept-ranges",
    "content-range",
    "server",
    "allow",
    "retry-after",
    "x-gram-proxy",
];

/// Keep only allowlisted headers
pub fn filter_allowed_headers<'a, I>(headers: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    headers
        .into_iter()
        .filter(|(name, _)| ALLOWED_LOG_HEADERS.contains(&name.to_ascii_lowercase().as_str()))
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

/// Redact a credential, keeping a `Bearer`/`Basic` prefix and a short reveal
pub fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let lower = trimmed.to_ascii_lowercase();
    for prefix in ["bearer ", "basic "] {
        if lower.starts_with(prefix) {
            let actual_prefix = &trimmed[..prefix.len()];
            let remainder = trimmed[prefix.len()..].trim();
            if remainder.len() < REDACT_MIN_TOKEN_LEN {
                return format!("{}***", actual_prefix);
            }
            return format!("{}{}***", actual_prefix, reveal(remainder));
        }
    }

    if trimmed.len() < REDACT_MIN_TOKEN_LEN {
        return "***".to_string();
    }
    format!("{}***", reveal(trimmed))
}

fn reveal(value: &str) -> &str {
    let end = value
        .char_indices()
        .nth(REDACT_REVEAL_PREFIX_LEN)
        .map(|(i, _)| i)
        .unwrap_or(value.len());
    &value[..end]
}

/// Attributes collected while a tool call is in flight
#[derive(Debug, Clone, Default)]
pub struct HttpLogAttributes {
    pub http_method: String,
    pub http_route: String,
    pub http_server_url: String,
    pub user_agent: String,
    pub status_code: Option<u16>,
    pub duration_ms: f64,
    pub request_headers: BTreeMap<String, String>,
    pub response_headers: BTreeMap<String, String>,
    pub request_body_bytes: u64,
    pub response_body_bytes: u64,
    pub message: String,
}

impl HttpLogAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_method(&mut self, method: &str) {
        self.http_method = method.to_string();
    }

    pub fn record_route(&mut self, route: &str) {
        self.http_route = route.to_string();
    }

    pub fn record_server_url(&mut self, url: &str) {
        self.http_server_url = url.to_string();
    }

    pub fn record_user_agent(&mut self, agent: &str) {
        self.user_agent = agent.to_string();
    }

    pub fn record_status_code(&mut self, code: u16) {
        self.status_code = Some(code);
    }

    pub fn record_duration_ms(&mut self, duration_ms: f64) {
        self.duration_ms = duration_ms;
    }

    /// Sensitive headers are redacted rather than filtered
    pub fn record_request_headers<'a, I>(&mut self, headers: I, sensitive: bool)
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (name, value) in headers {
            let value = if sensitive {
                redact_token(value)
            } else {
                value.to_string()
            };
            self.request_headers.insert(name.to_string(), value);
        }
    }

    pub fn record_response_headers(&mut self, headers: BTreeMap<String, String>) {
        self.response_headers.extend(headers);
    }

    pub fn record_request_body_bytes(&mut self, bytes: u64) {
        self.request_body_bytes = bytes;
    }

    pub fn record_response_body_bytes(&mut self, bytes: u64) {
        self.response_body_bytes = bytes;
    }

    pub fn record_message(&mut self, message: String) {
        self.message = message;
    }

    /// Snapshot these attributes as a log record for `tool`
    pub fn to_record(&self, tool: &ToolDescriptor) -> HttpLogRecord {
        HttpLogRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            organization_id: tool.organization_id.clone(),
            project_id: tool.project_id.clone(),
            deployment_id: tool.deployment_id.clone(),
            tool_id: tool.id.clone(),
            tool_urn: tool.urn.to_string(),
            tool_type: tool.urn.kind.clone(),
            http_method: self.http_method.clone(),
            http_route: self.http_route.clone(),
            http_server_url: self.http_server_url.clone(),
            user_agent: self.user_agent.clone(),
            status_code: self.status_code.unwrap_or(0),
            duration_ms: self.duration_ms,
            request_headers: self.request_headers.clone(),
            response_headers: self.response_headers.clone(),
            request_body_bytes: self.request_body_bytes,
            response_body_bytes: self.response_body_bytes,
            message: self.message.clone(),
        }
    }
}

/// One upstream exchange, ready to be stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpLogRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub organization_id: String,
    pub project_id: String,
    pub deployment_id: String,
    pub tool_id: String,
    pub tool_urn: String,
    pub tool_type: String,
    pub http_method: String,
    pub http_route: String,
    pub http_server_url: String,
    pub user_agent: String,
    pub status_code: u16,
    pub duration_ms: f64,
    pub request_headers: BTreeMap<String, String>,
    pub response_headers: BTreeMap<String, String>,
    pub request_body_bytes: u64,
    pub response_body_bytes: u64,
    pub message: String,
}

/// Destination for HTTP log records
#[async_trait]
pub trait ToolMetricsClient: Send + Sync {
    async fn log(&self, record: HttpLogRecord);
}

/// Hands records to a background task that emits them as tracing events.
///
/// `log` never waits on the sink; records are dropped with a warning when the
/// queue is full.
#[derive(Debug, Clone)]
pub struct TracingLogClient {
    sender: mpsc::Sender<HttpLogRecord>,
}

impl TracingLogClient {
    /// Spawn the worker on the current runtime
    pub fn spawn(capacity: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<HttpLogRecord>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(record) = receiver.recv().await {
                emit(&record);
            }
            debug!("HTTP log worker stopped");
        });
        Self { sender }
    }
}

fn emit(record: &HttpLogRecord) {
    let request_headers = serde_json::to_string(&record.request_headers).unwrap_or_default();
    let response_headers = serde_json::to_string(&record.response_headers).unwrap_or_default();
    info!(
        log_id = %record.id,
        organization_id = %record.organization_id,
        project_id = %record.project_id,
        deployment_id = %record.deployment_id,
        tool_id = %record.tool_id,
        tool_urn = %record.tool_urn,
        http_method = %record.http_method,
        http_route = %record.http_route,
        http_server_url = %record.http_server_url,
        http_status = record.status_code,
        duration_ms = record.duration_ms,
        request_body_bytes = record.request_body_bytes,
        response_body_bytes = record.response_body_bytes,
        user_agent = %record.user_agent,
        request_headers = %request_headers,
        response_headers = %response_headers,
        "{}",
        record.message
    );
}

#[async_trait]
impl ToolMetricsClient for TracingLogClient {
    async fn log(&self, record: HttpLogRecord) {
        if let Err(e) = self.sender.try_send(record) {
            warn!(error = %e, "dropping HTTP log record");
        }
    }
}

/// Drops every record
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogClient;

#[async_trait]
impl ToolMetricsClient for NoopLogClient {
    async fn log(&self, _record: HttpLogRecord) {}
}
