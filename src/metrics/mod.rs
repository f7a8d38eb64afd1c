//! Tool call metrics and structured HTTP logs
//!
//! Counters track call outcomes per tool; the HTTP log client records one
//! sizes-only entry per upstream exchange.

pub mod http_log;
pub mod tool_metrics;

pub use http_log::{
    filter_allowed_headers, redact_token, HttpLogAttributes, HttpLogRecord, NoopLogClient,
    ToolMetricsClient, TracingLogClient, ALLOWED_LOG_HEADERS,
};
pub use tool_metrics::{NoopToolMetrics, ToolCallCounter, ToolCallKey, ToolCallSummary, ToolMetrics};
