//! Wire types for tool calls

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Response headers relayed from the upstream to the caller
pub const PROXIED_HEADERS: &[&str] = &[
    "Cache-Control",
    "Content-Language",
    "Content-Length",
    "Content-Type",
    "Expires",
    "Last-Modified",
    "Pragma",
    FUNCTIONS_CPU_HEADER,
    FUNCTIONS_MEMORY_HEADER,
    FUNCTIONS_EXECUTION_TIME_HEADER,
];

pub const HEADER_PROXY: &str = "X-Gram-Proxy";
pub const HEADER_PROXIED_RESPONSE: &str = "Gram-Proxied-Response";
pub const HEADER_FILTERED_RESPONSE: &str = "Gram-Filtered-Response";
pub const HEADER_INVOKE_ID: &str = "Gram-Invoke-ID";
pub const FUNCTIONS_CPU_HEADER: &str = "Gram-Functions-Cpu";
pub const FUNCTIONS_MEMORY_HEADER: &str = "Gram-Functions-Memory";
pub const FUNCTIONS_EXECUTION_TIME_HEADER: &str = "Gram-Functions-Execution-Time";

/// Fields the gateway adds to a call body; stripped before schema validation
pub const GATEWAY_FIELDS: &[&str] = &["gram-request-summary", "environmentVariables"];

/// Response filter requested by the caller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterRequest {
    #[serde(rename = "type", default)]
    pub filter_type: String,
    #[serde(default)]
    pub filter: String,
}

impl FilterRequest {
    pub fn none() -> Self {
        Self {
            filter_type: "none".to_string(),
            filter: String::new(),
        }
    }
}

/// A tool call body as sent by clients.
///
/// Numbers keep their source text and `body` keeps its exact bytes.
#[derive(Debug, Default, Deserialize)]
pub struct ToolCallBody {
    #[serde(rename = "pathParameters", default)]
    pub path_parameters: Option<Map<String, Value>>,
    #[serde(rename = "queryParameters", default)]
    pub query_parameters: Option<Map<String, Value>>,
    #[serde(rename = "headers", alias = "headerParameters", default)]
    pub header_parameters: Option<Map<String, Value>>,
    #[serde(default)]
    pub body: Option<Box<RawValue>>,
    #[serde(rename = "responseFilter", default)]
    pub response_filter: Option<FilterRequest>,
    #[serde(rename = "environmentVariables", default)]
    pub environment_variables: Option<HashMap<String, String>>,
    #[serde(rename = "gram-request-summary", default)]
    pub gram_request_summary: Option<String>,
}

impl ToolCallBody {
    /// Raw body bytes, empty when absent or `null`
    pub fn body_bytes(&self) -> &[u8] {
        match &self.body {
            Some(raw) if raw.get() != "null" => raw.get().as_bytes(),
            _ => &[],
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolCallErrorSchema {
    pub error: String,
}

/// Prompt tool arguments
#[derive(Debug, Default, Deserialize)]
pub struct PromptGetParams {
    #[serde(default)]
    pub arguments: Option<Map<String, Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_keeps_numeric_text() {
        let raw = br#"{"pathParameters":{"id":9007199254740993},"body":{"amount": 12345678901234567890.123456789}}"#;
        let body: ToolCallBody = serde_json::from_slice(raw).unwrap();
        let id = &body.path_parameters.as_ref().unwrap()["id"];
        assert_eq!(id.to_string(), "9007199254740993");
        assert_eq!(
            std::str::from_utf8(body.body_bytes()).unwrap(),
            r#"{"amount": 12345678901234567890.123456789}"#
        );
    }

    #[test]
    fn test_header_alias_and_null_body() {
        let body: ToolCallBody =
            serde_json::from_str(r#"{"headerParameters":{"X-Trace":"a"},"body":null}"#).unwrap();
        assert!(body.header_parameters.as_ref().unwrap().contains_key("X-Trace"));
        assert!(body.body.is_none() || body.body_bytes().is_empty());
    }
}
