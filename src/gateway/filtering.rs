//! jq response filtering
//!
//! A caller may ask for a jq expression to be applied to an upstream response.
//! The filter only runs for the status codes and media types the tool allows.

use super::models::{FilterRequest, ToolCallErrorSchema};
use crate::toolconfig::{FilterType, ResponseFilterConfig};
use jaq_interpret::{Ctx, FilterT, ParseCtx, RcIter, Val};
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, warn};

/// A replacement response produced by the filter
#[derive(Debug, Clone, PartialEq)]
pub struct FilterResult {
    pub status: StatusCode,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl FilterResult {
    fn empty_error() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            content_type: "application/octet-stream".to_string(),
            body: Vec::new(),
        }
    }
}

/// Lower-cased media type without parameters
pub fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Exact code, class wildcard such as `2XX`, or `default`
pub fn status_matches(configured: &[String], status: u16) -> bool {
    let code = status.to_string();
    configured.iter().any(|pattern| {
        let pattern = pattern.trim();
        if pattern.eq_ignore_ascii_case("default") || pattern == code {
            return true;
        }
        let upper = pattern.to_ascii_uppercase();
        upper.len() == 3
            && upper.ends_with("XX")
            && upper.as_bytes()[0] == code.as_bytes()[0]
    })
}

/// Whether a response with `status` and `content_type` should be filtered
pub fn filter_applies(
    config: Option<&ResponseFilterConfig>,
    request: Option<&FilterRequest>,
    status: u16,
    content_type: &str,
) -> bool {
    let (Some(config), Some(request)) = (config, request) else {
        return false;
    };
    if config.filter_type == FilterType::None {
        return false;
    }
    match FilterType::parse(&request.filter_type) {
        Ok(FilterType::Jq) if !request.filter.trim().is_empty() => {}
        _ => return false,
    }
    if !status_matches(&config.status_codes, status) {
        return false;
    }
    let media = media_type(content_type);
    config
        .content_types
        .iter()
        .any(|allowed| media_type(allowed) == media)
}

/// Compile and run `filter` against `input`.
///
/// `Ok(None)` means the expression does not parse; `Err` carries an evaluation failure.
pub fn run_jq(filter: &str, input: Value) -> Result<Option<Vec<Value>>, String> {
    let mut defs = ParseCtx::new(Vec::new());
    defs.insert_natives(jaq_core::core());
    defs.insert_defs(jaq_std::std());

    let (main, errs) = jaq_parse::parse(filter, jaq_parse::main());
    let Some(main) = main.filter(|_| errs.is_empty()) else {
        return Ok(None);
    };
    let compiled = defs.compile(main);
    if !defs.errs.is_empty() {
        return Ok(None);
    }

    let inputs = RcIter::new(core::iter::empty());
    let mut outputs = Vec::new();
    for output in compiled.run((Ctx::new([], &inputs), Val::from(input))) {
        match output {
            Ok(val) => outputs.push(Value::from(val)),
            Err(e) => return Err(e.to_string()),
        }
    }
    Ok(Some(outputs))
}

fn collapse(mut outputs: Vec<Value>) -> Value {
    if outputs.len() == 1 {
        outputs.remove(0)
    } else {
        Value::Array(outputs)
    }
}

// Numbers go through their text so YAML sees plain scalars
fn to_yaml(value: &Value) -> serde_yaml::Value {
    match value {
        Value::Null => serde_yaml::Value::Null,
        Value::Bool(b) => serde_yaml::Value::Bool(*b),
        Value::Number(n) => {
            let text = n.to_string();
            if let Ok(i) = text.parse::<i64>() {
                serde_yaml::Value::Number(i.into())
            } else if let Ok(u) = text.parse::<u64>() {
                serde_yaml::Value::Number(u.into())
            } else if let Ok(f) = text.parse::<f64>() {
                serde_yaml::Value::Number(f.into())
            } else {
                serde_yaml::Value::String(text)
            }
        }
        Value::String(s) => serde_yaml::Value::String(s.clone()),
        Value::Array(items) => serde_yaml::Value::Sequence(items.iter().map(to_yaml).collect()),
        Value::Object(map) => serde_yaml::Value::Mapping(
            map.iter()
                .map(|(k, v)| (serde_yaml::Value::String(k.clone()), to_yaml(v)))
                .collect(),
        ),
    }
}

/// Filter an already-read body. `None` leaves the original response untouched.
pub fn apply_filter(
    request: &FilterRequest,
    status: StatusCode,
    content_type: &str,
    body: Result<&[u8], String>,
) -> Option<FilterResult> {
    let body = match body {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "failed to read response body for filtering");
            return Some(FilterResult::empty_error());
        }
    };

    let media = media_type(content_type);
    let is_yaml = media.contains("yaml");
    let parsed: Result<Value, String> = if is_yaml {
        serde_yaml::from_slice(body).map_err(|e| e.to_string())
    } else {
        serde_json::from_slice(body).map_err(|e| e.to_string())
    };
    let input = match parsed {
        Ok(input) => input,
        Err(e) => {
            warn!(error = %e, content_type = %media, "failed to parse response body for filtering");
            return Some(FilterResult::empty_error());
        }
    };

    let outputs = match run_jq(&request.filter, input) {
        Ok(Some(outputs)) => outputs,
        Ok(None) => {
            debug!(filter = %request.filter, "invalid jq filter, passing response through");
            return None;
        }
        Err(e) => {
            let error = ToolCallErrorSchema {
                error: format!("Response filter failed to match response structure: {}", e),
            };
            return Some(FilterResult {
                status: StatusCode::BAD_REQUEST,
                content_type: "application/json".to_string(),
                body: serde_json::to_vec(&error).unwrap_or_default(),
            });
        }
    };

    let value = collapse(outputs);
    let encoded = if is_yaml {
        serde_yaml::to_string(&to_yaml(&value))
            .map(String::into_bytes)
            .map_err(|e| e.to_string())
    } else {
        serde_json::to_vec(&value).map_err(|e| e.to_string())
    };
    match encoded {
        Ok(body) => Some(FilterResult {
            status,
            content_type: media,
            body,
        }),
        Err(e) => {
            warn!(error = %e, "failed to encode filtered response");
            Some(FilterResult::empty_error())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(status: &[&str], types: &[&str]) -> ResponseFilterConfig {
        ResponseFilterConfig {
            filter_type: FilterType::Jq,
            schema: None,
            status_codes: status.iter().map(|s| s.to_string()).collect(),
            content_types: types.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn jq(filter: &str) -> FilterRequest {
        FilterRequest {
            filter_type: "jq".to_string(),
            filter: filter.to_string(),
        }
    }

    #[test]
    fn test_status_patterns() {
        let configured = vec!["2xx".to_string(), "404".to_string()];
        assert!(status_matches(&configured, 201));
        assert!(status_matches(&configured, 404));
        assert!(!status_matches(&configured, 500));
        assert!(status_matches(&["default".to_string()], 503));
    }

    #[test]
    fn test_applies_only_for_matching_status_and_media_type() {
        let cfg = config(&["200"], &["application/json"]);
        let req = jq(".data");
        assert!(filter_applies(Some(&cfg), Some(&req), 200, "application/json; charset=utf-8"));
        assert!(!filter_applies(Some(&cfg), Some(&req), 404, "application/json"));
        assert!(!filter_applies(Some(&cfg), Some(&req), 200, "text/plain"));
        assert!(!filter_applies(Some(&cfg), Some(&FilterRequest::none()), 200, "application/json"));
        assert!(!filter_applies(None, Some(&req), 200, "application/json"));
    }

    #[test]
    fn test_identity_filter_round_trips() {
        let body = br#"{"data":"test","meta":{"count":1}}"#;
        let result = apply_filter(&jq("."), StatusCode::OK, "application/json", Ok(body)).unwrap();
        let value: Value = serde_json::from_slice(&result.body).unwrap();
        assert_eq!(value, json!({"data": "test", "meta": {"count": 1}}));
        assert_eq!(result.content_type, "application/json");
    }

    #[test]
    fn test_projection_filter() {
        let body = br#"{"users":[{"id":1,"name":"Alice","active":true},{"id":2,"name":"Bob","active":false}]}"#;
        let result = apply_filter(
            &jq(".users | map(select(.active == true)) | map({id, name})"),
            StatusCode::OK,
            "application/json",
            Ok(body),
        )
        .unwrap();
        let value: Value = serde_json::from_slice(&result.body).unwrap();
        assert_eq!(value, json!([{"id": 1, "name": "Alice"}]));
    }

    #[test]
    fn test_multiple_outputs_become_array() {
        let body = br#"{"items":[1,2,3]}"#;
        let result = apply_filter(&jq(".items[]"), StatusCode::OK, "application/json", Ok(body)).unwrap();
        let value: Value = serde_json::from_slice(&result.body).unwrap();
        assert_eq!(value, json!([1, 2, 3]));
    }

    #[test]
    fn test_yaml_body() {
        let body = b"items:\n  - name: item1\n  - name: item2\n";
        let result = apply_filter(
            &jq(".items | map(.name)"),
            StatusCode::OK,
            "application/yaml",
            Ok(body),
        )
        .unwrap();
        assert_eq!(result.content_type, "application/yaml");
        let value: Value = serde_yaml::from_slice(&result.body).unwrap();
        assert_eq!(value, json!(["item1", "item2"]));
    }

    #[test]
    fn test_failure_policy() {
        let invalid = apply_filter(&jq(".[[["), StatusCode::OK, "application/json", Ok(b"{}"));
        assert!(invalid.is_none());

        let eval = apply_filter(&jq(".a.b"), StatusCode::OK, "application/json", Ok(br#"{"a":5}"#)).unwrap();
        assert_eq!(eval.status, StatusCode::BAD_REQUEST);
        let error: Value = serde_json::from_slice(&eval.body).unwrap();
        assert!(error["error"]
            .as_str()
            .unwrap()
            .starts_with("Response filter failed to match response structure: "));

        let unparsable = apply_filter(&jq("."), StatusCode::OK, "application/json", Ok(b"not json")).unwrap();
        assert_eq!(unparsable.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(unparsable.content_type, "application/octet-stream");
        assert!(unparsable.body.is_empty());

        let unread = apply_filter(&jq("."), StatusCode::OK, "application/json", Err("reset".into())).unwrap();
        assert_eq!(unread.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
