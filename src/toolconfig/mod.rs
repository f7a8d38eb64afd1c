//! Tool configuration: descriptors, call plans and layered environments

mod descriptor;
mod env;

pub use descriptor::{
    FilterType, FunctionToolCallPlan, HttpParameter, HttpToolCallPlan, HttpToolSecurity,
    PromptToolCallPlan, ResponseFilterConfig, ToolCallPlan, ToolDescriptor, ToolKind, ToolUrn,
};
pub use env::{canonical_header_key, to_http_header, CaseInsensitiveEnv, ToolCallEnv};

use once_cell::sync::Lazy;
use regex::Regex;

/// Matches `{name}` placeholders in a path template
pub static PATH_PARAM_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([^}]+)\}").expect("Invalid regex pattern"));

/// Placeholder names in a path template, in order of appearance
pub fn path_placeholders(path: &str) -> Vec<String> {
    PATH_PARAM_REGEX
        .captures_iter(path)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}
