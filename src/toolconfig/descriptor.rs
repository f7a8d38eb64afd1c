//! Tool descriptors and call plans

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Stable tool identifier of the form `tools:<kind>:<source>:<name>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ToolUrn {
    pub kind: String,
    pub source: String,
    pub name: String,
}

impl ToolUrn {
    pub fn new<S: Into<String>>(kind: S, source: S, name: S) -> Self {
        Self {
            kind: kind.into(),
            source: source.into(),
            name: name.into(),
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        let mut parts = value.splitn(4, ':');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some("tools"), Some(kind), Some(source), Some(name))
                if !kind.is_empty() && !source.is_empty() && !name.is_empty() =>
            {
                Ok(Self::new(kind, source, name))
            }
            _ => Err(GatewayError::invalid(format!("invalid tool urn: {}", value))),
        }
    }
}

impl fmt::Display for ToolUrn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tools:{}:{}:{}", self.kind, self.source, self.name)
    }
}

impl TryFrom<String> for ToolUrn {
    type Error = GatewayError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ToolUrn> for String {
    fn from(urn: ToolUrn) -> Self {
        urn.to_string()
    }
}

/// Ownership and identity shared by every tool kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub urn: ToolUrn,
    #[serde(default)]
    pub deployment_id: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub project_slug: String,
    #[serde(default)]
    pub organization_id: String,
    #[serde(default)]
    pub organization_slug: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Http,
    Function,
    Prompt,
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolKind::Http => write!(f, "http"),
            ToolKind::Function => write!(f, "function"),
            ToolKind::Prompt => write!(f, "prompt"),
        }
    }
}

/// Encoding settings for one path, query or header parameter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpParameter {
    /// Name as it appears in the request
    pub name: String,
    /// OpenAPI style; empty means the location default
    #[serde(default)]
    pub style: String,
    /// Whether arrays and objects are exploded; `None` means the style default
    #[serde(default)]
    pub explode: Option<bool>,
    /// Emit the parameter even when its value is empty
    #[serde(default)]
    pub allow_empty_value: bool,
}

/// One security requirement of an HTTP tool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpToolSecurity {
    #[serde(default)]
    pub id: String,
    /// Scheme key used to look up requested scopes
    #[serde(default)]
    pub key: String,
    /// `apiKey`, `http`, `openIdConnect` or `oauth2`
    #[serde(rename = "type", default)]
    pub security_type: Option<String>,
    /// `bearer` or `basic` for `http`
    #[serde(default)]
    pub scheme: Option<String>,
    /// Header or query field name for `apiKey`
    #[serde(default)]
    pub name: Option<String>,
    /// `header` or `query` for `apiKey`
    #[serde(default)]
    pub placement: Option<String>,
    #[serde(default)]
    pub oauth_types: Vec<String>,
    /// OpenAPI `flows` object
    #[serde(default)]
    pub oauth_flows: Option<Value>,
    #[serde(rename = "env_vars", default)]
    pub env_variables: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
    #[default]
    None,
    Jq,
}

impl FilterType {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "" | "none" => Ok(FilterType::None),
            "jq" => Ok(FilterType::Jq),
            other => Err(GatewayError::invalid(format!("invalid filter type: {}", other))),
        }
    }
}

/// Which responses of a tool may be filtered
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseFilterConfig {
    #[serde(rename = "type", default)]
    pub filter_type: FilterType,
    /// Response schema the filter was authored against
    #[serde(default)]
    pub schema: Option<Value>,
    #[serde(default)]
    pub status_codes: Vec<String>,
    #[serde(default)]
    pub content_types: Vec<String>,
}

impl ResponseFilterConfig {
    pub fn disabled() -> Self {
        Self::default()
    }
}

/// How a tool call becomes an HTTP request against an upstream server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpToolCallPlan {
    #[serde(default)]
    pub default_server_url: Option<String>,
    #[serde(default)]
    pub server_env_var: String,
    pub method: String,
    pub path: String,
    /// JSON schema of the whole tool call body
    #[serde(default)]
    pub schema: Option<Value>,
    #[serde(default)]
    pub path_params: HashMap<String, HttpParameter>,
    #[serde(default)]
    pub query_params: HashMap<String, HttpParameter>,
    #[serde(default)]
    pub header_params: HashMap<String, HttpParameter>,
    #[serde(default)]
    pub request_content_type: Option<String>,
    #[serde(default)]
    pub security: Vec<HttpToolSecurity>,
    /// Requested scopes keyed by security scheme key
    #[serde(default)]
    pub security_scopes: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub response_filter: Option<ResponseFilterConfig>,
}

impl HttpToolCallPlan {
    /// Placeholder names in `path` that have no parameter settings
    pub fn undeclared_path_params(&self) -> Vec<String> {
        super::path_placeholders(&self.path)
            .into_iter()
            .filter(|name| !self.path_params.contains_key(name))
            .collect()
    }
}

/// A serverless function exposed as a tool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionToolCallPlan {
    pub function_id: String,
    pub functions_access_id: String,
    #[serde(default)]
    pub runtime: String,
    /// Base URL of the function runner
    pub runner_url: String,
    #[serde(default)]
    pub input_schema: Option<Value>,
    /// Variables the function declares
    #[serde(default)]
    pub variables: Vec<String>,
    /// Variable carrying end-user credentials
    #[serde(default)]
    pub auth_input: Option<String>,
}

/// A prompt template exposed as a tool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptToolCallPlan {
    #[serde(default)]
    pub template_id: String,
    pub prompt: String,
    #[serde(default)]
    pub engine: String,
    #[serde(default)]
    pub kind: String,
}

/// Everything the proxy needs to execute one tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallPlan {
    pub kind: ToolKind,
    pub descriptor: ToolDescriptor,
    #[serde(default)]
    pub http: Option<HttpToolCallPlan>,
    #[serde(default)]
    pub function: Option<FunctionToolCallPlan>,
    #[serde(default)]
    pub prompt: Option<PromptToolCallPlan>,
}

impl ToolCallPlan {
    pub fn http(descriptor: ToolDescriptor, plan: HttpToolCallPlan) -> Self {
        Self {
            kind: ToolKind::Http,
            descriptor,
            http: Some(plan),
            function: None,
            prompt: None,
        }
    }

    pub fn function(descriptor: ToolDescriptor, plan: FunctionToolCallPlan) -> Self {
        Self {
            kind: ToolKind::Function,
            descriptor,
            http: None,
            function: Some(plan),
            prompt: None,
        }
    }

    pub fn prompt(descriptor: ToolDescriptor, plan: PromptToolCallPlan) -> Self {
        Self {
            kind: ToolKind::Prompt,
            descriptor,
            http: None,
            function: None,
            prompt: Some(plan),
        }
    }

    /// JSON schema advertised to models for this tool
    pub fn input_schema(&self) -> Option<&Value> {
        match self.kind {
            ToolKind::Http => self.http.as_ref().and_then(|p| p.schema.as_ref()),
            ToolKind::Function => self.function.as_ref().and_then(|p| p.input_schema.as_ref()),
            ToolKind::Prompt => None,
        }
    }

    /// Check the descriptor invariants before the plan is used
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            ToolKind::Http => {
                let plan = self.http.as_ref().ok_or_else(|| {
                    GatewayError::invariant(format!("kind not set: http tool {} has no http plan", self.descriptor.name))
                })?;
                let undeclared = plan.undeclared_path_params();
                if !undeclared.is_empty() {
                    return Err(GatewayError::invariant(format!(
                        "path placeholders without parameter settings: {}",
                        undeclared.join(", ")
                    )));
                }
                Ok(())
            }
            ToolKind::Function if self.function.is_none() => Err(GatewayError::invariant(format!(
                "kind not set: function tool {} has no function plan",
                self.descriptor.name
            ))),
            ToolKind::Prompt if self.prompt.is_none() => Err(GatewayError::invariant(format!(
                "kind not set: prompt tool {} has no prompt plan",
                self.descriptor.name
            ))),
            _ => Ok(()),
        }
    }
}
