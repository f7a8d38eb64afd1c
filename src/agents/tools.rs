//! Tools available to agents

use super::types::Tool;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Reserved tool name used by the orchestrator to start a sub-agent
pub const SPAWN_AGENT_TOOL: &str = "spawn_agent";

/// Runs one tool call with raw JSON arguments
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, arguments: &str, cancel: &CancellationToken) -> Result<String>;
}

/// A tool definition bound to its executor
#[derive(Clone)]
pub struct AgentTool {
    pub definition: Tool,
    pub executor: Arc<dyn ToolExecutor>,
    /// Toolset tools are reported as MCP calls in response output
    pub is_mcp_tool: bool,
    pub server_label: String,
}

impl AgentTool {
    pub fn new(definition: Tool, executor: Arc<dyn ToolExecutor>) -> Self {
        Self {
            definition,
            executor,
            is_mcp_tool: false,
            server_label: String::new(),
        }
    }

    pub fn mcp(definition: Tool, executor: Arc<dyn ToolExecutor>, server_label: &str) -> Self {
        Self {
            definition,
            executor,
            is_mcp_tool: true,
            server_label: server_label.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        self.definition.name()
    }
}

impl fmt::Debug for AgentTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentTool")
            .field("name", &self.name())
            .field("is_mcp_tool", &self.is_mcp_tool)
            .field("server_label", &self.server_label)
            .finish()
    }
}

/// Definition of the `spawn_agent` tool
pub fn spawn_agent_tool() -> Tool {
    Tool::function(
        SPAWN_AGENT_TOOL,
        "Spawn a sub-agent to work on a focused task in parallel. The sub-agent has access to the same tools (except spawning) and returns its final answer as the tool result. Use it to split independent pieces of work.",
        json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Short name describing the sub-agent's role"
                },
                "task": {
                    "type": "string",
                    "description": "The task the sub-agent should complete"
                },
                "context": {
                    "type": "string",
                    "description": "Background the sub-agent needs to complete the task"
                }
            },
            "required": ["name", "task"]
        }),
    )
}

/// Arguments of a `spawn_agent` call
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SpawnAgentArgs {
    pub name: String,
    pub task: String,
    #[serde(default)]
    pub context: String,
}

impl SpawnAgentArgs {
    pub fn parse(arguments: &str) -> Result<Self> {
        let args: SpawnAgentArgs = serde_json::from_str(arguments)?;
        if args.task.trim().is_empty() {
            return Err(GatewayError::bad_request("task is required"));
        }
        Ok(args)
    }
}

/// Output of one tool invocation as shown to the model
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

/// Find `name` among `tools` and run it. Failures become error outcomes.
pub async fn invoke_tool(
    tools: &[AgentTool],
    name: &str,
    arguments: &str,
    cancel: &CancellationToken,
) -> ToolOutcome {
    let Some(tool) = tools.iter().find(|t| t.name() == name) else {
        return ToolOutcome {
            content: format!("Unknown tool: {}", name),
            is_error: true,
        };
    };
    match tool.executor.execute(&normalize_arguments(arguments), cancel).await {
        Ok(content) => ToolOutcome {
            content,
            is_error: false,
        },
        Err(e) => {
            debug!(tool_name = %name, error = %e, "tool call failed");
            ToolOutcome {
                content: format!("Error: {}", e),
                is_error: true,
            }
        }
    }
}

/// Arguments as sent to a tool: empty becomes `{}`, non-JSON is wrapped as `{"raw": ...}`
pub fn normalize_arguments(arguments: &str) -> String {
    let trimmed = arguments.trim();
    if trimmed.is_empty() {
        return "{}".to_string();
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(_) => trimmed.to_string(),
        Err(_) => json!({ "raw": arguments }).to_string(),
    }
}

/// Turn a buffered tool response into the text handed back to the model.
///
/// Text bodies are returned as-is and JSON bodies as a JSON string literal.
/// An empty body yields `status code: N`.
pub fn format_tool_result(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Result<String> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    if !body.is_empty() {
        let text = String::from_utf8_lossy(body).into_owned();
        if content_type == "application/json" || content_type.ends_with("+json") {
            return Ok(serde_json::to_string(&text)?);
        }
        return Ok(text);
    }

    Ok(format!("status code: {}", status.as_u16()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(content_type: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if !content_type.is_empty() {
            headers.insert(CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
        }
        headers
    }

    #[test]
    fn test_format_text_and_json() {
        assert_eq!(
            format_tool_result(StatusCode::OK, &headers("text/plain; charset=utf-8"), b"hello").unwrap(),
            "hello"
        );
        assert_eq!(
            format_tool_result(StatusCode::OK, &headers(""), b"raw").unwrap(),
            "raw"
        );
        assert_eq!(
            format_tool_result(StatusCode::OK, &headers("application/json"), br#"{"id":1}"#).unwrap(),
            r#""{\"id\":1}""#
        );
    }

    #[test]
    fn test_format_empty_body() {
        assert_eq!(
            format_tool_result(StatusCode::NO_CONTENT, &headers("application/json"), b"").unwrap(),
            "status code: 204"
        );
    }

    struct Echo;

    #[async_trait]
    impl ToolExecutor for Echo {
        async fn execute(&self, arguments: &str, _cancel: &CancellationToken) -> Result<String> {
            if arguments.contains("fail") {
                return Err(GatewayError::gateway("upstream down"));
            }
            Ok(arguments.to_string())
        }
    }

    #[tokio::test]
    async fn test_invoke_tool_outcomes() {
        let tools = vec![AgentTool::new(
            Tool::function("echo", "", json!({"type": "object"})),
            Arc::new(Echo),
        )];
        let cancel = CancellationToken::new();

        let ok = invoke_tool(&tools, "echo", "", &cancel).await;
        assert_eq!(ok, ToolOutcome { content: "{}".into(), is_error: false });

        let unknown = invoke_tool(&tools, "nope", "{}", &cancel).await;
        assert_eq!(unknown.content, "Unknown tool: nope");
        assert!(unknown.is_error);

        let failed = invoke_tool(&tools, "echo", r#"{"fail":true}"#, &cancel).await;
        assert!(failed.is_error);
        assert!(failed.content.starts_with("Error: "));
    }

    #[test]
    fn test_normalize_arguments() {
        assert_eq!(normalize_arguments(""), "{}");
        assert_eq!(normalize_arguments(r#" {"a":1} "#), r#"{"a":1}"#);
        assert_eq!(normalize_arguments("oops"), r#"{"raw":"oops"}"#);
    }

    #[test]
    fn test_spawn_args() {
        let args = SpawnAgentArgs::parse(r#"{"name":"researcher","task":"find the docs"}"#).unwrap();
        assert_eq!(args.name, "researcher");
        assert_eq!(args.context, "");
        assert!(SpawnAgentArgs::parse("{not json").is_err());
        assert!(SpawnAgentArgs::parse(r#"{"name":"x","task":"  "}"#).is_err());
    }

    #[test]
    fn test_spawn_tool_definition() {
        let tool = spawn_agent_tool();
        assert_eq!(tool.name(), SPAWN_AGENT_TOOL);
        assert_eq!(tool.function.parameters["required"], json!(["name", "task"]));
    }
}
