//! Chat completion and Responses API wire types

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub const ROLE_SYSTEM: &str = "system";
pub const ROLE_USER: &str = "user";
pub const ROLE_ASSISTANT: &str = "assistant";
pub const ROLE_TOOL: &str = "tool";

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// One message of a chat conversation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn system<S: Into<String>>(content: S) -> Self {
        Self {
            role: ROLE_SYSTEM.to_string(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn user<S: Into<String>>(content: S) -> Self {
        Self {
            role: ROLE_USER.to_string(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn assistant<S: Into<String>>(content: S, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: ROLE_ASSISTANT.to_string(),
            content: content.into(),
            tool_calls,
            ..Default::default()
        }
    }

    /// Result of a tool call, answering `tool_call_id`
    pub fn tool<S: Into<String>>(tool_call_id: &str, name: &str, content: S) -> Self {
        Self {
            role: ROLE_TOOL.to_string(),
            content: content.into(),
            tool_call_id: Some(tool_call_id.to_string()),
            name: Some(name.to_string()).filter(|n| !n.is_empty()),
            ..Default::default()
        }
    }
}

/// A function call requested by the model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, exactly as the model produced them
    #[serde(default)]
    pub arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

/// A tool advertised to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type", default = "function_type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

impl Tool {
    pub fn function<S: Into<String>>(name: S, description: S, parameters: Value) -> Self {
        Self {
            tool_type: function_type(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub parameters: Value,
}

/// Toolset selected for an agent run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolsetRef {
    pub toolset_slug: String,
    #[serde(default)]
    pub environment_slug: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Streaming chat request handled by the agent executor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub toolsets: Vec<ToolsetRef>,
    /// Overrides the configured nesting limit
    #[serde(default)]
    pub max_depth: Option<usize>,
}

/// Message in a Responses API input list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub role: String,
    pub content: String,
}

/// Responses API request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseRequest {
    #[serde(default)]
    pub project_slug: String,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// A string or a list of [`ResponseMessage`]
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub toolsets: Vec<ToolsetRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#async: Option<bool>,
}

impl ResponseRequest {
    /// The input as chat messages; instructions are not included
    pub fn input_messages(&self) -> crate::error::Result<Vec<ChatMessage>> {
        let mut messages = Vec::new();
        match &self.input {
            Value::Null => {}
            Value::String(text) => messages.push(ChatMessage::user(text.as_str())),
            Value::Array(_) => {
                let items: Vec<ResponseMessage> = serde_json::from_value(self.input.clone())
                    .map_err(|e| crate::error::GatewayError::bad_request(format!("invalid input messages: {}", e)))?;
                messages.extend(items.into_iter().map(|m| ChatMessage {
                    role: m.role,
                    content: m.content,
                    ..Default::default()
                }));
            }
            _ => {
                return Err(crate::error::GatewayError::bad_request(
                    "input must be a string or a list of messages",
                ))
            }
        }
        Ok(messages)
    }

    pub fn is_async(&self) -> bool {
        self.r#async.unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputTextContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputMessage {
    pub id: String,
    /// `in_progress`, `completed` or `incomplete`
    pub status: String,
    pub role: String,
    pub content: Vec<OutputTextContent>,
}

impl OutputMessage {
    pub fn assistant(id: String, status: &str, text: &str) -> Self {
        Self {
            id,
            status: status.to_string(),
            role: ROLE_ASSISTANT.to_string(),
            content: vec![OutputTextContent {
                content_type: "output_text".to_string(),
                text: text.to_string(),
            }],
        }
    }
}

/// A toolset tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolCall {
    pub id: String,
    pub server_label: String,
    pub name: String,
    pub arguments: String,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputItem {
    Message(OutputMessage),
    McpCall(McpToolCall),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextFormat {
    #[serde(rename = "type")]
    pub format_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseText {
    pub format: TextFormat,
}

impl Default for ResponseText {
    fn default() -> Self {
        Self {
            format: TextFormat {
                format_type: "text".to_string(),
            },
        }
    }
}

/// Responses API result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseOutput {
    pub id: String,
    pub object: String,
    pub created_at: i64,
    /// `in_progress`, `completed` or `failed`
    pub status: String,
    pub error: Option<String>,
    pub instructions: Option<String>,
    pub model: String,
    pub output: Vec<OutputItem>,
    pub previous_response_id: Option<String>,
    pub temperature: f64,
    pub text: ResponseText,
    pub usage: ResponseUsage,
}

impl ResponseOutput {
    /// Skeleton response for `request` with the given status
    pub fn for_request(id: &str, request: &ResponseRequest, status: &str) -> Self {
        Self {
            id: id.to_string(),
            object: "response".to_string(),
            created_at: chrono::Utc::now().timestamp(),
            status: status.to_string(),
            error: None,
            instructions: request.instructions.clone(),
            model: request.model.clone(),
            output: Vec::new(),
            previous_response_id: request.previous_response_id.clone(),
            temperature: request.temperature.unwrap_or(1.0),
            text: ResponseText::default(),
            usage: ResponseUsage::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_content_and_tool_calls() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{"id": "call_1", "function": {"name": "get_user", "arguments": "{\"id\":1}"}}]
        }))
        .unwrap();
        assert_eq!(msg.content, "");
        assert_eq!(msg.tool_calls[0].call_type, "function");
        assert_eq!(msg.tool_calls[0].function.arguments, "{\"id\":1}");
    }

    #[test]
    fn test_request_input_forms() {
        let request = ResponseRequest {
            instructions: Some("Be brief".to_string()),
            input: json!("hello"),
            ..Default::default()
        };
        let messages = request.input_messages().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, ROLE_USER);
        assert_eq!(messages[0].content, "hello");

        let request = ResponseRequest {
            input: json!([{"role": "user", "content": "a"}, {"role": "assistant", "content": "b"}]),
            ..Default::default()
        };
        assert_eq!(request.input_messages().unwrap().len(), 2);

        let request = ResponseRequest {
            input: json!(42),
            ..Default::default()
        };
        assert!(request.input_messages().is_err());
    }

    #[test]
    fn test_output_item_tags() {
        let item = OutputItem::Message(OutputMessage::assistant("msg_1".into(), "completed", "done"));
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["content"][0]["type"], "output_text");
    }
}
