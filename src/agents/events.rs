//! Agent lifecycle events multiplexed onto the parent stream

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Agent id used for the top-level orchestrator
pub const MAIN_AGENT_ID: &str = "main";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Completed,
    Failed,
}

/// Event describing what a (sub-)agent is doing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SubAgentEvent {
    #[serde(rename = "sub_agent.spawn")]
    Spawn {
        agent_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
        name: String,
        task: String,
        description: String,
    },
    #[serde(rename = "sub_agent.delta")]
    Delta { agent_id: String, content: String },
    #[serde(rename = "sub_agent.tool_call")]
    ToolCall {
        agent_id: String,
        tool_call_id: String,
        tool_name: String,
        args: String,
    },
    #[serde(rename = "sub_agent.tool_result")]
    ToolResult {
        agent_id: String,
        tool_call_id: String,
        tool_name: String,
        result: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    #[serde(rename = "sub_agent.complete")]
    Complete {
        agent_id: String,
        status: AgentStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl SubAgentEvent {
    pub fn completed(agent_id: &str, result: String) -> Self {
        SubAgentEvent::Complete {
            agent_id: agent_id.to_string(),
            status: AgentStatus::Completed,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed<S: Into<String>>(agent_id: &str, error: S) -> Self {
        SubAgentEvent::Complete {
            agent_id: agent_id.to_string(),
            status: AgentStatus::Failed,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn agent_id(&self) -> &str {
        match self {
            SubAgentEvent::Spawn { agent_id, .. }
            | SubAgentEvent::Delta { agent_id, .. }
            | SubAgentEvent::ToolCall { agent_id, .. }
            | SubAgentEvent::ToolResult { agent_id, .. }
            | SubAgentEvent::Complete { agent_id, .. } => agent_id,
        }
    }

    /// Event type tag as it appears on the wire
    pub fn event_type(&self) -> &'static str {
        match self {
            SubAgentEvent::Spawn { .. } => "sub_agent.spawn",
            SubAgentEvent::Delta { .. } => "sub_agent.delta",
            SubAgentEvent::ToolCall { .. } => "sub_agent.tool_call",
            SubAgentEvent::ToolResult { .. } => "sub_agent.tool_result",
            SubAgentEvent::Complete { .. } => "sub_agent.complete",
        }
    }
}

/// Receives the output of an agent run.
///
/// Implementations are shared by concurrently running sub-agents and must
/// serialise their own writes.
#[async_trait]
pub trait AgentEventSink: Send + Sync {
    /// Text streamed by the top-level agent
    async fn text_delta(&self, content: &str) -> Result<()>;

    async fn agent_event(&self, event: &SubAgentEvent) -> Result<()>;
}

/// Sink that drops everything; used when only the final transcript matters
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

#[async_trait]
impl AgentEventSink for NoopEventSink {
    async fn text_delta(&self, _content: &str) -> Result<()> {
        Ok(())
    }

    async fn agent_event(&self, _event: &SubAgentEvent) -> Result<()> {
        Ok(())
    }
}

/// Sink that records everything in memory
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    text: tokio::sync::Mutex<String>,
    events: tokio::sync::Mutex<Vec<SubAgentEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn text(&self) -> String {
        self.text.lock().await.clone()
    }

    pub async fn events(&self) -> Vec<SubAgentEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl AgentEventSink for RecordingEventSink {
    async fn text_delta(&self, content: &str) -> Result<()> {
        self.text.lock().await.push_str(content);
        Ok(())
    }

    async fn agent_event(&self, event: &SubAgentEvent) -> Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_shape() {
        let event = SubAgentEvent::ToolResult {
            agent_id: "a1".into(),
            tool_call_id: "call_1".into(),
            tool_name: "get_user".into(),
            result: "ok".into(),
            is_error: false,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "type": "sub_agent.tool_result",
                "agent_id": "a1",
                "tool_call_id": "call_1",
                "tool_name": "get_user",
                "result": "ok"
            })
        );

        let failed = SubAgentEvent::failed("a2", "boom");
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["type"], "sub_agent.complete");
        assert_eq!(value["status"], "failed");
        assert_eq!(value["error"], "boom");
        assert!(value.get("result").is_none());
        assert_eq!(failed.event_type(), "sub_agent.complete");
    }

    #[test]
    fn test_spawn_without_parent() {
        let event: SubAgentEvent = serde_json::from_value(json!({
            "type": "sub_agent.spawn",
            "agent_id": "x",
            "name": "researcher",
            "task": "find docs",
            "description": "find docs"
        }))
        .unwrap();
        assert_eq!(event.agent_id(), "x");
        assert!(matches!(event, SubAgentEvent::Spawn { parent_id: None, .. }));
    }
}
