//! Agent execution
//!
//! A tool-calling loop over a streaming chat completion, with parallel
//! sub-agents whose events are multiplexed onto the parent SSE stream, and
//! the service exposing toolsets, streaming chat and the responses API.

pub mod completion;
pub mod events;
pub mod executor;
pub mod service;
pub mod sse;
pub mod subagent;
pub mod tools;
pub mod toolsets;
pub mod types;

pub use completion::{ChatCompletion, CompletionRequest, DeltaSink, OpenRouterClient};
pub use events::{AgentEventSink, AgentStatus, NoopEventSink, RecordingEventSink, SubAgentEvent, MAIN_AGENT_ID};
pub use executor::{AgentExecutor, AgentRun, AgentTranscript};
pub use service::AgentsService;
pub use sse::{agent_marker, extract_agent_events, html_escape_json, SseEmitter};
pub use subagent::{SubAgentExecutor, SubAgentOutcome, SubAgentRequest};
pub use tools::{format_tool_result, spawn_agent_tool, AgentTool, ToolExecutor, ToolOutcome, SPAWN_AGENT_TOOL};
pub use toolsets::{InMemoryToolsetRepository, Toolset, ToolsetRepository};
pub use types::{
    AgentChatRequest, ChatMessage, FunctionCall, OutputItem, OutputMessage, ResponseOutput, ResponseRequest, Tool,
    ToolCall, ToolsetRef,
};
