//! Task-scoped sub-agents started through `spawn_agent`

use super::completion::{ChatCompletion, CompletionRequest, DeltaSink};
use super::events::{AgentEventSink, AgentStatus, SubAgentEvent};
use super::tools::{invoke_tool, AgentTool};
use super::types::{ChatMessage, Tool};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SUB_AGENT_PROMPT: &str = "You are a task-based agent with access to specific tools to achieve a specific objective. Work through the goal step by step, call tools when you need data or need to take an action, and finish with a concise answer that states what you found or did. Do not ask the user follow-up questions; work with the context you were given.";

/// What to run and where it sits in the agent tree
#[derive(Debug, Clone, Default)]
pub struct SubAgentRequest {
    pub agent_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub task: String,
    pub context: String,
    pub instructions: Option<String>,
    /// Nesting level of the agent doing the spawning
    pub current_depth: usize,
    pub max_depth: usize,
}

/// Final state of a sub-agent run
#[derive(Debug, Clone, PartialEq)]
pub struct SubAgentOutcome {
    pub agent_id: String,
    pub status: AgentStatus,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl SubAgentOutcome {
    fn completed(agent_id: &str, result: String) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            status: AgentStatus::Completed,
            result: Some(result),
            error: None,
        }
    }

    fn failed(agent_id: &str, error: String) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            status: AgentStatus::Failed,
            result: None,
            error: Some(error),
        }
    }

    /// Text returned to the spawning agent as the tool result
    pub fn tool_content(&self) -> String {
        match (self.status, &self.result, &self.error) {
            (AgentStatus::Completed, Some(result), _) => result.clone(),
            (_, _, Some(error)) => format!("Sub-agent failed: {}", error),
            _ => "Sub-agent completed with no result".to_string(),
        }
    }

    pub fn to_event(&self) -> SubAgentEvent {
        SubAgentEvent::Complete {
            agent_id: self.agent_id.clone(),
            status: self.status,
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

struct AgentDeltas {
    sink: Arc<dyn AgentEventSink>,
    agent_id: String,
}

#[async_trait]
impl DeltaSink for AgentDeltas {
    async fn delta(&self, content: &str) -> Result<()> {
        self.sink
            .agent_event(&SubAgentEvent::Delta {
                agent_id: self.agent_id.clone(),
                content: content.to_string(),
            })
            .await
    }
}

/// Runs bounded sub-agent loops
#[derive(Clone)]
pub struct SubAgentExecutor {
    completion: Arc<dyn ChatCompletion>,
    model: String,
    temperature: Option<f64>,
    max_iterations: usize,
}

impl SubAgentExecutor {
    pub fn new(
        completion: Arc<dyn ChatCompletion>,
        model: &str,
        temperature: Option<f64>,
        max_iterations: usize,
    ) -> Self {
        Self {
            completion,
            model: model.to_string(),
            temperature,
            max_iterations,
        }
    }

    /// Run a sub-agent to completion.
    ///
    /// Every outcome, including failures, is reported through `sink` as a
    /// `sub_agent.complete` event and returned.
    pub async fn execute(
        &self,
        request: SubAgentRequest,
        tools: Arc<Vec<AgentTool>>,
        sink: Arc<dyn AgentEventSink>,
        cancel: CancellationToken,
    ) -> SubAgentOutcome {
        let agent_id = request.agent_id.clone();
        emit(
            sink.as_ref(),
            &SubAgentEvent::Spawn {
                agent_id: agent_id.clone(),
                parent_id: request.parent_id.clone(),
                name: request.name.clone(),
                task: request.task.clone(),
                description: request.task.clone(),
            },
        )
        .await;

        info!(
            agent_id = %agent_id,
            agent_name = %request.name,
            depth = request.current_depth,
            "sub-agent started"
        );

        let outcome = if request.current_depth >= request.max_depth {
            SubAgentOutcome::failed(
                &agent_id,
                format!("maximum agent nesting depth ({}) exceeded", request.max_depth),
            )
        } else {
            self.run_loop(&request, &tools, &sink, &cancel).await
        };

        emit(sink.as_ref(), &outcome.to_event()).await;
        info!(agent_id = %agent_id, status = ?outcome.status, "sub-agent finished");
        outcome
    }

    async fn run_loop(
        &self,
        request: &SubAgentRequest,
        tools: &[AgentTool],
        sink: &Arc<dyn AgentEventSink>,
        cancel: &CancellationToken,
    ) -> SubAgentOutcome {
        let agent_id = request.agent_id.as_str();
        let mut messages = vec![
            ChatMessage::system(system_prompt(request.instructions.as_deref())),
            ChatMessage::user(user_prompt(&request.task, &request.context)),
        ];
        let definitions: Vec<Tool> = tools.iter().map(|t| t.definition.clone()).collect();
        let deltas = AgentDeltas {
            sink: sink.clone(),
            agent_id: agent_id.to_string(),
        };

        for iteration in 1..=self.max_iterations {
            if cancel.is_cancelled() {
                return SubAgentOutcome::failed(agent_id, "context cancelled: request cancelled".to_string());
            }
            debug!(agent_id = %agent_id, iteration, "sub-agent iteration");

            let message = match self
                .completion
                .stream_completion(
                    CompletionRequest {
                        model: &self.model,
                        messages: &messages,
                        tools: &definitions,
                        temperature: self.temperature,
                    },
                    &deltas,
                    cancel,
                )
                .await
            {
                Ok(message) => message,
                Err(e) => return SubAgentOutcome::failed(agent_id, model_error(&e)),
            };

            if message.tool_calls.is_empty() {
                return SubAgentOutcome::completed(agent_id, message.content);
            }

            let calls = message.tool_calls.clone();
            messages.push(message);

            for call in calls {
                if cancel.is_cancelled() {
                    return SubAgentOutcome::failed(agent_id, "context cancelled: request cancelled".to_string());
                }
                emit(
                    sink.as_ref(),
                    &SubAgentEvent::ToolCall {
                        agent_id: agent_id.to_string(),
                        tool_call_id: call.id.clone(),
                        tool_name: call.function.name.clone(),
                        args: call.function.arguments.clone(),
                    },
                )
                .await;

                let outcome = invoke_tool(tools, &call.function.name, &call.function.arguments, cancel).await;

                emit(
                    sink.as_ref(),
                    &SubAgentEvent::ToolResult {
                        agent_id: agent_id.to_string(),
                        tool_call_id: call.id.clone(),
                        tool_name: call.function.name.clone(),
                        result: outcome.content.clone(),
                        is_error: outcome.is_error,
                    },
                )
                .await;
                messages.push(ChatMessage::tool(&call.id, &call.function.name, outcome.content));
            }
        }

        SubAgentOutcome::failed(
            agent_id,
            format!("sub-agent exceeded maximum iterations ({})", self.max_iterations),
        )
    }
}

fn system_prompt(instructions: Option<&str>) -> String {
    match instructions.filter(|i| !i.trim().is_empty()) {
        Some(instructions) => format!("{}\n\nInstructions: {}", SUB_AGENT_PROMPT, instructions),
        None => SUB_AGENT_PROMPT.to_string(),
    }
}

fn user_prompt(task: &str, context: &str) -> String {
    if context.trim().is_empty() {
        format!("Goal: {}", task)
    } else {
        format!("Goal: {}\n\nContext: {}", task, context)
    }
}

/// Failure text for a model call, distinguishing cancellation
pub(crate) fn model_error(err: &GatewayError) -> String {
    match err {
        GatewayError::Cancelled { .. } => format!("context cancelled: {}", err),
        other => format!("model call failed: {}", other),
    }
}

async fn emit(sink: &dyn AgentEventSink, event: &SubAgentEvent) {
    if let Err(e) = sink.agent_event(event).await {
        warn!(agent_id = %event.agent_id(), event_type = event.event_type(), error = %e, "failed to emit agent event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::events::RecordingEventSink;
    use crate::agents::tools::ToolExecutor;
    use crate::agents::types::{FunctionCall, ToolCall};
    use serde_json::json;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    struct Scripted {
        replies: Mutex<VecDeque<ChatMessage>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl Scripted {
        fn new(replies: Vec<ChatMessage>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatCompletion for Scripted {
        async fn stream_completion(
            &self,
            request: CompletionRequest<'_>,
            sink: &dyn DeltaSink,
            _cancel: &CancellationToken,
        ) -> Result<ChatMessage> {
            self.seen.lock().await.push(request.messages.to_vec());
            let reply = self
                .replies
                .lock()
                .await
                .pop_front()
                .ok_or_else(|| GatewayError::gateway("script exhausted"))?;
            if !reply.content.is_empty() {
                sink.delta(&reply.content).await?;
            }
            Ok(reply)
        }
    }

    struct Lookup;

    #[async_trait]
    impl ToolExecutor for Lookup {
        async fn execute(&self, arguments: &str, _cancel: &CancellationToken) -> Result<String> {
            Ok(format!("found {}", arguments))
        }
    }

    fn call(id: &str, name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            call_type: "function".into(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    fn tools() -> Arc<Vec<AgentTool>> {
        Arc::new(vec![AgentTool::new(
            Tool::function("lookup", "Look something up", json!({"type": "object"})),
            Arc::new(Lookup),
        )])
    }

    fn request(current_depth: usize, max_depth: usize) -> SubAgentRequest {
        SubAgentRequest {
            agent_id: "agent-1".into(),
            parent_id: Some("main".into()),
            name: "researcher".into(),
            task: "find the user".into(),
            context: "user id 7".into(),
            instructions: None,
            current_depth,
            max_depth,
        }
    }

    #[tokio::test]
    async fn test_runs_tools_then_completes() {
        let completion = Scripted::new(vec![
            ChatMessage::assistant("", vec![call("c1", "lookup", r#"{"id":7}"#)]),
            ChatMessage::assistant("User 7 is Ada", vec![]),
        ]);
        let sink = Arc::new(RecordingEventSink::new());
        let executor = SubAgentExecutor::new(completion.clone(), "m", None, 15);

        let outcome = executor
            .execute(request(0, 3), tools(), sink.clone(), CancellationToken::new())
            .await;

        assert_eq!(outcome.status, AgentStatus::Completed);
        assert_eq!(outcome.tool_content(), "User 7 is Ada");

        let types: Vec<&str> = sink.events().await.iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec![
                "sub_agent.spawn",
                "sub_agent.tool_call",
                "sub_agent.tool_result",
                "sub_agent.delta",
                "sub_agent.complete"
            ]
        );

        let seen = completion.seen.lock().await;
        assert_eq!(seen[0][1].content, "Goal: find the user\n\nContext: user id 7");
        assert_eq!(seen[1].last().unwrap().content, r#"found {"id":7}"#);
    }

    #[tokio::test]
    async fn test_depth_limit() {
        let completion = Scripted::new(vec![]);
        let sink = Arc::new(RecordingEventSink::new());
        let executor = SubAgentExecutor::new(completion, "m", None, 15);

        let outcome = executor
            .execute(request(3, 3), tools(), sink.clone(), CancellationToken::new())
            .await;
        assert_eq!(outcome.error.as_deref(), Some("maximum agent nesting depth (3) exceeded"));
        assert_eq!(outcome.tool_content(), "Sub-agent failed: maximum agent nesting depth (3) exceeded");
        assert_eq!(sink.events().await.len(), 2);
    }

    #[tokio::test]
    async fn test_iteration_limit() {
        let replies = (0..3)
            .map(|i| ChatMessage::assistant("", vec![call(&format!("c{}", i), "lookup", "{}")]))
            .collect();
        let executor = SubAgentExecutor::new(Scripted::new(replies), "m", None, 3);

        let outcome = executor
            .execute(
                request(0, 3),
                tools(),
                Arc::new(RecordingEventSink::new()),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome.status, AgentStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("sub-agent exceeded maximum iterations (3)"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let executor = SubAgentExecutor::new(Scripted::new(vec![]), "m", None, 15);
        let outcome = executor
            .execute(request(0, 3), tools(), Arc::new(RecordingEventSink::new()), cancel)
            .await;
        assert!(outcome.error.unwrap().starts_with("context cancelled"));
    }

    #[test]
    fn test_prompts() {
        assert!(system_prompt(Some("Use metric units")).ends_with("\n\nInstructions: Use metric units"));
        assert_eq!(system_prompt(None), SUB_AGENT_PROMPT);
        assert_eq!(user_prompt("t", ""), "Goal: t");
    }
}
