//! Top-level agent loop with tool calls and parallel sub-agents

use super::completion::{ChatCompletion, CompletionRequest, DeltaSink};
use super::events::{AgentEventSink, AgentStatus, SubAgentEvent, MAIN_AGENT_ID};
use super::sse::SseEmitter;
use super::subagent::{model_error, SubAgentExecutor, SubAgentRequest};
use super::tools::{invoke_tool, spawn_agent_tool, AgentTool, SpawnAgentArgs, SPAWN_AGENT_TOOL};
use super::types::{ChatMessage, McpToolCall, OutputItem, OutputMessage, Tool, ToolCall};
use crate::config::AgentsConfig;
use crate::error::Result;
use crate::gateway::ResponseWriter;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Input of one agent run
#[derive(Debug, Clone, Default)]
pub struct AgentRun {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<AgentTool>,
    pub temperature: Option<f64>,
    /// 0 disables `spawn_agent`
    pub max_depth: usize,
}

/// Everything an agent run produced
#[derive(Debug, Clone)]
pub struct AgentTranscript {
    pub messages: Vec<ChatMessage>,
    pub output: Vec<OutputItem>,
    pub final_text: String,
    pub status: AgentStatus,
    pub error: Option<String>,
    pub iterations: usize,
}

struct MainDeltas {
    sink: Arc<dyn AgentEventSink>,
}

#[async_trait]
impl DeltaSink for MainDeltas {
    async fn delta(&self, content: &str) -> Result<()> {
        self.sink.text_delta(content).await
    }
}

/// Drives the orchestrating agent
#[derive(Clone)]
pub struct AgentExecutor {
    completion: Arc<dyn ChatCompletion>,
    max_iterations: usize,
    sub_agent_max_iterations: usize,
}

impl AgentExecutor {
    pub fn new(completion: Arc<dyn ChatCompletion>, config: &AgentsConfig) -> Self {
        Self {
            completion,
            max_iterations: config.max_iterations,
            sub_agent_max_iterations: config.sub_agent_max_iterations,
        }
    }

    /// Run the agent and stream its output to `writer` as server-sent events.
    ///
    /// The stream always ends with `data: [DONE]` unless the writer itself fails.
    pub async fn stream(
        &self,
        run: AgentRun,
        writer: Box<dyn ResponseWriter>,
        cancel: &CancellationToken,
    ) -> Result<AgentTranscript> {
        let emitter = Arc::new(SseEmitter::new(writer, &run.model));
        emitter.start().await?;
        let transcript = self.run(run, emitter.clone(), cancel).await?;
        emitter.done().await?;
        Ok(transcript)
    }

    /// Run the agent loop until the model stops calling tools or a limit is hit
    pub async fn run(
        &self,
        run: AgentRun,
        sink: Arc<dyn AgentEventSink>,
        cancel: &CancellationToken,
    ) -> Result<AgentTranscript> {
        let AgentRun {
            model,
            mut messages,
            tools,
            temperature,
            max_depth,
        } = run;

        let mut definitions: Vec<Tool> = tools.iter().map(|t| t.definition.clone()).collect();
        if max_depth > 0 {
            definitions.push(spawn_agent_tool());
        }
        let tools = Arc::new(tools);
        let sub_agents = SubAgentExecutor::new(
            self.completion.clone(),
            &model,
            temperature,
            self.sub_agent_max_iterations,
        );
        let deltas = MainDeltas { sink: sink.clone() };
        let mut output = Vec::new();

        for iteration in 1..=self.max_iterations {
            if cancel.is_cancelled() {
                return fail(&sink, messages, output, iteration, "context cancelled: request cancelled".into()).await;
            }
            debug!(iteration, messages = messages.len(), "agent iteration");

            let message = match self
                .completion
                .stream_completion(
                    CompletionRequest {
                        model: &model,
                        messages: &messages,
                        tools: &definitions,
                        temperature,
                    },
                    &deltas,
                    cancel,
                )
                .await
            {
                Ok(message) => message,
                Err(e) => return fail(&sink, messages, output, iteration, model_error(&e)).await,
            };

            if message.tool_calls.is_empty() {
                let final_text = message.content.clone();
                output.push(OutputItem::Message(OutputMessage::assistant(
                    message_id(),
                    "completed",
                    &final_text,
                )));
                messages.push(message);
                info!(iterations = iteration, "agent completed");
                return Ok(AgentTranscript {
                    messages,
                    output,
                    final_text,
                    status: AgentStatus::Completed,
                    error: None,
                    iterations: iteration,
                });
            }

            if !message.content.is_empty() {
                output.push(OutputItem::Message(OutputMessage::assistant(
                    message_id(),
                    "completed",
                    &message.content,
                )));
            }
            let (spawns, calls): (Vec<ToolCall>, Vec<ToolCall>) = message
                .tool_calls
                .iter()
                .cloned()
                .partition(|call| call.function.name == SPAWN_AGENT_TOOL);
            messages.push(message);

            if !spawns.is_empty() {
                let results = self
                    .run_spawns(&spawns, &sub_agents, &tools, &sink, cancel, max_depth)
                    .await;
                for (call, content) in results {
                    output.push(OutputItem::McpCall(McpToolCall {
                        id: call.id.clone(),
                        server_label: String::new(),
                        name: SPAWN_AGENT_TOOL.to_string(),
                        arguments: call.function.arguments.clone(),
                        output: content.clone(),
                        error: None,
                        status: "completed".to_string(),
                    }));
                    messages.push(ChatMessage::tool(&call.id, SPAWN_AGENT_TOOL, content));
                }
            }

            for call in calls {
                if cancel.is_cancelled() {
                    return fail(&sink, messages, output, iteration, "context cancelled: request cancelled".into()).await;
                }
                let name = call.function.name.clone();
                sink.agent_event(&SubAgentEvent::ToolCall {
                    agent_id: MAIN_AGENT_ID.to_string(),
                    tool_call_id: call.id.clone(),
                    tool_name: name.clone(),
                    args: call.function.arguments.clone(),
                })
                .await?;

                let outcome = invoke_tool(&tools, &name, &call.function.arguments, cancel).await;

                sink.agent_event(&SubAgentEvent::ToolResult {
                    agent_id: MAIN_AGENT_ID.to_string(),
                    tool_call_id: call.id.clone(),
                    tool_name: name.clone(),
                    result: outcome.content.clone(),
                    is_error: outcome.is_error,
                })
                .await?;

                if let Some(tool) = tools.iter().find(|t| t.name() == name && t.is_mcp_tool) {
                    output.push(OutputItem::McpCall(McpToolCall {
                        id: call.id.clone(),
                        server_label: tool.server_label.clone(),
                        name: name.clone(),
                        arguments: call.function.arguments.clone(),
                        output: outcome.content.clone(),
                        error: outcome.is_error.then(|| outcome.content.clone()),
                        status: "completed".to_string(),
                    }));
                }
                messages.push(ChatMessage::tool(&call.id, &name, outcome.content));
            }
        }

        warn!(max_iterations = self.max_iterations, "agent hit iteration limit");
        let error = format!("agent exceeded maximum iterations ({})", self.max_iterations);
        fail(&sink, messages, output, self.max_iterations, error).await
    }

    /// Start every spawn concurrently and collect `(call, tool content)` in spawn order
    async fn run_spawns(
        &self,
        spawns: &[ToolCall],
        sub_agents: &SubAgentExecutor,
        tools: &Arc<Vec<AgentTool>>,
        sink: &Arc<dyn AgentEventSink>,
        cancel: &CancellationToken,
        max_depth: usize,
    ) -> Vec<(ToolCall, String)> {
        let mut results: Vec<(usize, ToolCall, String)> = Vec::with_capacity(spawns.len());
        let mut pending = JoinSet::new();

        for (index, call) in spawns.iter().enumerate() {
            let args = match SpawnAgentArgs::parse(&call.function.arguments) {
                Ok(args) => args,
                Err(e) => {
                    results.push((index, call.clone(), format!("Error parsing spawn_agent args: {}", e)));
                    continue;
                }
            };
            let request = SubAgentRequest {
                agent_id: Uuid::new_v4().to_string(),
                parent_id: None,
                name: args.name,
                task: args.task,
                context: args.context,
                instructions: None,
                current_depth: 0,
                max_depth,
            };
            let executor = sub_agents.clone();
            let tools = tools.clone();
            let sink = sink.clone();
            let cancel = cancel.clone();
            let call = call.clone();
            pending.spawn(async move {
                let outcome = executor.execute(request, tools, sink, cancel).await;
                (index, call, outcome)
            });
        }

        let mut running: Vec<(usize, ToolCall)> = spawns
            .iter()
            .cloned()
            .enumerate()
            .filter(|(index, _)| !results.iter().any(|(done, _, _)| done == index))
            .collect();

        let mut task_error = None;
        while let Some(joined) = pending.join_next().await {
            match joined {
                Ok((index, call, outcome)) => {
                    running.retain(|(i, _)| *i != index);
                    results.push((index, call, outcome.tool_content()));
                }
                Err(e) => {
                    warn!(error = %e, "sub-agent task failed");
                    task_error = Some(e.to_string());
                }
            }
        }
        // Tasks that panicked never reported back
        for (index, call) in running {
            let reason = task_error.clone().unwrap_or_else(|| "task aborted".to_string());
            results.push((index, call, format!("Sub-agent execution error: {}", reason)));
        }

        results.sort_by_key(|(index, _, _)| *index);
        results.into_iter().map(|(_, call, content)| (call, content)).collect()
    }
}

fn message_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}

async fn fail(
    sink: &Arc<dyn AgentEventSink>,
    messages: Vec<ChatMessage>,
    output: Vec<OutputItem>,
    iterations: usize,
    error: String,
) -> Result<AgentTranscript> {
    warn!(error = %error, "agent failed");
    sink.agent_event(&SubAgentEvent::failed(MAIN_AGENT_ID, error.clone()))
        .await?;
    Ok(AgentTranscript {
        messages,
        output,
        final_text: String::new(),
        status: AgentStatus::Failed,
        error: Some(error),
        iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::events::RecordingEventSink;
    use crate::agents::tools::ToolExecutor;
    use crate::agents::types::FunctionCall;
    use crate::error::GatewayError;
    use serde_json::json;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    struct Scripted {
        replies: Mutex<VecDeque<ChatMessage>>,
        requests: Mutex<Vec<(Vec<ChatMessage>, Vec<String>)>>,
    }

    impl Scripted {
        fn new(replies: Vec<ChatMessage>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
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
            self.requests.lock().await.push((
                request.messages.to_vec(),
                request.tools.iter().map(|t| t.name().to_string()).collect(),
            ));
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

    struct Weather;

    #[async_trait]
    impl ToolExecutor for Weather {
        async fn execute(&self, _arguments: &str, _cancel: &CancellationToken) -> Result<String> {
            Ok("sunny".to_string())
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

    fn executor(completion: Arc<Scripted>, max_iterations: usize) -> AgentExecutor {
        let config = AgentsConfig {
            max_iterations,
            ..AgentsConfig::default()
        };
        AgentExecutor::new(completion, &config)
    }

    fn run_with_tools(max_depth: usize) -> AgentRun {
        AgentRun {
            model: "openai/gpt-4o".into(),
            messages: vec![ChatMessage::user("What's the weather?")],
            tools: vec![AgentTool::mcp(
                Tool::function("get_weather", "Current weather", json!({"type": "object"})),
                Arc::new(Weather),
                "weather-toolset",
            )],
            temperature: None,
            max_depth,
        }
    }

    #[tokio::test]
    async fn test_tool_call_then_answer() {
        let completion = Scripted::new(vec![
            ChatMessage::assistant("", vec![call("c1", "get_weather", "{}")]),
            ChatMessage::assistant("It is sunny", vec![]),
        ]);
        let sink = Arc::new(RecordingEventSink::new());
        let transcript = executor(completion.clone(), 20)
            .run(run_with_tools(3), sink.clone(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(transcript.status, AgentStatus::Completed);
        assert_eq!(transcript.final_text, "It is sunny");
        assert_eq!(transcript.iterations, 2);
        assert_eq!(sink.text().await, "It is sunny");

        let tool_message = &transcript.messages[2];
        assert_eq!(tool_message.tool_call_id.as_deref(), Some("c1"));
        assert_eq!(tool_message.content, "sunny");

        match &transcript.output[0] {
            OutputItem::McpCall(mcp) => {
                assert_eq!(mcp.server_label, "weather-toolset");
                assert_eq!(mcp.output, "sunny");
            }
            other => panic!("expected mcp call, got {:?}", other),
        }

        let requests = completion.requests.lock().await;
        assert_eq!(requests[0].1, vec!["get_weather".to_string(), SPAWN_AGENT_TOOL.to_string()]);
    }

    #[tokio::test]
    async fn test_no_spawn_tool_without_depth() {
        let completion = Scripted::new(vec![ChatMessage::assistant("hi", vec![])]);
        executor(completion.clone(), 20)
            .run(run_with_tools(0), Arc::new(RecordingEventSink::new()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(completion.requests.lock().await[0].1, vec!["get_weather".to_string()]);
    }

    #[tokio::test]
    async fn test_spawn_results_join_in_spawn_order() {
        let completion = Scripted::new(vec![
            ChatMessage::assistant(
                "",
                vec![
                    call("s1", SPAWN_AGENT_TOOL, r#"{"name":"a","task":"first"}"#),
                    call("s2", SPAWN_AGENT_TOOL, "not json"),
                ],
            ),
            // sub-agent reply
            ChatMessage::assistant("first done", vec![]),
            ChatMessage::assistant("all done", vec![]),
        ]);
        let sink = Arc::new(RecordingEventSink::new());
        let transcript = executor(completion.clone(), 20)
            .run(run_with_tools(3), sink.clone(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(transcript.final_text, "all done");
        assert_eq!(transcript.messages[2].tool_call_id.as_deref(), Some("s1"));
        assert_eq!(transcript.messages[2].content, "first done");
        assert_eq!(transcript.messages[3].tool_call_id.as_deref(), Some("s2"));
        assert!(transcript.messages[3]
            .content
            .starts_with("Error parsing spawn_agent args: "));

        let requests = completion.requests.lock().await;
        assert!(!requests[1].1.iter().any(|name| name == SPAWN_AGENT_TOOL));

        // Top-level spawns have no parent agent
        let events = sink.events().await;
        assert!(matches!(events.first(), Some(SubAgentEvent::Spawn { parent_id: None, .. })));
    }

    /// Sub-agents answer after a per-task delay; the orchestrator spawns both then summarises
    struct Staggered {
        finished: Mutex<Vec<String>>,
        main_requests: Mutex<Vec<Vec<ChatMessage>>>,
    }

    #[async_trait]
    impl ChatCompletion for Staggered {
        async fn stream_completion(
            &self,
            request: CompletionRequest<'_>,
            _sink: &dyn DeltaSink,
            _cancel: &CancellationToken,
        ) -> Result<ChatMessage> {
            let prompt = request.messages.get(1).map(|m| m.content.clone()).unwrap_or_default();
            let sub_agent = [("Research", 300, "R-result"), ("Writer", 100, "W-result")]
                .into_iter()
                .find(|(task, _, _)| prompt.contains(&format!("{} task", task)));
            if let Some((name, delay_ms, result)) = sub_agent {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                self.finished.lock().await.push(name.to_string());
                return Ok(ChatMessage::assistant(result, vec![]));
            }

            let mut main_requests = self.main_requests.lock().await;
            main_requests.push(request.messages.to_vec());
            if main_requests.len() == 1 {
                return Ok(ChatMessage::assistant(
                    "",
                    vec![
                        call("research", SPAWN_AGENT_TOOL, r#"{"name":"Research","task":"Research task"}"#),
                        call("writer", SPAWN_AGENT_TOOL, r#"{"name":"Writer","task":"Writer task"}"#),
                    ],
                ));
            }
            Ok(ChatMessage::assistant("report ready", vec![]))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawns_run_concurrently_and_join_in_spawn_order() {
        let completion = Arc::new(Staggered {
            finished: Mutex::new(Vec::new()),
            main_requests: Mutex::new(Vec::new()),
        });
        let config = AgentsConfig::default();
        let started = tokio::time::Instant::now();
        let transcript = AgentExecutor::new(completion.clone(), &config)
            .run(run_with_tools(3), Arc::new(RecordingEventSink::new()), &CancellationToken::new())
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(transcript.final_text, "report ready");
        assert_eq!(*completion.finished.lock().await, vec!["Writer", "Research"]);
        // Bounded by the slower sub-agent, not the sum of both
        assert!(elapsed >= std::time::Duration::from_millis(300));
        assert!(elapsed < std::time::Duration::from_millis(400));

        let main_requests = completion.main_requests.lock().await;
        let joined: Vec<(&str, &str)> = main_requests[1]
            .iter()
            .filter(|m| m.role == "tool")
            .map(|m| (m.tool_call_id.as_deref().unwrap_or(""), m.content.as_str()))
            .collect();
        assert_eq!(joined, vec![("research", "R-result"), ("writer", "W-result")]);
    }

    #[tokio::test]
    async fn test_iteration_limit_fails_main() {
        let replies = (0..2)
            .map(|i| ChatMessage::assistant("", vec![call(&format!("c{}", i), "get_weather", "{}")]))
            .collect();
        let sink = Arc::new(RecordingEventSink::new());
        let transcript = executor(Scripted::new(replies), 2)
            .run(run_with_tools(0), sink.clone(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(transcript.status, AgentStatus::Failed);
        assert_eq!(transcript.error.as_deref(), Some("agent exceeded maximum iterations (2)"));
        assert_eq!(
            sink.events().await.last(),
            Some(&SubAgentEvent::failed(MAIN_AGENT_ID, "agent exceeded maximum iterations (2)"))
        );
    }

    #[tokio::test]
    async fn test_model_error_fails() {
        let transcript = executor(Scripted::new(vec![]), 20)
            .run(run_with_tools(0), Arc::new(RecordingEventSink::new()), &CancellationToken::new())
            .await
            .unwrap();
        assert!(transcript.error.unwrap().starts_with("model call failed: "));
    }
}
