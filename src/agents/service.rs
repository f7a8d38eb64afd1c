//! Agents service: toolset tools, streaming chat and the responses API

use super::events::NoopEventSink;
use super::executor::{AgentExecutor, AgentRun, AgentTranscript};
use super::tools::{format_tool_result, AgentTool, ToolExecutor};
use super::toolsets::ToolsetRepository;
use super::types::{
    AgentChatRequest, ChatMessage, OutputItem, ResponseOutput, ResponseRequest, Tool, ToolsetRef,
};
use super::AgentStatus;
use crate::background::workflows::AgentsResponseInput;
use crate::background::{ids, AgentResponder, ExecutionStatus, IdReusePolicy, StartWorkflowOptions, WorkflowEngine};
use crate::config::AgentsConfig;
use crate::environments::{EnvironmentEntries, SlugOrId};
use crate::error::{GatewayError, Result};
use crate::gateway::{BufferedResponseWriter, CallContext, ResponseWriter, ToolProxy};
use crate::metrics::HttpLogAttributes;
use crate::toolconfig::{CaseInsensitiveEnv, ToolCallEnv, ToolCallPlan, ToolKind};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const ORCHESTRATOR_PROMPT: &str = "You are an agent orchestrator. Plan how to solve the request, then carry the plan out with the tools you have.

Use the spawn_agent tool to hand a group of related tool calls for one objective to a focused sub-agent. Give it a clear task, every piece of context it needs, and a short name. Sub-agents run in parallel, so delegate independent objectives together.

Call tools directly for single, isolated operations or when you need a result before deciding the next step.

Prefer parallel work whenever operations do not depend on each other.";

/// Runs one toolset tool through the proxy
struct ProxyToolExecutor {
    proxy: ToolProxy,
    environments: EnvironmentEntries,
    plan: ToolCallPlan,
    project_id: Uuid,
    toolset_id: Uuid,
    user_config: CaseInsensitiveEnv,
}

#[async_trait]
impl ToolExecutor for ProxyToolExecutor {
    async fn execute(&self, arguments: &str, cancel: &CancellationToken) -> Result<String> {
        let urn = &self.plan.descriptor.urn;
        let system_env = self
            .environments
            .load_system_env(self.project_id, self.toolset_id, &urn.kind, &urn.source)
            .await?;

        let mut writer = BufferedResponseWriter::new();
        let mut attrs = HttpLogAttributes::new();
        self.proxy
            .do_call(
                &mut writer,
                arguments.as_bytes(),
                ToolCallEnv::new(system_env, self.user_config.clone()),
                &self.plan,
                &mut attrs,
                &CallContext::new(cancel.clone()),
            )
            .await?;

        let (status, headers, body) = writer.into_parts();
        debug!(
            tool_urn = %urn,
            http_status = status.as_u16(),
            response_body_bytes = body.len(),
            "agent tool call finished"
        );
        format_tool_result(status, &headers, &body)
    }
}

/// Client-declared tools are advertised to the model but cannot be run here
struct DeclaredToolExecutor {
    name: String,
}

#[async_trait]
impl ToolExecutor for DeclaredToolExecutor {
    async fn execute(&self, _arguments: &str, _cancel: &CancellationToken) -> Result<String> {
        Err(GatewayError::bad_request(format!(
            "tool {} has no server-side implementation",
            self.name
        )))
    }
}

pub struct AgentsService {
    executor: AgentExecutor,
    proxy: ToolProxy,
    environments: EnvironmentEntries,
    toolsets: Arc<dyn ToolsetRepository>,
    engine: Arc<dyn WorkflowEngine>,
    config: AgentsConfig,
    task_queue: String,
}

impl AgentsService {
    pub fn new(
        executor: AgentExecutor,
        proxy: ToolProxy,
        environments: EnvironmentEntries,
        toolsets: Arc<dyn ToolsetRepository>,
        engine: Arc<dyn WorkflowEngine>,
        config: &AgentsConfig,
        task_queue: &str,
    ) -> Self {
        Self {
            executor,
            proxy,
            environments,
            toolsets,
            engine,
            config: config.clone(),
            task_queue: task_queue.to_string(),
        }
    }

    /// Tools of a toolset bound to the proxy.
    ///
    /// An empty `environment_slug` selects the toolset's default environment.
    /// Header overrides win over environment entries.
    pub async fn load_toolset_tools(
        &self,
        project_id: Uuid,
        toolset_slug: &str,
        environment_slug: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Vec<AgentTool>> {
        let toolset = self
            .toolsets
            .get_toolset(project_id, toolset_slug)
            .await?
            .ok_or_else(|| GatewayError::not_found(format!("toolset not found: {}", toolset_slug)))?;

        let env_slug = if environment_slug.is_empty() {
            toolset
                .default_environment_slug
                .clone()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| GatewayError::invalid("toolset has no default environment slug"))?
        } else {
            environment_slug.to_string()
        };

        let entries = self
            .environments
            .load(project_id, &SlugOrId::parse(&env_slug.to_lowercase()))
            .await?;
        let mut user_config = CaseInsensitiveEnv::new();
        for (name, value) in entries {
            user_config.set(name, value);
        }
        for (name, value) in headers {
            user_config.set(name.as_str(), value.as_str());
        }

        let mut tools = Vec::with_capacity(toolset.tools.len());
        for plan in &toolset.tools {
            if plan.kind == ToolKind::Prompt {
                debug!(tool_name = %plan.descriptor.name, "prompt tools are not offered to agents");
                continue;
            }
            plan.validate()?;

            let parameters = match plan.input_schema() {
                Some(schema) if !schema.is_null() => schema.clone(),
                _ => json!({}),
            };
            let definition = Tool::function(
                plan.descriptor.name.clone(),
                plan.descriptor.description.clone().unwrap_or_default(),
                parameters,
            );
            let executor = Arc::new(ProxyToolExecutor {
                proxy: self.proxy.clone(),
                environments: self.environments.clone(),
                plan: plan.clone(),
                project_id,
                toolset_id: toolset.id,
                user_config: user_config.clone(),
            });
            tools.push(AgentTool::mcp(definition, executor, &toolset.slug));
        }

        info!(
            project_id = %project_id,
            toolset = %toolset.slug,
            environment = %env_slug,
            tools = tools.len(),
            "loaded toolset tools"
        );
        Ok(tools)
    }

    async fn load_tools(&self, project_id: Uuid, toolsets: &[ToolsetRef]) -> Result<Vec<AgentTool>> {
        let mut tools = Vec::new();
        for toolset in toolsets {
            tools.extend(
                self.load_toolset_tools(
                    project_id,
                    &toolset.toolset_slug,
                    &toolset.environment_slug,
                    &toolset.headers,
                )
                .await?,
            );
        }
        Ok(tools)
    }

    fn model_or_default(&self, model: &str) -> String {
        if model.is_empty() {
            self.config.model.clone()
        } else {
            model.to_string()
        }
    }

    /// Run a chat request and stream it to `writer` as server-sent events
    pub async fn stream_chat(
        &self,
        project_id: Uuid,
        request: AgentChatRequest,
        writer: Box<dyn ResponseWriter>,
        cancel: &CancellationToken,
    ) -> Result<AgentTranscript> {
        let mut tools = self.load_tools(project_id, &request.toolsets).await?;
        for declared in request.tools {
            let executor = Arc::new(DeclaredToolExecutor {
                name: declared.name().to_string(),
            });
            tools.push(AgentTool::new(declared, executor));
        }

        let run = AgentRun {
            model: self.model_or_default(&request.model),
            messages: request.messages,
            tools,
            temperature: request.temperature,
            max_depth: request.max_depth.unwrap_or(self.config.max_depth),
        };
        info!(
            project_id = %project_id,
            model = %run.model,
            tools = run.tools.len(),
            "streaming agent chat"
        );
        self.executor.stream(run, writer, cancel).await
    }

    /// Run a responses request to completion in the current task
    pub async fn execute_response(
        &self,
        project_id: Uuid,
        response_id: &str,
        request: ResponseRequest,
        cancel: &CancellationToken,
    ) -> Result<ResponseOutput> {
        let system_prompt = match request.instructions.as_deref().filter(|i| !i.trim().is_empty()) {
            Some(instructions) => format!("{}\n\nUser Instructions:\n{}", ORCHESTRATOR_PROMPT, instructions),
            None => ORCHESTRATOR_PROMPT.to_string(),
        };
        let mut messages = vec![ChatMessage::system(system_prompt)];
        messages.extend(request.input_messages()?);

        let tools = self.load_tools(project_id, &request.toolsets).await?;
        let run = AgentRun {
            model: self.model_or_default(&request.model),
            messages,
            tools,
            temperature: request.temperature,
            max_depth: self.config.max_depth,
        };
        let model = run.model.clone();
        let transcript = self.executor.run(run, Arc::new(NoopEventSink), cancel).await?;

        let status = match transcript.status {
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
        };
        let mut output = ResponseOutput::for_request(response_id, &request, status);
        output.model = model;
        output.error = transcript.error;
        output.output = transcript.output;
        info!(
            project_id = %project_id,
            response_id = %response_id,
            status = status,
            iterations = transcript.iterations,
            tool_calls = output.output.iter().filter(|o| matches!(o, OutputItem::McpCall(_))).count(),
            "agent response finished"
        );
        Ok(output)
    }

    /// Start a response through the workflow engine.
    ///
    /// Async requests return immediately with `in_progress`; sync requests
    /// wait for the workflow result.
    pub async fn create_response(&self, project_id: Uuid, request: ResponseRequest) -> Result<ResponseOutput> {
        request.input_messages()?;

        let response_id = ids::agents_response_id(Uuid::new_v4());
        let options = StartWorkflowOptions::new(response_id.clone(), &self.task_queue)
            .reuse_policy(IdReusePolicy::RejectDuplicate);
        let input = AgentsResponseInput {
            project_id,
            response_id: response_id.clone(),
            request: request.clone(),
        };
        self.engine
            .execute_workflow(ids::AGENTS_RESPONSE, options, serde_json::to_value(&input)?)
            .await?;

        if request.is_async() {
            debug!(response_id = %response_id, "agent response started asynchronously");
            return Ok(ResponseOutput::for_request(&response_id, &request, "in_progress"));
        }

        let result = self.engine.wait_result(&response_id).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Current state of a response started with [`AgentsService::create_response`]
    pub async fn get_response(&self, response_id: &str) -> Result<ResponseOutput> {
        let description = self.engine.describe_execution(response_id).await?;
        match description.status {
            ExecutionStatus::Running => Ok(ResponseOutput::for_request(
                response_id,
                &ResponseRequest::default(),
                "in_progress",
            )),
            ExecutionStatus::Completed => {
                let result = description
                    .result
                    .ok_or_else(|| GatewayError::unexpected(format!("response {} has no result", response_id)))?;
                Ok(serde_json::from_value(result)?)
            }
            status => {
                warn!(response_id = %response_id, status = ?status, "agent response did not complete");
                let mut output = ResponseOutput::for_request(response_id, &ResponseRequest::default(), "failed");
                output.error = Some(
                    description
                        .error
                        .unwrap_or_else(|| format!("response workflow ended with status {:?}", status)),
                );
                Ok(output)
            }
        }
    }
}

#[async_trait]
impl AgentResponder for AgentsService {
    async fn run_response(
        &self,
        project_id: Uuid,
        response_id: &str,
        request: ResponseRequest,
    ) -> Result<ResponseOutput> {
        self.execute_response(project_id, response_id, request, &CancellationToken::new())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::completion::{ChatCompletion, CompletionRequest, DeltaSink};
    use crate::agents::toolsets::{InMemoryToolsetRepository, Toolset};
    use crate::background::workflows::agents_response_workflow;
    use crate::background::LocalWorkflowEngine;
    use crate::cache::InMemoryCache;
    use crate::config::GatewayConfig;
    use crate::encryption::EncryptionClient;
    use crate::environments::InMemoryEnvironmentRepository;
    use crate::guardian::Policy;
    use crate::metrics::{NoopLogClient, NoopToolMetrics};
    use crate::toolconfig::{HttpToolCallPlan, ToolDescriptor, ToolUrn};
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    struct Scripted {
        replies: Mutex<VecDeque<ChatMessage>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    #[async_trait]
    impl ChatCompletion for Scripted {
        async fn stream_completion(
            &self,
            request: CompletionRequest<'_>,
            _sink: &dyn DeltaSink,
            _cancel: &CancellationToken,
        ) -> Result<ChatMessage> {
            self.seen.lock().await.push(request.messages.to_vec());
            self.replies
                .lock()
                .await
                .pop_front()
                .ok_or_else(|| GatewayError::gateway("script exhausted"))
        }
    }

    fn http_plan(name: &str, schema: Option<serde_json::Value>) -> ToolCallPlan {
        ToolCallPlan::http(
            ToolDescriptor {
                id: Uuid::new_v4().to_string(),
                name: name.into(),
                description: Some(format!("{} tool", name)),
                urn: ToolUrn::new("http", "petstore", name),
                deployment_id: String::new(),
                project_id: String::new(),
                project_slug: String::new(),
                organization_id: String::new(),
                organization_slug: String::new(),
            },
            HttpToolCallPlan {
                method: "GET".into(),
                path: "/pets".into(),
                schema,
                ..Default::default()
            },
        )
    }

    struct Fixture {
        service: Arc<AgentsService>,
        engine: LocalWorkflowEngine,
        completion: Arc<Scripted>,
        project_id: Uuid,
    }

    async fn fixture(replies: Vec<ChatMessage>, default_env: Option<&str>) -> Fixture {
        let project_id = Uuid::new_v4();
        let env_repo = Arc::new(InMemoryEnvironmentRepository::new());
        let environment = env_repo.create_environment(project_id, "prod", "Production").await;
        let environments = EnvironmentEntries::new(env_repo, EncryptionClient::from_seed("test-seed"));
        environments
            .create_entries(
                project_id,
                environment.id,
                &["PETSTORE_SERVER_URL".to_string()],
                &["http://127.0.0.1:1".to_string()],
            )
            .await
            .unwrap();

        let toolsets = Arc::new(InMemoryToolsetRepository::new());
        toolsets
            .insert(Toolset {
                id: Uuid::new_v4(),
                project_id,
                slug: "petstore".into(),
                name: "Petstore".into(),
                default_environment_slug: default_env.map(str::to_string),
                tools: vec![
                    http_plan("list_pets", Some(json!({"type": "object"}))),
                    http_plan("ping", None),
                ],
            })
            .await;

        let config = GatewayConfig::default();
        let proxy = ToolProxy::from_config(
            &config,
            Arc::new(Policy::new().with_allow_loopback(true)),
            Arc::new(InMemoryCache::new()),
            Arc::new(NoopToolMetrics),
            Arc::new(NoopLogClient),
        )
        .unwrap();

        let completion = Arc::new(Scripted {
            replies: Mutex::new(replies.into()),
            seen: Mutex::new(Vec::new()),
        });
        let engine = LocalWorkflowEngine::new();
        let service = Arc::new(AgentsService::new(
            AgentExecutor::new(completion.clone(), &config.agents),
            proxy,
            environments,
            toolsets,
            Arc::new(engine.clone()),
            &config.agents,
            "main",
        ));
        let responder: Arc<dyn AgentResponder> = service.clone();
        engine.register_workflow(ids::AGENTS_RESPONSE, move |ctx, input| {
            agents_response_workflow(ctx, responder.clone(), input)
        });

        Fixture {
            service,
            engine,
            completion,
            project_id,
        }
    }

    #[tokio::test]
    async fn test_toolset_tools_use_default_environment() {
        let f = fixture(vec![], Some("prod")).await;
        let tools = f
            .service
            .load_toolset_tools(f.project_id, "petstore", "", &HashMap::new())
            .await
            .unwrap();

        assert_eq!(tools.len(), 2);
        assert!(tools.iter().all(|t| t.is_mcp_tool && t.server_label == "petstore"));
        assert_eq!(tools[0].definition.function.parameters, json!({"type": "object"}));
        assert_eq!(tools[1].definition.function.parameters, json!({}));
    }

    #[tokio::test]
    async fn test_missing_default_environment_is_an_error() {
        let f = fixture(vec![], None).await;
        let err = f
            .service
            .load_toolset_tools(f.project_id, "petstore", "", &HashMap::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("toolset has no default environment slug"));

        let tools = f
            .service
            .load_toolset_tools(f.project_id, "petstore", "PROD", &HashMap::new())
            .await
            .unwrap();
        assert_eq!(tools.len(), 2);
    }

    #[tokio::test]
    async fn test_sync_response_merges_instructions() {
        let f = fixture(vec![ChatMessage::assistant("All done", vec![])], Some("prod")).await;
        let request = ResponseRequest {
            instructions: Some("Answer briefly".into()),
            input: json!("Hello"),
            ..Default::default()
        };

        let output = f.service.create_response(f.project_id, request).await.unwrap();
        assert_eq!(output.status, "completed");
        assert!(output.id.starts_with("v1:agents-response:"));
        assert_eq!(output.model, "openai/gpt-4o");

        let seen = f.completion.seen.lock().await;
        let system = &seen[0][0];
        assert!(system.content.starts_with("You are an agent orchestrator."));
        assert!(system.content.ends_with("\n\nUser Instructions:\nAnswer briefly"));
        assert_eq!(seen[0][1].content, "Hello");
    }

    #[tokio::test]
    async fn test_async_response_is_polled_to_completion() {
        let f = fixture(vec![ChatMessage::assistant("Later", vec![])], Some("prod")).await;
        let request = ResponseRequest {
            input: json!([{"role": "user", "content": "Hi"}]),
            r#async: Some(true),
            ..Default::default()
        };

        let started = f.service.create_response(f.project_id, request).await.unwrap();
        assert_eq!(started.status, "in_progress");

        f.engine.wait_result(&started.id).await.unwrap();
        let polled = f.service.get_response(&started.id).await.unwrap();
        assert_eq!(polled.status, "completed");
        assert!(matches!(&polled.output[0], OutputItem::Message(m) if m.content[0].text == "Later"));
    }

    #[tokio::test]
    async fn test_unknown_response_and_bad_input() {
        let f = fixture(vec![], Some("prod")).await;
        assert!(matches!(
            f.service.get_response("v1:agents-response:missing").await,
            Err(GatewayError::NotFound { .. })
        ));

        let request = ResponseRequest {
            input: json!(42),
            ..Default::default()
        };
        assert!(matches!(
            f.service.create_response(f.project_id, request).await,
            Err(GatewayError::BadRequest { .. })
        ));
    }
}
