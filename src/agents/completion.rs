//! Streaming chat completions against an OpenAI-compatible endpoint

use super::types::{ChatMessage, FunctionCall, Tool, ToolCall, ROLE_ASSISTANT};
use crate::config::AgentsConfig;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Receives text deltas as the model produces them
#[async_trait]
pub trait DeltaSink: Send + Sync {
    async fn delta(&self, content: &str) -> Result<()>;
}

/// One streaming completion request
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub tools: &'a [Tool],
    pub temperature: Option<f64>,
}

/// Chat completion boundary used by the agent executors
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    /// Stream a completion, forwarding text deltas to `sink`, and return the
    /// assembled assistant message.
    async fn stream_completion(
        &self,
        request: CompletionRequest<'_>,
        sink: &dyn DeltaSink,
        cancel: &CancellationToken,
    ) -> Result<ChatMessage>;
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "<[Tool]>::is_empty")]
    tools: &'a [Tool],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    stream: bool,
}

#[derive(Debug, Default, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Builds the assistant message out of streamed chunks
#[derive(Debug, Default)]
struct MessageAssembler {
    content: String,
    tool_calls: BTreeMap<usize, ToolCall>,
}

impl MessageAssembler {
    /// Apply one `data:` payload, returning the text delta it carried
    fn apply(&mut self, data: &str) -> Result<Option<String>> {
        let chunk: StreamChunk = serde_json::from_str(data)
            .map_err(|e| GatewayError::gateway(format!("invalid completion chunk: {}", e)))?;

        let mut text = None;
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                self.content.push_str(&content);
                text = Some(content);
            }
            for delta in choice.delta.tool_calls {
                let call = self.tool_calls.entry(delta.index).or_insert_with(|| ToolCall {
                    call_type: "function".to_string(),
                    ..Default::default()
                });
                if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
                    call.id = id;
                }
                if let Some(function) = delta.function {
                    if let Some(name) = function.name {
                        call.function.name.push_str(&name);
                    }
                    if let Some(arguments) = function.arguments {
                        call.function.arguments.push_str(&arguments);
                    }
                }
            }
        }
        Ok(text)
    }

    fn finish(self) -> ChatMessage {
        let tool_calls = self
            .tool_calls
            .into_values()
            .filter(|call| !call.function.name.is_empty())
            .map(|mut call| {
                if call.function.arguments.is_empty() {
                    call.function = FunctionCall {
                        name: call.function.name,
                        arguments: "{}".to_string(),
                    };
                }
                call
            })
            .collect();
        ChatMessage {
            role: ROLE_ASSISTANT.to_string(),
            content: self.content,
            tool_calls,
            ..Default::default()
        }
    }
}

/// Client for OpenRouter or any OpenAI-compatible `/chat/completions` endpoint
#[derive(Clone)]
pub struct OpenRouterClient {
    http_client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl OpenRouterClient {
    pub fn new(http_client: reqwest::Client, base_url: &str, api_key: Option<SecretString>) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub fn from_config(config: &AgentsConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::config(format!("failed to build completion client: {}", e)))?;
        Ok(Self::new(http_client, &config.base_url, config.api_key.clone()))
    }

    async fn read_stream(
        &self,
        response: reqwest::Response,
        sink: &dyn DeltaSink,
    ) -> Result<ChatMessage> {
        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut assembler = MessageAssembler::default();

        'stream: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| GatewayError::gateway(format!("completion stream error: {}", e)))?;
            buffer.extend_from_slice(&chunk);

            while let Some(end) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=end).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim_start();
                if data == "[DONE]" {
                    break 'stream;
                }
                if let Some(text) = assembler.apply(data)? {
                    sink.delta(&text).await?;
                }
            }
        }

        Ok(assembler.finish())
    }
}

#[async_trait]
impl ChatCompletion for OpenRouterClient {
    async fn stream_completion(
        &self,
        request: CompletionRequest<'_>,
        sink: &dyn DeltaSink,
        cancel: &CancellationToken,
    ) -> Result<ChatMessage> {
        let body = WireRequest {
            model: request.model,
            messages: request.messages,
            tools: request.tools,
            temperature: request.temperature,
            stream: true,
        };
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "starting chat completion"
        );

        let mut builder = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key.expose_secret()));
        }

        let work = async {
            let response = builder
                .send()
                .await
                .map_err(|e| GatewayError::gateway(format!("failed to call chat completion: {}", e)))?;

            let status = response.status();
            if !status.is_success() {
                let error_body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unable to read error response".to_string());
                warn!(status = status.as_u16(), "chat completion rejected");
                return Err(GatewayError::gateway(format!(
                    "chat completion failed with status {}: {}",
                    status, error_body
                )));
            }

            self.read_stream(response, sink).await
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GatewayError::cancelled("chat completion cancelled")),
            result = work => result,
        }
    }
}
