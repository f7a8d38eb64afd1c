//! Server-sent event framing for streamed agent output

use super::events::{AgentEventSink, SubAgentEvent};
use crate::error::Result;
use crate::gateway::ResponseWriter;
use async_trait::async_trait;
use reqwest::header::{HeaderValue, CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Prefix of the HTML comment that carries agent events inside text content
pub const AGENT_MARKER_PREFIX: &str = "<!--GRAM_AGENT:";
pub const AGENT_MARKER_SUFFIX: &str = "-->";

#[derive(Serialize)]
struct ChunkDelta<'a> {
    content: &'a str,
}

#[derive(Serialize)]
struct ChunkChoice<'a> {
    index: u32,
    delta: ChunkDelta<'a>,
    finish_reason: Option<&'a str>,
}

#[derive(Serialize)]
struct CompletionChunk<'a> {
    id: &'a str,
    object: &'static str,
    created: i64,
    model: &'a str,
    system_fingerprint: &'static str,
    choices: [ChunkChoice<'a>; 1],
}

/// Escape characters that could terminate an HTML comment or a script block
pub fn html_escape_json(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        match c {
            '<' => out.push_str("\\u003c"),
            '>' => out.push_str("\\u003e"),
            '&' => out.push_str("\\u0026"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c => out.push(c),
        }
    }
    out
}

/// Wrap an event as `<!--GRAM_AGENT:{json}-->`
pub fn agent_marker(event: &SubAgentEvent) -> Result<String> {
    let json = serde_json::to_string(event)?;
    Ok(format!(
        "{}{}{}",
        AGENT_MARKER_PREFIX,
        html_escape_json(&json),
        AGENT_MARKER_SUFFIX
    ))
}

/// Pull agent events back out of streamed content
pub fn extract_agent_events(content: &str) -> Vec<SubAgentEvent> {
    let mut events = Vec::new();
    let mut rest = content;
    while let Some(start) = rest.find(AGENT_MARKER_PREFIX) {
        let after = &rest[start + AGENT_MARKER_PREFIX.len()..];
        let Some(end) = after.find(AGENT_MARKER_SUFFIX) else {
            break;
        };
        if let Ok(event) = serde_json::from_str(&after[..end]) {
            events.push(event);
        }
        rest = &after[end + AGENT_MARKER_SUFFIX.len()..];
    }
    events
}

/// Writes OpenAI-style `chat.completion.chunk` frames to a response writer.
///
/// All frames go through one lock so concurrent agents never interleave
/// bytes within a frame.
pub struct SseEmitter {
    writer: Mutex<Box<dyn ResponseWriter>>,
    id: String,
    model: String,
}

impl SseEmitter {
    pub fn new(writer: Box<dyn ResponseWriter>, model: &str) -> Self {
        Self {
            writer: Mutex::new(writer),
            id: format!("chatcmpl-{}", Uuid::new_v4()),
            model: model.to_string(),
        }
    }

    /// Set the stream headers, write `200` and flush
    pub async fn start(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let headers = writer.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("X-Accel-Buffering", HeaderValue::from_static("no"));
        writer.write_header(StatusCode::OK).await?;
        writer.flush().await
    }

    pub async fn write_chunk(&self, content: &str, finish_reason: Option<&str>) -> Result<()> {
        let chunk = CompletionChunk {
            id: &self.id,
            object: "chat.completion.chunk",
            created: 0,
            model: &self.model,
            system_fingerprint: "",
            choices: [ChunkChoice {
                index: 0,
                delta: ChunkDelta { content },
                finish_reason,
            }],
        };
        let frame = format!("data: {}\n\n", serde_json::to_string(&chunk)?);
        self.write_frame(frame.as_bytes()).await
    }

    /// Agent event as a marker inside an ordinary content chunk
    pub async fn write_event(&self, event: &SubAgentEvent) -> Result<()> {
        let marker = agent_marker(event)?;
        self.write_chunk(&marker, None).await
    }

    pub async fn done(&self) -> Result<()> {
        self.write_frame(b"data: [DONE]\n\n").await
    }

    pub fn into_writer(self) -> Box<dyn ResponseWriter> {
        self.writer.into_inner()
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write(frame).await?;
        writer.flush().await
    }
}

#[async_trait]
impl AgentEventSink for SseEmitter {
    async fn text_delta(&self, content: &str) -> Result<()> {
        self.write_chunk(content, None).await
    }

    async fn agent_event(&self, event: &SubAgentEvent) -> Result<()> {
        self.write_event(event).await
    }
}
