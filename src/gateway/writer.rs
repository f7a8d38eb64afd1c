//! Response sinks for tool calls

use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use tokio::sync::mpsc;

/// Where a tool call writes its response.
///
/// Headers may be changed until the status is written. Writing a chunk
/// before a status implies `200 OK`.
#[async_trait]
pub trait ResponseWriter: Send {
    fn headers(&self) -> &HeaderMap;
    fn headers_mut(&mut self) -> &mut HeaderMap;
    async fn write_header(&mut self, status: StatusCode) -> Result<()>;
    async fn write(&mut self, chunk: &[u8]) -> Result<()>;
    async fn flush(&mut self) -> Result<()>;
}

/// Collects the whole response in memory
#[derive(Debug, Default)]
pub struct BufferedResponseWriter {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Vec<u8>,
    flushes: usize,
}

impl BufferedResponseWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Written status, `200` when only a body was written
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    pub fn header_written(&self) -> bool {
        self.status.is_some()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn flush_count(&self) -> usize {
        self.flushes
    }

    pub fn into_parts(self) -> (StatusCode, HeaderMap, Vec<u8>) {
        (self.status.unwrap_or(StatusCode::OK), self.headers, self.body)
    }
}

#[async_trait]
impl ResponseWriter for BufferedResponseWriter {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    async fn write_header(&mut self, status: StatusCode) -> Result<()> {
        if self.status.is_none() {
            self.status = Some(status);
        }
        Ok(())
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if self.status.is_none() {
            self.status = Some(StatusCode::OK);
        }
        self.body.extend_from_slice(chunk);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }
}

/// Events emitted by [`ChannelResponseWriter`]
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    Head { status: StatusCode, headers: HeaderMap },
    Chunk(Bytes),
    Flush,
}

/// Forwards the response over a channel as it is produced
#[derive(Debug)]
pub struct ChannelResponseWriter {
    headers: HeaderMap,
    head_sent: bool,
    sender: mpsc::Sender<ResponseEvent>,
}

impl ChannelResponseWriter {
    pub fn new(sender: mpsc::Sender<ResponseEvent>) -> Self {
        Self {
            headers: HeaderMap::new(),
            head_sent: false,
            sender,
        }
    }

    async fn send(&self, event: ResponseEvent) -> Result<()> {
        self.sender
            .send(event)
            .await
            .map_err(|_| GatewayError::cancelled("response receiver dropped"))
    }
}

#[async_trait]
impl ResponseWriter for ChannelResponseWriter {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    async fn write_header(&mut self, status: StatusCode) -> Result<()> {
        if self.head_sent {
            return Ok(());
        }
        self.head_sent = true;
        let headers = self.headers.clone();
        self.send(ResponseEvent::Head { status, headers }).await
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if !self.head_sent {
            self.write_header(StatusCode::OK).await?;
        }
        self.send(ResponseEvent::Chunk(Bytes::copy_from_slice(chunk))).await
    }

    async fn flush(&mut self) -> Result<()> {
        self.send(ResponseEvent::Flush).await
    }
}
