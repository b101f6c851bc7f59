// src/sse.rs
//! Server-push (`text/event-stream`) plumbing: an incremental frame decoder and
//! the [`StreamConnector`] seam the stream consumers open connections through.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::{header, Client, StatusCode};

use crate::gateway::{Access, TokenSource};

/// Default event name when a frame carries no `event:` field.
pub const MESSAGE: &str = "message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
    /// Last event id seen on the connection (it persists across frames).
    pub id: Option<String>,
}

impl SseEvent {
    pub fn message(data: impl Into<String>) -> Self {
        Self::named(MESSAGE, data)
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
            id: None,
        }
    }
}

/// Incremental decoder: feed raw chunks, get back completed events.
/// Handles LF, CR and CRLF line endings, including a CRLF split across chunks.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    skip_lf: bool,
    event: Option<String>,
    data: Vec<String>,
    last_id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut input = chunk;
        if self.skip_lf && !input.is_empty() {
            if input[0] == b'\n' {
                input = &input[1..];
            }
            self.skip_lf = false;
        }
        self.buf.extend_from_slice(input);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut i = 0;
        let len = self.buf.len();
        while i < len {
            let b = self.buf[i];
            if b == b'\n' || b == b'\r' {
                lines.push(String::from_utf8_lossy(&self.buf[start..i]).into_owned());
                if b == b'\r' {
                    if i + 1 < len {
                        if self.buf[i + 1] == b'\n' {
                            i += 1;
                        }
                    } else {
                        self.skip_lf = true;
                    }
                }
                start = i + 1;
            }
            i += 1;
        }
        self.buf.drain(..start);

        lines
            .into_iter()
            .filter_map(|line| self.process_line(&line))
            .collect()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" if !value.contains('\0') => self.last_id = Some(value.to_string()),
            // retry hints are ignored: the reconnect delay is fixed
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| MESSAGE.to_string()),
            data,
            id: self.last_id.clone(),
        })
    }
}

pub type EventStream = BoxStream<'static, Result<SseEvent>>;

/// Opens persistent server-push connections.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Resolves once the connection is open. Transport failures after that
    /// surface as `Err` items; a clean server close ends the stream.
    async fn connect(&self, url: &str, access: Access) -> Result<EventStream>;
}

#[derive(Clone)]
pub struct HttpStreamConnector {
    client: Client,
    tokens: Option<Arc<dyn TokenSource>>,
}

impl HttpStreamConnector {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            tokens: None,
        }
    }

    pub fn with_tokens(mut self, tokens: Arc<dyn TokenSource>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    async fn open(&self, url: &str, bearer: Option<String>) -> Result<reqwest::Response> {
        let mut req = self
            .client
            .get(url)
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache");
        if let Some(token) = bearer {
            req = req.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        req.send()
            .await
            .with_context(|| format!("open event stream {url}"))
    }
}

#[async_trait]
impl StreamConnector for HttpStreamConnector {
    async fn connect(&self, url: &str, access: Access) -> Result<EventStream> {
        let tokens = match (access, &self.tokens) {
            (Access::Authenticated, Some(tokens)) => Some(tokens),
            _ => None,
        };
        let bearer = match tokens {
            Some(tokens) => tokens.access_token().await,
            None => None,
        };
        let mut resp = self.open(url, bearer).await?;

        // Same single refresh-and-retry the request gateway does.
        if let Some(tokens) = tokens.filter(|_| resp.status() == StatusCode::UNAUTHORIZED) {
            match tokens.refresh().await {
                Ok(()) => resp = self.open(url, tokens.access_token().await).await?,
                Err(e) => {
                    tracing::warn!(target: "gateway", url, error = %format!("{e:#}"), "token refresh failed")
                }
            }
        }
        let resp = resp
            .error_for_status()
            .with_context(|| format!("event stream {url} refused"))?;

        let body = Box::pin(resp.bytes_stream());
        let events = futures::stream::unfold(
            (body, SseDecoder::new(), VecDeque::new()),
            |(mut body, mut decoder, mut pending)| async move {
                loop {
                    if let Some(ev) = pending.pop_front() {
                        return Some((Ok(ev), (body, decoder, pending)));
                    }
                    match body.next().await {
                        Some(Ok(chunk)) => pending.extend(decoder.push(&chunk)),
                        Some(Err(e)) => {
                            let err = anyhow::Error::new(e).context("reading event stream");
                            return Some((Err(err), (body, decoder, pending)));
                        }
                        None => return None,
                    }
                }
            },
        );
        Ok(events.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_named_and_default_events() {
        let mut d = SseDecoder::new();
        let out = d.push(b"event: activity\ndata: {\"id\":1}\n\ndata: plain\n\n");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].event, "activity");
        assert_eq!(out[0].data, "{\"id\":1}");
        assert_eq!(out[1].event, MESSAGE);
        assert_eq!(out[1].data, "plain");
    }

    #[test]
    fn joins_multiline_data_and_skips_comments() {
        let mut d = SseDecoder::new();
        let out = d.push(b": keep-alive\ndata: a\ndata: b\n\n");
        assert_eq!(out, vec![SseEvent::message("a\nb")]);
    }

    #[test]
    fn frames_split_across_chunks() {
        let mut d = SseDecoder::new();
        assert!(d.push(b"event: heart").is_empty());
        assert!(d.push(b"beat\ndata:").is_empty());
        let out = d.push(b"\n\n");
        // empty data line still counts as data
        assert_eq!(out, vec![SseEvent::named("heartbeat", "")]);
    }

    #[test]
    fn crlf_and_bare_cr_line_endings() {
        let mut d = SseDecoder::new();
        let out = d.push(b"data: one\r\n\r\ndata: two\r\r");
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].data, "two");

        // CR at the end of a chunk, LF at the start of the next
        let mut d = SseDecoder::new();
        assert!(d.push(b"data: x\r").is_empty());
        let out = d.push(b"\n\r\n");
        assert_eq!(out, vec![SseEvent::message("x")]);
    }

    #[test]
    fn id_persists_and_blank_frames_do_not_dispatch() {
        let mut d = SseDecoder::new();
        let out = d.push(b"id: 7\nevent: activity\n\ndata: a\n\n");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id.as_deref(), Some("7"));
        // the event name from the data-less frame was discarded
        assert_eq!(out[0].event, MESSAGE);
    }

    #[test]
    fn field_without_colon_and_unknown_fields() {
        let mut d = SseDecoder::new();
        let out = d.push(b"retry: 100\nfoo: bar\ndata\n\n");
        assert_eq!(out, vec![SseEvent::message("")]);
    }
}
