//! Server-sent events decoding and the shared provider stream driver.

use std::collections::VecDeque;

use futures::stream;
use tokio_util::sync::CancellationToken;

use super::ModelStream;
use super::message::ModelEvent;
use crate::errors::ModelError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental decoder: feed raw body chunks, get complete events back.
/// Chunks may split lines (and UTF-8 sequences) anywhere.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.line(line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush whatever is buffered at end of body.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw).trim_end().to_string();
            if let Some(event) = self.line(&line) {
                events.push(event);
            }
        }
        if let Some(event) = self.dispatch() {
            events.push(event);
        }
        events
    }

    fn line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        Some(SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

/// Provider-specific translation of SSE events into model events.
pub trait SseParser: Send + 'static {
    fn on_event(&mut self, event: &SseEvent) -> Result<Vec<ModelEvent>, ModelError>;

    /// Called once the body ends. Returns any events still owed.
    fn finish(&mut self) -> Result<Vec<ModelEvent>, ModelError>;
}

struct StreamState<P> {
    response: reqwest::Response,
    decoder: SseDecoder,
    parser: P,
    pending: VecDeque<ModelEvent>,
    cancel: CancellationToken,
    done: bool,
}

impl<P: SseParser> StreamState<P> {
    fn feed(&mut self, events: Vec<SseEvent>) -> Result<(), ModelError> {
        for event in events {
            let out = self.parser.on_event(&event)?;
            self.pending.extend(out);
        }
        Ok(())
    }
}

/// Turn a streaming HTTP response into a `ModelStream`. The stream yields
/// `ModelError::Cancelled` and ends as soon as `cancel` fires.
pub fn into_model_stream<P: SseParser>(
    response: reqwest::Response,
    parser: P,
    cancel: CancellationToken,
) -> ModelStream {
    let state = StreamState {
        response,
        decoder: SseDecoder::new(),
        parser,
        pending: VecDeque::new(),
        cancel,
        done: false,
    };

    Box::pin(stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((Ok(event), st));
            }
            if st.done {
                return None;
            }

            let cancel = st.cancel.clone();
            let chunk = tokio::select! {
                _ = cancel.cancelled() => None,
                chunk = st.response.chunk() => Some(chunk),
            };
            let Some(chunk) = chunk else {
                st.done = true;
                return Some((Err(ModelError::Cancelled), st));
            };

            let fed = match chunk {
                Ok(Some(bytes)) => {
                    let events = st.decoder.push(&bytes);
                    st.feed(events)
                }
                Ok(None) => {
                    st.done = true;
                    let events = st.decoder.finish();
                    st.feed(events).and_then(|_| {
                        let tail = st.parser.finish()?;
                        st.pending.extend(tail);
                        Ok(())
                    })
                }
                Err(e) => Err(ModelError::from(e)),
            };
            if let Err(e) = fed {
                st.done = true;
                st.pending.clear();
                return Some((Err(e), st));
            }
        }
    }))
}
