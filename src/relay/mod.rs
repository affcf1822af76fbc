//! Per-vendor stream adapters. Each adapter runs in its own task and writes the
//! normalized byte stream into a bounded channel that backs the response body.

pub mod cerebras;
pub mod gemini;
pub mod openai;
pub mod perplexity;

use crate::logging::StreamMetric;
use crate::types::{Citation, VENDOR_FAILURE_MESSAGE};
use axum::body::Body;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Serialize;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub const CHANNEL_CAPACITY: usize = 64;

pub type BodyChunk = std::result::Result<Bytes, Infallible>;

/// How a route frames its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// Raw text, possibly followed by one `\n{citations}` trailer.
    PlainText,
    /// One JSON object per line.
    NdJson,
}

/// What a finished relay produced, for logging and persistence.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RelayReport {
    pub text: String,
    pub citations: Vec<Citation>,
    /// The browser went away before the vendor stream finished.
    pub client_gone: bool,
}

/// Write half of a relay. Every write reports whether the browser is still
/// listening; a `false` means the adapter should stop reading the vendor.
pub struct RelaySink {
    tx: mpsc::Sender<BodyChunk>,
    vendor: &'static str,
    format: WireFormat,
    pub metric: StreamMetric,
}

impl RelaySink {
    pub fn new(vendor: &'static str, format: WireFormat) -> (Self, mpsc::Receiver<BodyChunk>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self {
                tx,
                vendor,
                format,
                metric: StreamMetric::new(),
            },
            rx,
        )
    }

    pub fn vendor(&self) -> &'static str {
        self.vendor
    }

    async fn send(&mut self, bytes: Bytes) -> bool {
        let n = bytes.len();
        if self.tx.send(Ok(bytes)).await.is_err() {
            tracing::debug!("[{}] Client disconnected, stopping relay", self.vendor);
            return false;
        }
        self.metric.record_bytes(n);
        true
    }

    pub async fn write_text(&mut self, text: &str) -> bool {
        if text.is_empty() {
            return true;
        }
        self.send(Bytes::copy_from_slice(text.as_bytes())).await
    }

    /// Writes an already-serialized JSON object followed by a newline.
    pub async fn write_line(&mut self, json: &str) -> bool {
        let mut line = String::with_capacity(json.len() + 1);
        line.push_str(json);
        line.push('\n');
        self.send(Bytes::from(line)).await
    }

    pub async fn write_json_line<T: Serialize>(&mut self, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.write_line(&json).await,
            Err(e) => {
                tracing::error!("[{}] Could not serialize relay line: {}", self.vendor, e);
                true
            }
        }
    }

    /// Best-effort in-band error. The response status was already sent.
    pub async fn write_failure(&mut self) {
        let _ = match self.format {
            WireFormat::PlainText => self.write_text(VENDOR_FAILURE_MESSAGE).await,
            WireFormat::NdJson => {
                self.write_json_line(&serde_json::json!({ "text": VENDOR_FAILURE_MESSAGE }))
                    .await
            }
        };
    }

    pub fn finish(self) {
        self.metric.log_summary(self.vendor);
    }
}

/// Wraps the receiving half of a relay in a chunked `text/plain` response.
pub fn stream_response(rx: mpsc::Receiver<BodyChunk>) -> Response {
    let body = Body::from_stream(ReceiverStream::new(rx));
    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache, no-transform"),
        ],
        body,
    )
        .into_response()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::sse::{Frame, FrameStream};
    use crate::types::Result;

    pub fn frames<T: Send + 'static>(items: Vec<(String, T)>) -> FrameStream<T> {
        let items: Vec<Result<Frame<T>>> = items
            .into_iter()
            .map(|(raw, chunk)| Ok(Frame { raw, chunk }))
            .collect();
        Box::pin(futures_util::stream::iter(items))
    }

    pub async fn drain(mut rx: mpsc::Receiver<BodyChunk>) -> String {
        let mut out = Vec::new();
        while let Some(Ok(chunk)) = rx.recv().await {
            out.extend_from_slice(&chunk);
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}
