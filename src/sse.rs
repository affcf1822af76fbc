use crate::types::{LearnFlowError, Result};
use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use std::pin::Pin;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// One decoded `data:` event together with its original JSON text, which the
/// NDJSON relays forward verbatim.
#[derive(Debug, Clone)]
pub struct Frame<T> {
    pub raw: String,
    pub chunk: T,
}

pub type FrameStream<T> = Pin<Box<dyn Stream<Item = Result<Frame<T>>> + Send>>;

/// Frames a vendor's SSE response body into typed chunks, ending at `[DONE]`.
pub fn frames<T>(response: reqwest::Response) -> FrameStream<T>
where
    T: DeserializeOwned + Send + 'static,
{
    let bytes_stream = response
        .bytes_stream()
        .map(|r| r.map_err(std::io::Error::other));
    frames_from_bytes(bytes_stream)
}

pub fn frames_from_bytes<S, T>(bytes_stream: S) -> FrameStream<T>
where
    S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
    T: DeserializeOwned + Send + 'static,
{
    let lines_stream = FramedRead::new(
        tokio_util::io::StreamReader::new(bytes_stream),
        LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
    );

    let stream = lines_stream
        .take_while(|line| {
            let done = matches!(line, Ok(l) if is_done_marker(l));
            if done {
                tracing::debug!("[vendor] Stream end marker [DONE] received");
            }
            futures_util::future::ready(!done)
        })
        .filter_map(|line| futures_util::future::ready(decode_line::<T>(line)));

    Box::pin(stream)
}

fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

fn is_done_marker(line: &str) -> bool {
    data_payload(line) == Some("[DONE]")
}

fn decode_line<T: DeserializeOwned>(
    line: std::result::Result<String, LinesCodecError>,
) -> Option<Result<Frame<T>>> {
    match line {
        Ok(line) => {
            let data = data_payload(&line)?;
            if data.is_empty() {
                return None;
            }
            match serde_json::from_str::<T>(data) {
                Ok(chunk) => Some(Ok(Frame {
                    raw: data.to_string(),
                    chunk,
                })),
                Err(e) => {
                    tracing::warn!(
                        "[vendor] Skipping undecodable event ({}): {}",
                        e,
                        crate::str_utils::prefix_chars(data, 200)
                    );
                    None
                }
            }
        }
        Err(LinesCodecError::Io(e)) => Some(Err(LearnFlowError::Io(e).into())),
        Err(LinesCodecError::MaxLineLengthExceeded) => Some(Err(LearnFlowError::Protocol(
            "vendor event exceeded maximum line length".to_string(),
        )
        .into())),
    }
}
