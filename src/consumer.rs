//! Incremental reader for the relay byte streams.
//!
//! Bytes arrive in arbitrary pieces. The consumer decodes UTF-8 across piece
//! boundaries, splits NDJSON output into lines, and folds every recognised
//! record into the answer text, the citation list and the follow-up
//! suggestions. Lines it cannot parse are logged and dropped.

use crate::citations::{
    citations_from_grounding, insert_inline_links, suggestions_from_grounding, zip_citations,
    CitationRecord, CITATIONS_TYPE,
};
use crate::specs::openai::SearchResult;
use crate::types::Citation;
use serde_json::Value;

/// Stateful UTF-8 decoder. An incomplete trailing sequence is held back until
/// the next call; invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(bytes);

        let mut out = String::with_capacity(buf.len());
        let mut rest = &buf[..];
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    break;
                }
                Err(e) => {
                    let (valid, tail) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[bad..];
                        }
                        None => {
                            self.pending = tail.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flushes whatever is still held back. A truncated sequence at the very
    /// end of the stream decodes to U+FFFD.
    pub fn finish(&mut self) -> String {
        let buf = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

/// Framing of a relay route's body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    /// One JSON record per line (gemini, perplexity).
    NdJson,
    /// Raw answer text with an optional trailing citations line (openai, cerebras).
    PlainText,
}

/// A single relay line, classified by shape. Shapes are checked in a fixed
/// order and the first match wins.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamRecord {
    Text(String),
    CandidateText(String),
    Citations(CitationRecord),
    Delta(String),
    SourceList {
        citations: Vec<String>,
        search_results: Vec<SearchResult>,
    },
    Unrecognized,
}

impl StreamRecord {
    pub fn decode(value: &Value) -> Self {
        if let Some(text) = non_empty_str(value.get("text")) {
            return Self::Text(text.to_string());
        }
        if let Some(text) = non_empty_str(value.pointer("/candidates/0/content/parts/0/text")) {
            return Self::CandidateText(text.to_string());
        }
        if value.get("type").and_then(Value::as_str) == Some(CITATIONS_TYPE)
            && value.get("groundingMetadata").is_some()
        {
            match serde_json::from_value::<CitationRecord>(value.clone()) {
                Ok(record) => return Self::Citations(record),
                Err(e) => tracing::debug!("[consumer] Malformed citations record: {}", e),
            }
        }
        if let Some(text) = non_empty_str(value.pointer("/choices/0/delta/content")) {
            return Self::Delta(text.to_string());
        }
        if value.get("citations").is_some() || value.get("search_results").is_some() {
            return Self::SourceList {
                citations: list_field(value, "citations"),
                search_results: list_field(value, "search_results"),
            };
        }
        Self::Unrecognized
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn list_field<T: serde::de::DeserializeOwned>(value: &Value, key: &str) -> Vec<T> {
    match value.get(key) {
        Some(v) if !v.is_null() => match serde_json::from_value::<Vec<T>>(v.clone()) {
            Ok(items) => items,
            Err(e) => {
                tracing::debug!("[consumer] Ignoring malformed '{}' list: {}", key, e);
                Vec::new()
            }
        },
        _ => Vec::new(),
    }
}

/// Everything one AI turn produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamOutcome {
    pub full_text: String,
    pub citations: Vec<Citation>,
    pub suggestions: Vec<String>,
}

pub struct StreamConsumer {
    format: StreamFormat,
    decoder: Utf8Decoder,
    carry: String,
    full_text: String,
    citations: Vec<Citation>,
    suggestions: Vec<String>,
    lines_seen: usize,
    lines_dropped: usize,
}

impl StreamConsumer {
    pub fn new(format: StreamFormat) -> Self {
        Self {
            format,
            decoder: Utf8Decoder::new(),
            carry: String::new(),
            full_text: String::new(),
            citations: Vec::new(),
            suggestions: Vec::new(),
            lines_seen: 0,
            lines_dropped: 0,
        }
    }

    /// Text accumulated so far, for progressive display.
    pub fn text(&self) -> &str {
        &self.full_text
    }

    pub fn citations(&self) -> &[Citation] {
        &self.citations
    }

    pub fn suggestions(&self) -> &[String] {
        &self.suggestions
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        let decoded = self.decoder.decode(bytes);
        match self.format {
            StreamFormat::PlainText => self.full_text.push_str(&decoded),
            StreamFormat::NdJson => {
                self.carry.push_str(&decoded);
                self.drain_complete_lines();
            }
        }
    }

    /// Ends the stream. The unterminated tail, if any, is parsed as a final
    /// line rather than dropped.
    pub fn finish(mut self) -> StreamOutcome {
        let tail = self.decoder.finish();
        match self.format {
            StreamFormat::PlainText => {
                self.full_text.push_str(&tail);
                self.split_trailer();
            }
            StreamFormat::NdJson => {
                self.carry.push_str(&tail);
                self.drain_complete_lines();
                let last = std::mem::take(&mut self.carry);
                self.apply_line(&last);
            }
        }

        tracing::debug!(
            "[consumer] Stream finished: {} chars, {} citations, {} lines ({} dropped)",
            self.full_text.chars().count(),
            self.citations.len(),
            self.lines_seen,
            self.lines_dropped
        );

        StreamOutcome {
            full_text: self.full_text,
            citations: self.citations,
            suggestions: self.suggestions,
        }
    }

    fn drain_complete_lines(&mut self) {
        while let Some(pos) = self.carry.find('\n') {
            let line: String = self.carry.drain(..=pos).collect();
            self.apply_line(&line);
        }
    }

    fn apply_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        self.lines_seen += 1;
        let value = match serde_json::from_str::<Value>(line) {
            Ok(v) => v,
            Err(e) => {
                self.lines_dropped += 1;
                tracing::debug!(
                    "[consumer] Discarding unparsable line ({}): {}",
                    e,
                    crate::str_utils::prefix_chars(line, 120)
                );
                return;
            }
        };
        self.apply(StreamRecord::decode(&value));
    }

    fn apply(&mut self, record: StreamRecord) {
        match record {
            StreamRecord::Text(t) | StreamRecord::CandidateText(t) | StreamRecord::Delta(t) => {
                self.full_text.push_str(&t)
            }
            StreamRecord::Citations(record) => self.apply_citations(&record),
            StreamRecord::SourceList {
                citations,
                search_results,
            } => {
                self.citations = zip_citations(&citations, &search_results);
            }
            StreamRecord::Unrecognized => {
                self.lines_dropped += 1;
                tracing::debug!("[consumer] Ignoring record of unknown shape");
            }
        }
    }

    fn apply_citations(&mut self, record: &CitationRecord) {
        self.citations = citations_from_grounding(&record.grounding_metadata);
        self.suggestions = suggestions_from_grounding(&record.grounding_metadata);
        if record.has_segment_mapping() {
            self.full_text = insert_inline_links(&self.full_text, &self.citations);
        }
    }

    /// Plain-text routes may end with `\n{"type":"citations",...}`; that line is
    /// removed from the answer and its sources applied.
    fn split_trailer(&mut self) {
        let Some(pos) = self.full_text.rfind('\n') else {
            return;
        };
        let tail = self.full_text[pos + 1..].trim();
        if !tail.starts_with('{') {
            return;
        }
        let record = match serde_json::from_str::<Value>(tail) {
            Ok(v) => match StreamRecord::decode(&v) {
                StreamRecord::Citations(record) => record,
                _ => return,
            },
            Err(_) => return,
        };
        self.full_text.truncate(pos);
        self.apply_citations(&record);
    }
}

/// Runs a complete body through a fresh consumer.
pub fn consume_all<'a, I>(format: StreamFormat, pieces: I) -> StreamOutcome
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut consumer = StreamConsumer::new(format);
    for piece in pieces {
        consumer.feed(piece);
    }
    consumer.finish()
}
