use axum::{
    body::Body,
    http::{HeaderValue, Request, Response},
    middleware::Next,
};
use std::panic;
use tracing::{error, info};
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Keeps the non-blocking writers alive; dropping it flushes the log files.
pub struct LogGuards {
    _file: tracing_appender::non_blocking::WorkerGuard,
    _trace: tracing_appender::non_blocking::WorkerGuard,
}

/// Installs the global subscriber: stdout, a daily plain-text log, a daily
/// NDJSON trace file with secrets scrubbed, and span-trace capture for errors.
pub fn init_tracing(log_dir: &str) -> LogGuards {
    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "learnflow=debug,tower_http=info".into(),
    };

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!("Could not create log directory {}: {}", log_dir, e);
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, "learnflow.log");
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    let trace_appender = tracing_appender::rolling::daily(log_dir, "trace.ndjson");
    let (trace_writer, trace_guard) = tracing_appender::non_blocking(trace_appender);

    let init = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .with(crate::trace_layer::NdjsonTraceLayer::new(
            crate::redaction::RedactingWriter::new(trace_writer),
        ))
        .with(tracing_error::ErrorLayer::default())
        .try_init();

    if let Err(e) = init {
        eprintln!("Tracing already initialised: {}", e);
    }

    LogGuards {
        _file: file_guard,
        _trace: trace_guard,
    }
}

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = match panic_info.location() {
            Some(l) => format!("{}:{}:{}", l.file(), l.line(), l.column()),
            None => "unknown location".to_string(),
        };

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Tags each request with an id (reusing one supplied by the caller) and runs
/// the handler inside a `request` span carrying it.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = match req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => Uuid::new_v4().to_string(),
    };

    if let Ok(val) = HeaderValue::from_str(&request_id) {
        req.headers_mut().insert(REQUEST_ID_HEADER, val);
    }

    let span = info_span!("request", request_id = %request_id);
    let mut response = next.run(req).instrument(span).await;

    if let Ok(val) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, val);
    }
    response
}

#[derive(Default, Debug)]
pub struct StreamMetric {
    pub chunks: usize,
    pub text_chars: usize,
    pub citation_lines: usize,
    pub bytes_out: usize,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_chunk(&mut self, text: Option<&str>) {
        self.chunks += 1;
        if let Some(t) = text {
            self.text_chars += t.chars().count();
        }
    }

    pub fn record_citations(&mut self) {
        self.citation_lines += 1;
    }

    pub fn record_bytes(&mut self, n: usize) {
        self.bytes_out += n;
    }

    /// Logged inside the relay task, so the request span supplies the request id.
    pub fn log_summary(&self, vendor: &str) {
        info!(
            target: "relay",
            "[STREAM END] {} | Chunks: {} | Text: {} chars | Citations: {} | Out: {} bytes",
            vendor, self.chunks, self.text_chars, self.citation_lines, self.bytes_out
        );
    }
}
