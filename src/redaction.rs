use lazy_static::lazy_static;
use regex::Regex;
use std::borrow::Cow;
use std::io::Write;

lazy_static! {
    static ref SECRET_PATTERN: Regex = match Regex::new(
        r#"(?i)(sk-[A-Za-z0-9_\-]{20,}|pplx-[A-Za-z0-9]{20,}|csk-[A-Za-z0-9]{20,}|AIza[0-9A-Za-z_\-]{30,}|Bearer\s+[^\s"]+|(x-goog-api-key|apikey|x-api-key)["':=\s]+[^\s",]+)"#
    ) {
        Ok(re) => re,
        Err(e) => panic!("invalid redaction pattern: {}", e),
    };
}

/// Masks vendor keys and bearer tokens in a log line.
pub fn redact(input: &str) -> Cow<'_, str> {
    SECRET_PATTERN.replace_all(input, "[REDACTED]")
}

/// Scrubs secrets from everything written through it.
pub struct RedactingWriter<W: Write> {
    inner: W,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let input = String::from_utf8_lossy(buf);
        let redacted = redact(&input);
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
