//! Logging (C10): `tracing-subscriber` setup plus a redaction layer that
//! scrubs bot tokens from formatted log lines before they reach the sink.
//! Ported from `original_source/src/takopi/logging.py` (`_TokenRedactor`,
//! `configure_logging`).

use std::sync::LazyLock;

use regex::Regex;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

static BOT_TOKEN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bbot\d+:[A-Za-z0-9_-]+").unwrap());
static BARE_TOKEN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+:[A-Za-z0-9_-]{10,}").unwrap());

/// Replaces any substring that looks like a Telegram bot token
/// (`bot<digits>:<base64url>` or bare `<digits>:<base64url, len>=10>`) with
/// a fixed placeholder. Idempotent: redacting already-redacted text is a
/// no-op.
pub fn redact(line: &str) -> String {
    let once = BOT_TOKEN_PATTERN.replace_all(line, "bot[REDACTED]");
    BARE_TOKEN_PATTERN.replace_all(&once, "[REDACTED_TOKEN]").into_owned()
}

struct RedactingWriter<W> {
    inner: W,
}

impl<W: std::io::Write> std::io::Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        let redacted = redact(&text);
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter;

impl<'a> MakeWriter<'a> for RedactingMakeWriter {
    type Writer = RedactingWriter<std::io::Stderr>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter { inner: std::io::stderr() }
    }
}

/// Installs the global `tracing` subscriber. Honors `RUST_LOG`, defaulting
/// to `info` for this crate and `warn` for dependencies. Every formatted
/// line passes through [`redact`] before it reaches stderr, so a bot token
/// logged incidentally (e.g. inside an error message) never appears in
/// plaintext.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,bridge_bot=info"));

    let writer = BoxMakeWriter::new(RedactingMakeWriter);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_bot_prefixed_token() {
        let line = "request to https://api.telegram.org/bot123456789:AAFakeTokenValue12345/sendMessage";
        let redacted = redact(line);
        assert!(!redacted.contains("AAFakeTokenValue12345"));
        assert!(redacted.contains("bot[REDACTED]"));
    }

    #[test]
    fn redacts_bare_token() {
        let line = "token=123456789:AAFakeTokenValue12345abcdef";
        let redacted = redact(line);
        assert!(!redacted.contains("AAFakeTokenValue12345abcdef"));
    }

    #[test]
    fn short_numeric_pairs_are_left_alone() {
        let line = "chat_id=42:1 ratio looks fine";
        assert_eq!(redact(line), line);
    }

    #[test]
    fn redaction_is_idempotent() {
        let line = "bot123456789:AAFakeTokenValue12345";
        let once = redact(line);
        let twice = redact(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn lines_without_tokens_are_unchanged() {
        let line = "starting session for engine=codex chat=42";
        assert_eq!(redact(line), line);
    }
}
