//! Relay of the runtime's stdout/stderr into the host's streams
//!
//! Purely for human observability: nothing here feeds back into the readiness
//! handshake or request handling.

use crate::ansi::strip_ansi_codes;
use crate::lines::read_bounded_line;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

/// Marker placed in front of every relayed line
pub const LOG_MARKER: &str = "[functions]";

/// Longest line relayed as-is; the rest of a longer line is dropped
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Destination for one relayed stream
pub type LogWriter = Box<dyn AsyncWrite + Send + Unpin>;

type WriterFactory = Arc<dyn Fn() -> LogWriter + Send + Sync>;

/// Where relayed runtime output is written (default: the host's stdout and stderr)
#[derive(Clone)]
pub struct LogSinks {
    stdout: WriterFactory,
    stderr: WriterFactory,
}

impl LogSinks {
    pub fn new<O, E>(stdout: O, stderr: E) -> Self
    where
        O: Fn() -> LogWriter + Send + Sync + 'static,
        E: Fn() -> LogWriter + Send + Sync + 'static,
    {
        Self {
            stdout: Arc::new(stdout),
            stderr: Arc::new(stderr),
        }
    }

    /// A fresh writer for lines coming from `stream`
    pub fn writer(&self, stream: LogStream) -> LogWriter {
        match stream {
            LogStream::Stdout => (self.stdout)(),
            LogStream::Stderr => (self.stderr)(),
        }
    }
}

impl Default for LogSinks {
    fn default() -> Self {
        Self::new(
            || Box::new(tokio::io::stdout()),
            || Box::new(tokio::io::stderr()),
        )
    }
}

impl fmt::Debug for LogSinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSinks").finish_non_exhaustive()
    }
}

/// Which of the runtime's output streams a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    /// Prefix for lines from this stream; stderr lines get a red marker
    pub fn prefix(&self) -> String {
        match self {
            LogStream::Stdout => LOG_MARKER.to_string(),
            LogStream::Stderr => format!("\x1b[31m{}\x1b[0m", LOG_MARKER),
        }
    }
}

/// Turn a block of runtime output into the lines to re-emit.
///
/// Escape codes are stripped, blank lines dropped and every remaining line prefixed.
pub fn format_log_lines(text: &str, stream: LogStream) -> Vec<String> {
    let prefix = stream.prefix();
    strip_ansi_codes(text)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| format!("{} {}", prefix, line))
        .collect()
}

/// Copy `reader` into `writer` line by line until EOF, returning the number of
/// lines written.
///
/// Lines are split on `\n` before decoding, so a line or a multi-byte character
/// split across two reads is still relayed intact. Lines longer than
/// [`MAX_LINE_LEN`] are cut at that length.
pub async fn relay_output<R, W>(reader: R, mut writer: W, stream: LogStream) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut written = 0;

    while let Some(truncated) = read_bounded_line(&mut reader, &mut buf, MAX_LINE_LEN).await? {
        if truncated {
            warn!(?stream, limit = MAX_LINE_LEN, "Runtime output line too long, truncated");
        }

        for line in format_log_lines(&String::from_utf8_lossy(&buf), stream) {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            written += 1;
        }
        writer.flush().await?;
    }

    debug!(?stream, lines = written, "Runtime output stream closed");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_strips_codes_and_prefixes() {
        let lines = format_log_lines(
            "\x1b[32m[wrangler:inf]\x1b[0m Ready on http://127.0.0.1:8788\n",
            LogStream::Stdout,
        );
        assert_eq!(
            lines,
            vec!["[functions] [wrangler:inf] Ready on http://127.0.0.1:8788"]
        );
    }

    #[test]
    fn test_format_drops_blank_lines() {
        let lines = format_log_lines("first\n\n   \n\x1b[0m\nsecond\r\n", LogStream::Stdout);
        assert_eq!(lines, vec!["[functions] first", "[functions] second"]);
    }

    #[test]
    fn test_format_stderr_marker_is_colored() {
        let lines = format_log_lines("boom", LogStream::Stderr);
        assert_eq!(lines, vec!["\x1b[31m[functions]\x1b[0m boom"]);
    }

    #[test]
    fn test_format_empty_input() {
        assert!(format_log_lines("", LogStream::Stdout).is_empty());
        assert!(format_log_lines("\n\n", LogStream::Stderr).is_empty());
    }

    #[tokio::test]
    async fn test_relay_output_writes_prefixed_lines() {
        let input: &[u8] = b"\x1b[1mcompiled\x1b[0m\n\nlistening\npartial";
        let mut output = Vec::new();

        let written = relay_output(input, &mut output, LogStream::Stdout)
            .await
            .unwrap();

        assert_eq!(written, 3);
        assert_eq!(
            String::from_utf8(output).unwrap(),
            "[functions] compiled\n[functions] listening\n[functions] partial\n"
        );
    }

    #[tokio::test]
    async fn test_relay_output_truncates_long_lines() {
        let mut input = vec![b'x'; MAX_LINE_LEN + 100];
        input.extend_from_slice(b"\nafter\n");
        let mut output = Vec::new();

        let written = relay_output(&input[..], &mut output, LogStream::Stdout)
            .await
            .unwrap();

        assert_eq!(written, 2);
        let output = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines[0].len(), "[functions] ".len() + MAX_LINE_LEN);
        assert_eq!(lines[1], "[functions] after");
    }

    #[tokio::test]
    async fn test_sinks_route_by_stream() {
        use parking_lot::Mutex;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (out, err) = (Arc::clone(&seen), Arc::clone(&seen));
        let sinks = LogSinks::new(
            move || {
                out.lock().push(LogStream::Stdout);
                Box::new(tokio::io::sink())
            },
            move || {
                err.lock().push(LogStream::Stderr);
                Box::new(tokio::io::sink())
            },
        );

        let _ = sinks.writer(LogStream::Stderr);
        let _ = sinks.clone().writer(LogStream::Stdout);
        assert_eq!(*seen.lock(), vec![LogStream::Stderr, LogStream::Stdout]);
    }

    #[tokio::test]
    async fn test_relay_output_keeps_split_lines_together() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let relay = tokio::spawn(async move {
            let mut output = Vec::new();
            relay_output(rx, &mut output, LogStream::Stderr).await.unwrap();
            output
        });

        tx.write_all("⛅️ wran".as_bytes()).await.unwrap();
        tx.write_all("gler\n".as_bytes()).await.unwrap();
        drop(tx);

        let output = String::from_utf8(relay.await.unwrap()).unwrap();
        assert_eq!(output, "\x1b[31m[functions]\x1b[0m ⛅️ wrangler\n");
    }
}
