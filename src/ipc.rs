//! Message channel between the launcher and the runtime process
//!
//! The runtime gets a dedicated channel next to its stdio, speaking the Node.js
//! `fork()` IPC protocol: a Unix socket on file descriptor 3, announced through
//! `NODE_CHANNEL_FD`, carrying one JSON value per line. A runtime started through
//! `node` therefore sees a regular `process.send()` channel.
//!
//! The first message on the channel is the readiness signal carrying the bound
//! address. Every later message means the runtime restarted.

use crate::lines::read_bounded_line;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncRead, BufReader};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// File descriptor the channel occupies in the child
pub const CHILD_CHANNEL_FD: i32 = 3;

/// Environment variable telling a Node.js child which descriptor carries the channel
pub const NODE_CHANNEL_FD_ENV: &str = "NODE_CHANNEL_FD";

/// Environment variable selecting newline-delimited JSON framing
pub const NODE_CHANNEL_SERIALIZATION_MODE_ENV: &str = "NODE_CHANNEL_SERIALIZATION_MODE";

/// Longest message kept from the channel; longer lines are treated as malformed
pub const MAX_MESSAGE_LEN: usize = 1024 * 1024;

/// Invoked for every message after the readiness signal
pub type RestartCallback = Arc<dyn Fn() + Send + Sync>;

/// Result delivered into the readiness slot: the decoded address or why decoding failed
pub type ReadySignal = Result<ReadyMessage, String>;

/// Address the runtime bound to, as sent in its first message
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReadyMessage {
    pub ip: String,
    pub port: u16,
}

impl ReadyMessage {
    /// Base URL for reaching the runtime over HTTP
    pub fn url(&self) -> String {
        if self.ip.contains(':') && !self.ip.starts_with('[') {
            format!("http://[{}]:{}", self.ip, self.port)
        } else {
            format!("http://{}:{}", self.ip, self.port)
        }
    }
}

/// Decode the readiness payload.
///
/// The address may arrive as a JSON object or, as wrangler sends it, as a JSON
/// string holding the serialized object.
pub fn parse_ready(value: &Value) -> Result<ReadyMessage, String> {
    let parsed = match value {
        Value::String(inner) => serde_json::from_str(inner),
        other => ReadyMessage::deserialize(other),
    };
    parsed.map_err(|e| e.to_string())
}

/// Messages Node.js exchanges for its own bookkeeping (`{"cmd": "NODE_..."}`)
pub fn is_internal_message(value: &Value) -> bool {
    value
        .get("cmd")
        .and_then(Value::as_str)
        .is_some_and(|cmd| cmd.starts_with("NODE_"))
}

/// Decoded form of one line read from the channel
#[derive(Debug)]
enum Frame {
    Blank,
    Internal,
    Message(Result<Value, String>),
}

fn decode_frame(line: &[u8], truncated: bool) -> Frame {
    if truncated {
        return Frame::Message(Err(format!(
            "message exceeds {} bytes",
            MAX_MESSAGE_LEN
        )));
    }
    if line.trim_ascii().is_empty() {
        return Frame::Blank;
    }
    match serde_json::from_slice::<Value>(line) {
        Ok(value) if is_internal_message(&value) => Frame::Internal,
        Ok(value) => Frame::Message(Ok(value)),
        Err(e) => Frame::Message(Err(e.to_string())),
    }
}

/// Read the channel until the runtime closes it.
///
/// The first message is decoded and delivered to `ready_tx`; every later message
/// calls `on_restart`, whatever its payload. Lines that are not JSON (or not even
/// UTF-8) still count as messages. The loop keeps running after the readiness
/// slot is filled, even if nobody is waiting on it anymore. Dropping `ready_tx`
/// without sending (channel closed before any message) lets the receiver observe
/// the closure.
pub async fn listen<R>(reader: R, ready_tx: oneshot::Sender<ReadySignal>, on_restart: RestartCallback)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut ready_tx = Some(ready_tx);
    let mut restarts = 0u64;

    loop {
        let truncated = match read_bounded_line(&mut reader, &mut buf, MAX_MESSAGE_LEN).await {
            Ok(Some(truncated)) => truncated,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Error reading from runtime message channel");
                break;
            }
        };

        let message = match decode_frame(&buf, truncated) {
            Frame::Blank => continue,
            Frame::Internal => {
                debug!(message = %String::from_utf8_lossy(&buf).trim_end(), "Ignoring internal channel message");
                continue;
            }
            Frame::Message(message) => message,
        };

        match ready_tx.take() {
            Some(tx) => {
                let signal = message.and_then(|v| parse_ready(&v));
                if tx.send(signal).is_err() {
                    debug!("Readiness message arrived after the launch stopped waiting");
                }
            }
            None => {
                if let Err(reason) = &message {
                    debug!(%reason, "Undecodable message counted as a restart");
                }
                restarts += 1;
                info!(restarts, "Functions runtime restarted");
                on_restart();
            }
        }
    }

    debug!(restarts, "Runtime message channel closed");
}

#[cfg(unix)]
pub use self::unix::{channel, ChildEnd};

#[cfg(unix)]
mod unix {
    use super::{CHILD_CHANNEL_FD, NODE_CHANNEL_FD_ENV, NODE_CHANNEL_SERIALIZATION_MODE_ENV};
    use std::io;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream as StdUnixStream;
    use tokio::net::UnixStream;
    use tokio::process::Command;

    /// The child's side of the channel. Keep it alive until the child has been
    /// spawned, then drop it so the parent sees EOF when the child exits.
    pub struct ChildEnd(StdUnixStream);

    /// Create a connected socket pair: the parent's async end and the child's end
    pub fn channel() -> io::Result<(UnixStream, ChildEnd)> {
        let (parent, child) = StdUnixStream::pair()?;
        parent.set_nonblocking(true)?;
        Ok((UnixStream::from_std(parent)?, ChildEnd(child)))
    }

    impl ChildEnd {
        /// Arrange for `cmd` to inherit this socket as descriptor 3
        pub fn attach(&self, cmd: &mut Command) {
            let fd = self.0.as_raw_fd();
            cmd.env(NODE_CHANNEL_FD_ENV, CHILD_CHANNEL_FD.to_string());
            cmd.env(NODE_CHANNEL_SERIALIZATION_MODE_ENV, "json");

            // SAFETY: the hook runs between fork and exec and only makes
            // async-signal-safe libc calls on descriptors owned by this process.
            unsafe {
                cmd.pre_exec(move || {
                    if fd == CHILD_CHANNEL_FD {
                        // Already in place; dup2 would be a no-op and leave CLOEXEC set
                        let flags = libc::fcntl(fd, libc::F_GETFD);
                        if flags < 0
                            || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0
                        {
                            return Err(io::Error::last_os_error());
                        }
                    } else if libc::dup2(fd, CHILD_CHANNEL_FD) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;

    fn counting_callback() -> (RestartCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let callback: RestartCallback = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (callback, count)
    }

    #[test]
    fn test_parse_ready_object() {
        let value = serde_json::json!({"ip": "127.0.0.1", "port": 8787});
        let ready = parse_ready(&value).unwrap();

        assert_eq!(ready.ip, "127.0.0.1");
        assert_eq!(ready.port, 8787);
        assert_eq!(ready.url(), "http://127.0.0.1:8787");
    }

    #[test]
    fn test_parse_ready_stringified_object() {
        let value = Value::String(r#"{"ip":"0.0.0.0","port":8788}"#.to_string());
        assert_eq!(parse_ready(&value).unwrap().url(), "http://0.0.0.0:8788");
    }

    #[test]
    fn test_parse_ready_ignores_extra_fields() {
        let value = serde_json::json!({"ip": "localhost", "port": 9000, "inspectorPort": 9229});
        assert_eq!(parse_ready(&value).unwrap().url(), "http://localhost:9000");
    }

    #[test]
    fn test_parse_ready_rejects_malformed() {
        assert!(parse_ready(&serde_json::json!({"ip": "127.0.0.1"})).is_err());
        assert!(parse_ready(&serde_json::json!({"ip": "127.0.0.1", "port": 70000})).is_err());
        assert!(parse_ready(&Value::String("not json".to_string())).is_err());
        assert!(parse_ready(&serde_json::json!(42)).is_err());
    }

    #[test]
    fn test_ipv6_url_is_bracketed() {
        let ready = ReadyMessage {
            ip: "::1".to_string(),
            port: 8787,
        };
        assert_eq!(ready.url(), "http://[::1]:8787");
    }

    #[test]
    fn test_internal_message_detection() {
        assert!(is_internal_message(&serde_json::json!({"cmd": "NODE_HANDLE_ACK"})));
        assert!(!is_internal_message(&serde_json::json!({"cmd": "reload"})));
        assert!(!is_internal_message(&serde_json::json!({"ip": "127.0.0.1", "port": 1})));
        assert!(!is_internal_message(&Value::String("NODE_X".to_string())));
    }

    #[tokio::test]
    async fn test_listen_first_message_is_readiness() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (callback, restarts) = counting_callback();
        let listener = tokio::spawn(listen(rx, ready_tx, callback));

        tx.write_all(b"{\"ip\":\"127.0.0.1\",\"port\":8787}\n")
            .await
            .unwrap();
        let ready = ready_rx.await.unwrap().unwrap();
        assert_eq!(ready.url(), "http://127.0.0.1:8787");
        assert_eq!(restarts.load(Ordering::SeqCst), 0);

        drop(tx);
        listener.await.unwrap();
    }

    #[tokio::test]
    async fn test_listen_later_messages_are_restarts() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (callback, restarts) = counting_callback();
        let listener = tokio::spawn(listen(rx, ready_tx, callback));

        tx.write_all(b"\"{\\\"ip\\\":\\\"127.0.0.1\\\",\\\"port\\\":8787}\"\n")
            .await
            .unwrap();
        tx.write_all(b"{\"cmd\":\"NODE_HANDLE_ACK\"}\n\n").await.unwrap();
        tx.write_all(b"{}\nreloaded\n").await.unwrap();
        drop(tx);
        listener.await.unwrap();

        assert_eq!(ready_rx.await.unwrap().unwrap().port, 8787);
        assert_eq!(restarts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_listen_malformed_first_message() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (callback, restarts) = counting_callback();
        let listener = tokio::spawn(listen(rx, ready_tx, callback));

        tx.write_all(b"this is not json\n").await.unwrap();
        drop(tx);
        listener.await.unwrap();

        assert!(ready_rx.await.unwrap().is_err());
        assert_eq!(restarts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_listen_undecodable_messages_still_count_as_restarts() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (callback, restarts) = counting_callback();
        let listener = tokio::spawn(listen(rx, ready_tx, callback));

        tx.write_all(b"{\"ip\":\"127.0.0.1\",\"port\":8787}\n")
            .await
            .unwrap();
        tx.write_all(b"\"caf\xe9\"\n").await.unwrap();
        tx.write_all(b"{}\n{}\n").await.unwrap();
        drop(tx);
        listener.await.unwrap();

        assert_eq!(ready_rx.await.unwrap().unwrap().port, 8787);
        assert_eq!(restarts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_listen_non_utf8_first_message_is_malformed() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (callback, restarts) = counting_callback();
        let listener = tokio::spawn(listen(rx, ready_tx, callback));

        tx.write_all(b"\xff\xfe ready\n{}\n").await.unwrap();
        drop(tx);
        listener.await.unwrap();

        assert!(ready_rx.await.unwrap().is_err());
        assert_eq!(restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_listen_oversized_message_counts_once() {
        let (mut tx, rx) = tokio::io::duplex(4096);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (callback, restarts) = counting_callback();
        let listener = tokio::spawn(listen(rx, ready_tx, callback));

        tx.write_all(b"{\"ip\":\"127.0.0.1\",\"port\":8787}\n")
            .await
            .unwrap();
        tx.write_all(&vec![b'a'; MAX_MESSAGE_LEN + 10]).await.unwrap();
        tx.write_all(b"\n{}\n").await.unwrap();
        drop(tx);
        listener.await.unwrap();

        assert!(ready_rx.await.unwrap().is_ok());
        assert_eq!(restarts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_listen_oversized_first_message_is_malformed() {
        let (mut tx, rx) = tokio::io::duplex(4096);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (callback, _) = counting_callback();
        let listener = tokio::spawn(listen(rx, ready_tx, callback));

        tx.write_all(&vec![b' '; MAX_MESSAGE_LEN + 1]).await.unwrap();
        tx.write_all(b"\n").await.unwrap();
        drop(tx);
        listener.await.unwrap();

        let reason = ready_rx.await.unwrap().unwrap_err();
        assert!(reason.contains("exceeds"), "{}", reason);
    }

    #[tokio::test]
    async fn test_listen_closed_before_readiness() {
        let (tx, rx) = tokio::io::duplex(64);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (callback, _) = counting_callback();

        drop(tx);
        listen(rx, ready_tx, callback).await;

        assert!(ready_rx.await.is_err());
    }

    #[tokio::test]
    async fn test_listen_keeps_running_after_receiver_dropped() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (callback, restarts) = counting_callback();
        drop(ready_rx);
        let listener = tokio::spawn(listen(rx, ready_tx, callback));

        tx.write_all(b"{\"ip\":\"127.0.0.1\",\"port\":8787}\n{}\n")
            .await
            .unwrap();
        drop(tx);
        listener.await.unwrap();

        assert_eq!(restarts.load(Ordering::SeqCst), 1);
    }
}
