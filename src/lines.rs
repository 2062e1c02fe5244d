//! Newline-delimited reading with a cap on the bytes kept per line

use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Read one `\n`-terminated line into `buf`, keeping at most `limit` bytes.
///
/// Bytes past the limit are consumed and discarded up to the next newline, so an
/// overlong line still counts as a single line. Returns `None` at EOF, otherwise
/// whether the line was cut short. The newline, if present and within the limit,
/// stays in `buf`.
pub(crate) async fn read_bounded_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> io::Result<Option<bool>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut read_any = false;
    let mut truncated = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            break;
        }
        read_any = true;

        let (used, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len(), false),
        };
        let room = limit.saturating_sub(buf.len());
        if used > room {
            truncated = true;
        }
        buf.extend_from_slice(&available[..used.min(room)]);
        reader.consume(used);

        if done {
            break;
        }
    }

    Ok(read_any.then_some(truncated))
}
