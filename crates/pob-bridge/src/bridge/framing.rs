//! Incremental line framing over an async byte stream.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Splits an async byte stream into lines.
///
/// Each call to [`next_line`](Self::next_line) returns one line with its
/// trailing `\n` / `\r\n` (and any stray `\r`) removed. Bytes that are not
/// valid UTF-8 are replaced rather than failing the whole stream, since a
/// single bad byte from the child must not stop the pump.
pub struct FramedLineReader<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> FramedLineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(1024),
        }
    }

    /// Read the next line.
    ///
    /// Returns `Ok(None)` at end-of-stream. A final line without a
    /// terminator is still returned before `None`.
    ///
    /// Cancel-safe: bytes of a partially read line stay buffered and are
    /// returned by the next call, so this can sit in a `select!` or under a
    /// timeout.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let n = self.reader.read_until(b'\n', &mut self.buf).await?;
        if n == 0 && self.buf.is_empty() {
            return Ok(None);
        }
        while matches!(self.buf.last(), Some(b'\n' | b'\r')) {
            self.buf.pop();
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Ok(Some(line))
    }
}
