//! Line-delimited JSON framing.
//!
//! Each message is one compact JSON object followed by `\n`. `serde_json`
//! escapes control characters, so a serialized object can never contain a
//! raw newline; the framing is unambiguous.

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum line size (4 MiB) to prevent unbounded memory allocation.
const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Reads newline-delimited JSON messages from an async reader.
pub struct LineReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Read the next message.
    ///
    /// Blank lines are skipped. Returns `Ok(None)` on EOF (clean shutdown),
    /// `Err` on an oversized line or malformed JSON.
    pub async fn read_message(&mut self) -> Result<Option<serde_json::Value>> {
        let mut line = Vec::new();

        loop {
            line.clear();
            let limit = (MAX_LINE_BYTES + 1) as u64;
            let bytes_read = (&mut self.reader)
                .take(limit)
                .read_until(b'\n', &mut line)
                .await
                .context("reading message line")?;

            if bytes_read == 0 {
                return Ok(None);
            }

            if line.len() > MAX_LINE_BYTES {
                bail!("message line exceeds maximum {MAX_LINE_BYTES} bytes");
            }

            // A missing trailing newline means EOF mid-line; still attempt to
            // parse what arrived, a crash-truncated final line fails below.
            while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
                line.pop();
            }

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let value = serde_json::from_slice(&line).context("parsing JSON-RPC line")?;
            return Ok(Some(value));
        }
    }
}

/// Writes newline-delimited JSON messages to an async writer.
pub struct LineWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_message(&mut self, msg: &serde_json::Value) -> Result<()> {
        let mut body = serde_json::to_vec(msg).context("serializing JSON-RPC line")?;
        body.push(b'\n');

        self.writer
            .write_all(&body)
            .await
            .context("writing message line")?;
        self.writer.flush().await.context("flushing message line")?;

        Ok(())
    }
}
