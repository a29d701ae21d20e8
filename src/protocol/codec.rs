// =============================================================================
// Frame Codec — newline-delimited JSON over a byte stream
// =============================================================================
//
// The reader yields one UTF-8 text frame per `\n`, tolerating partial reads
// and arbitrary chunking. A line exceeding 1 MiB is discarded together with
// the current partial buffer, and the reader resynchronises on the next
// `\n` — the stream survives.
//
// The writer appends exactly one `\n` per frame and flushes. Per-frame
// atomicity on a shared session is provided one level up: a single writer
// task owns the write half and drains an mpsc queue, so frames from
// concurrent producers never interleave.
// =============================================================================

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::MAX_FRAME_BYTES;

const READ_CHUNK: usize = 8 * 1024;

/// One reader step.
#[derive(Debug)]
pub enum ReadFrame {
    /// A complete text frame (without the trailing newline).
    Frame(String),
    /// An oversize line was discarded; the reader is resynchronising.
    Oversize { discarded: usize },
    /// The stream closed. Any trailing partial line is dropped.
    Eof,
}

/// Incremental frame reader over any async byte stream.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    /// Set after an oversize line until the next `\n` is seen.
    discarding: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_CHUNK),
            discarding: false,
        }
    }

    /// Read until a complete frame, an oversize discard, or EOF.
    pub async fn next_frame(&mut self) -> std::io::Result<ReadFrame> {
        loop {
            // Complete line already buffered?
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop(); // the \n
                if line.last() == Some(&b'\r') {
                    line.pop();
                }

                if self.discarding {
                    // Tail of an oversize line; the discard was already
                    // reported when it was detected.
                    self.discarding = false;
                    continue;
                }
                if line.is_empty() {
                    continue;
                }

                // Invalid UTF-8 surfaces as a malformed frame at the
                // session's classifier rather than killing the stream.
                return Ok(ReadFrame::Frame(String::from_utf8_lossy(&line).into_owned()));
            }

            // No newline buffered. An over-limit partial line enters
            // discard mode and is reported once.
            if self.buf.len() > MAX_FRAME_BYTES {
                let discarded = self.buf.len();
                self.buf.clear();
                if !self.discarding {
                    self.discarding = true;
                    return Ok(ReadFrame::Oversize { discarded });
                }
                continue;
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                return Ok(ReadFrame::Eof);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Frame writer: one serialized JSON text in, one `\n`-terminated write out.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write a single frame. `json` must not contain a newline.
    pub async fn write_frame(&mut self, json: &str) -> std::io::Result<()> {
        self.inner.write_all(json.as_bytes()).await?;
        self.inner.write_all(b"\n").await?;
        self.inner.flush().await
    }

    /// Flush and shut down the underlying stream.
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.inner.shutdown().await
    }
}
