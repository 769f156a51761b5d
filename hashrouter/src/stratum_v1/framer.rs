//! Peek-based framing of Stratum messages.
//!
//! [`FrameReader`] keeps every byte it has read from the socket in a local
//! buffer until a caller explicitly consumes it. The `peek_*` methods grow a
//! window over that buffer one byte at a time until the window holds exactly
//! one complete message, then hand back a copy of it while leaving the read
//! cursor where it was. [`FrameReader::next_frame`] is the consuming
//! counterpart used by the relay.
//!
//! Two framing modes are supported:
//!
//! - [`FramingMode::Line`]: a message ends at the first `\n`, which is
//!   included in the frame.
//! - [`FramingMode::Json`]: a message is a balanced run of `{`/`[` and
//!   `}`/`]`. Brackets are counted without regard to JSON string literals.

use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default upper bound on the size of a single frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024;

const READ_CHUNK: usize = 4 * 1024;

/// How message boundaries are detected in a byte stream.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum FramingMode {
    /// Newline-terminated messages.
    #[default]
    Line,
    /// Balanced-bracket JSON objects or arrays.
    Json,
}

/// Errors raised while looking for the next frame.
#[derive(Error, Debug)]
pub enum FrameError {
    /// The peer closed the stream cleanly between frames.
    #[error("connection closed")]
    Eof,

    /// The peer closed the stream in the middle of a frame.
    #[error("stream ended inside a frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },

    /// No frame boundary within the configured limit.
    #[error("frame exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Whether the stream simply ended at a frame boundary.
    pub fn is_eof(&self) -> bool {
        matches!(self, FrameError::Eof)
    }
}

/// Buffered reader that frames Stratum messages without consuming them.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    mode: FramingMode,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, mode: FramingMode, max_frame_size: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
            mode,
            max_frame_size,
        }
    }

    /// Bytes read from the source but not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Return the first `n` unconsumed bytes, reading from the source until
    /// that many are available. Nothing is consumed.
    pub async fn peek(&mut self, n: usize) -> Result<&[u8], FrameError> {
        if n > self.max_frame_size {
            return Err(FrameError::TooLarge {
                limit: self.max_frame_size,
            });
        }

        while self.buf.len() < n {
            self.buf.reserve(READ_CHUNK);
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                return Err(if self.buf.is_empty() {
                    FrameError::Eof
                } else {
                    FrameError::Truncated {
                        buffered: self.buf.len(),
                    }
                });
            }
        }

        Ok(&self.buf[..n])
    }

    /// Remove the first `n` buffered bytes and return them.
    pub fn consume(&mut self, n: usize) -> Bytes {
        self.buf.split_to(n).freeze()
    }

    /// Peek the next newline-terminated message, terminator included.
    pub async fn peek_line(&mut self) -> Result<Bytes, FrameError> {
        let len = self.scan_line().await?;
        Ok(Bytes::copy_from_slice(&self.buf[..len]))
    }

    /// Peek the next balanced-bracket JSON message.
    pub async fn peek_json(&mut self) -> Result<Bytes, FrameError> {
        let len = self.scan_json().await?;
        Ok(Bytes::copy_from_slice(&self.buf[..len]))
    }

    /// Peek the next message using the configured framing mode.
    pub async fn peek_frame(&mut self) -> Result<Bytes, FrameError> {
        match self.mode {
            FramingMode::Line => self.peek_line().await,
            FramingMode::Json => self.peek_json().await,
        }
    }

    /// Skip inter-message whitespace, then consume and return one frame.
    ///
    /// Cancel safe: if the future is dropped, everything read so far stays
    /// buffered.
    pub async fn next_frame(&mut self) -> Result<Bytes, FrameError> {
        self.skip_whitespace().await?;
        let len = match self.mode {
            FramingMode::Line => self.scan_line().await?,
            FramingMode::Json => self.scan_json().await?,
        };
        Ok(self.consume(len))
    }

    async fn skip_whitespace(&mut self) -> Result<(), FrameError> {
        while self.peek(1).await?[0].is_ascii_whitespace() {
            self.buf.advance(1);
        }
        Ok(())
    }

    async fn scan_line(&mut self) -> Result<usize, FrameError> {
        let mut len = 1;
        loop {
            if self.peek(len).await?[len - 1] == b'\n' {
                return Ok(len);
            }
            len += 1;
        }
    }

    async fn scan_json(&mut self) -> Result<usize, FrameError> {
        let mut depth: i64 = 0;
        let mut opened = false;
        let mut len = 1;
        loop {
            match self.peek(len).await?[len - 1] {
                b'{' | b'[' => depth += 1,
                b'}' | b']' => depth -= 1,
                _ => {}
            }
            opened |= depth > 0;
            if opened && depth == 0 {
                return Ok(len);
            }
            len += 1;
        }
    }
}
