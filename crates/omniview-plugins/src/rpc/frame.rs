//! Frames exchanged over a plugin connection and their `Content-Length`
//! framing.
//!
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <JSON frame>
//! ```

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::RpcError;
use super::status::RpcStatus;
use crate::handshake::HandshakeFrame;

/// Largest frame body accepted by [`FrameReader`].
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Per-call metadata entries.
pub type Metadata = BTreeMap<String, String>;

/// A unit of traffic on a plugin connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// First frame written by a plugin.
    Handshake(HandshakeFrame),
    /// Unary call.
    Request {
        /// Call ID, unique per connection.
        id: u64,
        /// Target service.
        service: String,
        /// Target method.
        method: String,
        /// Call metadata.
        #[serde(default)]
        metadata: Metadata,
        /// Call budget the server derives its lifetime from.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
        /// Request body.
        #[serde(default)]
        payload: Value,
    },
    /// Unary call outcome.
    Response {
        /// Call ID being answered.
        id: u64,
        /// Response body on success.
        #[serde(default)]
        payload: Value,
        /// Failure status.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<RpcStatus>,
    },
    /// Client abandoned a unary call.
    Cancel {
        /// Call ID to cancel.
        id: u64,
    },
    /// Opens a bidirectional stream.
    StreamOpen {
        /// Stream ID, unique per connection.
        id: u64,
        /// Target service.
        service: String,
        /// Target method.
        method: String,
        /// Call metadata.
        #[serde(default)]
        metadata: Metadata,
    },
    /// One message on an open stream, in either direction.
    StreamData {
        /// Stream ID.
        id: u64,
        /// Message body.
        payload: Value,
    },
    /// Half-close from the client, or full close with outcome from the
    /// server.
    StreamClose {
        /// Stream ID.
        id: u64,
        /// Failure status when the server handler failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<RpcStatus>,
    },
}

impl Frame {
    /// Short name of the frame kind, for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "handshake",
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
            Self::Cancel { .. } => "cancel",
            Self::StreamOpen { .. } => "stream_open",
            Self::StreamData { .. } => "stream_data",
            Self::StreamClose { .. } => "stream_close",
        }
    }
}

/// Reads framed messages from a byte stream.
pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: Read> FrameReader<R> {
    /// Wraps a byte stream.
    #[must_use]
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Reads the next frame, blocking until it is complete.
    ///
    /// Returns `Ok(None)` on a clean end of stream between frames.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError`] for I/O failures, malformed headers, oversized
    /// frames, truncated bodies and undecodable JSON.
    pub fn read_frame(&mut self) -> Result<Option<Frame>, RpcError> {
        let Some(content_length) = self.read_headers()? else {
            return Ok(None);
        };
        if content_length > MAX_FRAME_LEN {
            return Err(RpcError::FrameTooLarge {
                len: content_length,
            });
        }
        let mut content = vec![0_u8; content_length];
        self.reader.read_exact(&mut content)?;
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(RpcError::Decode)
    }

    fn read_headers(&mut self) -> Result<Option<usize>, RpcError> {
        let mut content_length: Option<usize> = None;
        let mut saw_header = false;

        loop {
            let mut line = String::new();
            let bytes_read = self.reader.read_line(&mut line)?;
            if bytes_read == 0 {
                if saw_header {
                    return Err(RpcError::Io(std::sync::Arc::new(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed while reading headers",
                    ))));
                }
                return Ok(None);
            }
            saw_header = true;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                break;
            }

            if let Some(value) = trimmed.strip_prefix("Content-Length:") {
                let parsed = value
                    .trim()
                    .parse()
                    .map_err(|_| RpcError::InvalidHeader {
                        line: trimmed.to_owned(),
                    })?;
                content_length = Some(parsed);
            }
        }

        content_length
            .map(Some)
            .ok_or(RpcError::MissingContentLength)
    }
}

/// Writes framed messages to a byte stream.
pub struct FrameWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> FrameWriter<W> {
    /// Wraps a byte stream.
    #[must_use]
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    /// Encodes and flushes one frame.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Encode`] if the frame cannot be serialised and
    /// [`RpcError::Io`] if the write fails.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), RpcError> {
        let body = serde_json::to_vec(frame).map_err(RpcError::Encode)?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        self.writer.write_all(header.as_bytes())?;
        self.writer.write_all(&body)?;
        self.writer.flush()?;
        Ok(())
    }
}
