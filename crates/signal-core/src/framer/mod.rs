//! Stream framing for connection-oriented signaling transports.
//!
//! A [`StreamFramer`] is a per-connection state machine that turns an
//! arbitrarily-chunked byte stream into complete messages. Framing follows the
//! SIP-over-stream model: a block of header lines terminated by a blank line,
//! followed by exactly `Content-Length` body bytes.
//!
//! ```text
//!  bytes from socket ──▶ consume() ──▶ READING_HEADERS ──blank line──▶ READING_BODY
//!                                            ▲                              │
//!                                            └────────── message built ◀────┘
//! ```
//!
//! The framer owns no concurrency: it is driven synchronously by whatever task
//! reads the connection, and all of its counters are per-connection. Chunk
//! boundaries are arbitrary — a header line or the body may span any number of
//! reads — and feeding a message one byte at a time produces the same result
//! as feeding it whole.
//!
//! Keepalive probes (RFC 5626 §4.4.1) are recognized before framing: a chunk
//! that is exactly a double CRLF is a ping the caller must answer with a
//! single CRLF; a chunk that is exactly one CRLF is the pong and needs no
//! reply. Neither produces a message.
//!
//! [`StreamFramer::consume`] returns at most one output per call and buffers
//! any remainder; call `consume(&[])` in a loop to drain a chunk that carried
//! more than one message.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{trace, warn};

use crate::error::{Error, Result};

/// Single line terminator; also the keepalive pong.
pub const CRLF: &[u8] = b"\r\n";
/// Double line terminator; the keepalive ping.
pub const DOUBLE_CRLF: &[u8] = b"\r\n\r\n";

const CONTENT_LENGTH: &str = "content-length";
const CONTENT_LENGTH_COMPACT: &str = "l";

/// A completely framed message, immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedMessage {
    header_block: Bytes,
    content_length: usize,
    body: Bytes,
    frame_len: usize,
}

impl FramedMessage {
    /// Build a message from a finished header block and body.
    pub fn new(header_block: Bytes, body: Bytes) -> Self {
        let frame_len = header_block.len() + body.len();
        Self {
            header_block,
            content_length: body.len(),
            body,
            frame_len,
        }
    }

    /// Raw header block bytes. Always terminated by a blank line.
    pub fn header_block(&self) -> &Bytes {
        &self.header_block
    }

    /// Declared body length; equal to `body().len()`.
    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// Body bytes, exactly `content_length` of them.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Total framed size (header block + body).
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }
}

/// Boundary to the full message parser.
///
/// The framer hands every completed header block and body here. A real SIP
/// parser lives behind this trait; [`RawMessageFactory`] is the pass-through
/// used when only framing is needed. A `build` failure is logged by the framer
/// and the message dropped — the connection survives.
pub trait MessageFactory: Send + Sync {
    /// Build a message from a framed header block and body.
    fn build(&self, header_block: &[u8], body: Bytes) -> Result<FramedMessage>;
}

/// Pass-through factory that wraps the framed bytes without header parsing.
#[derive(Debug, Default)]
pub struct RawMessageFactory;

impl MessageFactory for RawMessageFactory {
    fn build(&self, header_block: &[u8], body: Bytes) -> Result<FramedMessage> {
        if header_block.is_empty() {
            return Err(Error::MalformedMessage("empty header block".into()));
        }
        Ok(FramedMessage::new(
            Bytes::copy_from_slice(header_block),
            body,
        ))
    }
}

/// Outcome of one [`StreamFramer::consume`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramerOutput {
    /// A complete message was framed.
    Message(FramedMessage),
    /// Keepalive ping (double CRLF): caller must echo one CRLF back.
    KeepAlivePing,
    /// Keepalive pong (single CRLF): no action required.
    KeepAlivePong,
    /// More bytes are needed.
    Incomplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramePhase {
    ReadingHeaders,
    ReadingBody,
}

/// Per-connection framing state machine.
///
/// Create one per accepted connection and drop it when the connection closes.
/// Internal state must not be shared across connections or accessed
/// concurrently for one connection.
pub struct StreamFramer {
    phase: FramePhase,
    /// Accumulated header lines of the in-flight message, CRLF-terminated.
    headers: BytesMut,
    /// Bytes received but not yet framed, including any partial line.
    residual: BytesMut,
    /// Declared body length from the body-length header.
    content_length: usize,
    /// Raw value of a body-length header that failed to parse, surfaced at
    /// the header/body transition.
    content_length_err: Option<String>,
    /// Body bytes read so far for the in-flight message.
    body: BytesMut,
    max_message_size: usize,
    factory: Arc<dyn MessageFactory>,
}

impl StreamFramer {
    /// Create a framer with the pass-through message factory.
    pub fn new(max_message_size: usize) -> Self {
        Self::with_factory(max_message_size, Arc::new(RawMessageFactory))
    }

    /// Create a framer handing completed frames to `factory`.
    pub fn with_factory(max_message_size: usize, factory: Arc<dyn MessageFactory>) -> Self {
        Self {
            phase: FramePhase::ReadingHeaders,
            headers: BytesMut::new(),
            residual: BytesMut::new(),
            content_length: 0,
            content_length_err: None,
            body: BytesMut::new(),
            max_message_size,
            factory,
        }
    }

    /// True if bytes from an earlier chunk are still buffered.
    ///
    /// A read loop should keep calling `consume(&[])` while this holds so a
    /// single large chunk cannot delay the messages queued behind the first.
    pub fn has_buffered(&self) -> bool {
        !self.residual.is_empty()
    }

    /// Feed one chunk of bytes, returning at most one framed output.
    ///
    /// Chunks may be split at any boundary, including mid-line and mid-body.
    /// An [`Error::MessageTooLarge`] return is fatal for the connection; every
    /// other per-message problem is logged and swallowed here.
    pub fn consume(&mut self, chunk: &[u8]) -> Result<FramerOutput> {
        // Keepalive probes are exact whole-chunk matches, only meaningful
        // between messages.
        if self.between_messages() {
            if chunk == CRLF {
                trace!("keepalive pong received");
                return Ok(FramerOutput::KeepAlivePong);
            }
            if chunk == DOUBLE_CRLF {
                trace!("keepalive ping received, caller should echo CRLF");
                return Ok(FramerOutput::KeepAlivePing);
            }
        }

        self.residual.extend_from_slice(chunk);
        self.advance()
    }

    fn between_messages(&self) -> bool {
        self.phase == FramePhase::ReadingHeaders
            && self.headers.is_empty()
            && self.residual.is_empty()
    }

    /// Run the state machine over buffered bytes until it produces an output
    /// or runs out of input.
    fn advance(&mut self) -> Result<FramerOutput> {
        loop {
            match self.phase {
                FramePhase::ReadingHeaders => {
                    let Some(line) = self.take_line() else {
                        // Partial line stays buffered until the next chunk.
                        if self.headers.len() + self.residual.len() > self.max_message_size {
                            return Err(Error::MessageTooLarge {
                                size: self.headers.len() + self.residual.len(),
                                limit: self.max_message_size,
                            });
                        }
                        return Ok(FramerOutput::Incomplete);
                    };

                    if line.is_empty() {
                        if self.headers.is_empty() {
                            // Inter-message noise, not a framing error.
                            trace!("ignoring blank line before any header");
                            continue;
                        }
                        if let Some(raw) = self.content_length_err.take() {
                            warn!(
                                value = %raw,
                                "dropping message with malformed body-length header"
                            );
                            self.reset();
                            continue;
                        }
                        let projected = self.headers.len() + CRLF.len() + self.content_length;
                        if projected > self.max_message_size {
                            return Err(Error::MessageTooLarge {
                                size: projected,
                                limit: self.max_message_size,
                            });
                        }
                        self.body = BytesMut::with_capacity(self.content_length);
                        self.phase = FramePhase::ReadingBody;
                        continue;
                    }

                    self.record_header_line(&line);
                    self.headers.extend_from_slice(&line);
                    self.headers.extend_from_slice(CRLF);
                    if self.headers.len() > self.max_message_size {
                        return Err(Error::MessageTooLarge {
                            size: self.headers.len(),
                            limit: self.max_message_size,
                        });
                    }
                }
                FramePhase::ReadingBody => {
                    let need = self.content_length - self.body.len();
                    if need > 0 {
                        if self.residual.is_empty() {
                            return Ok(FramerOutput::Incomplete);
                        }
                        let take = need.min(self.residual.len());
                        let bytes = self.residual.split_to(take);
                        self.body.extend_from_slice(&bytes);
                        if self.body.len() < self.content_length {
                            return Ok(FramerOutput::Incomplete);
                        }
                    }

                    // Body is length-exact; build the message and reset for
                    // the next one on this connection.
                    let mut header_block = std::mem::take(&mut self.headers);
                    // The parser boundary expects the header block terminated
                    // by one blank line.
                    header_block.extend_from_slice(CRLF);
                    let body = std::mem::take(&mut self.body).freeze();
                    self.reset();

                    match self.factory.build(&header_block, body) {
                        Ok(message) => {
                            trace!(
                                frame_len = message.frame_len(),
                                content_length = message.content_length(),
                                "framed complete message"
                            );
                            return Ok(FramerOutput::Message(message));
                        }
                        Err(e) => {
                            // One malformed message does not tear the
                            // connection down.
                            warn!(error = %e, "message factory rejected frame, dropping");
                            continue;
                        }
                    }
                }
            }
        }
    }

    /// Pull one complete line out of the residual buffer, stripping the
    /// terminator. Accepts CRLF and tolerates a bare LF.
    fn take_line(&mut self) -> Option<Bytes> {
        let pos = self.residual.iter().position(|&b| b == b'\n')?;
        let mut line = self.residual.split_to(pos + 1);
        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        Some(line.freeze())
    }

    /// Inspect a header line for the body-length header (full or compact
    /// form, case-insensitive). All other headers pass through untouched.
    fn record_header_line(&mut self, line: &[u8]) {
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            return;
        };
        let name = String::from_utf8_lossy(&line[..colon]);
        let name = name.trim().to_ascii_lowercase();
        if name != CONTENT_LENGTH && name != CONTENT_LENGTH_COMPACT {
            return;
        }
        let value = String::from_utf8_lossy(&line[colon + 1..]);
        let value = value.trim();
        match value.parse::<usize>() {
            Ok(len) => {
                self.content_length = len;
                self.content_length_err = None;
            }
            Err(_) => {
                self.content_length_err = Some(value.to_string());
            }
        }
    }

    /// Reset all per-message state back to READING_HEADERS. Buffered residual
    /// bytes belong to the next message and are kept.
    fn reset(&mut self) {
        self.phase = FramePhase::ReadingHeaders;
        self.headers.clear();
        self.body = BytesMut::new();
        self.content_length = 0;
        self.content_length_err = None;
    }
}

impl std::fmt::Debug for StreamFramer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamFramer")
            .field("phase", &self.phase)
            .field("headers_len", &self.headers.len())
            .field("residual_len", &self.residual.len())
            .field("content_length", &self.content_length)
            .field("body_len", &self.body.len())
            .field("max_message_size", &self.max_message_size)
            .finish()
    }
}
