//! Newline-delimited JSON framing.
//!
//! Every record on the wire is one serialized [`Envelope`] followed by a
//! single `\n`. The decoder keeps partial records in the read buffer until
//! the rest of the line arrives, so an envelope split across several TCP
//! segments decodes exactly once.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::error::NetworkError;
use crate::message::Envelope;

/// Longest record accepted from a peer, newline excluded.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Codec turning a byte stream into [`Envelope`]s and back.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    /// Index into the buffer up to which we already searched for `\n`.
    next_index: usize,
    max_length: usize,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_FRAME_LEN)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            next_index: 0,
            max_length,
        }
    }

    fn parse_line(line: &[u8]) -> Result<Envelope, NetworkError> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        serde_json::from_slice(line)
            .map_err(|e| NetworkError::ProtocolViolation(format!("Undecodable record: {e}")))
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = src[self.next_index..].iter().position(|b| *b == b'\n');
            let Some(offset) = newline else {
                if src.len() > self.max_length {
                    return Err(NetworkError::ProtocolViolation(format!(
                        "Record exceeds {} bytes",
                        self.max_length
                    )));
                }
                self.next_index = src.len();
                return Ok(None);
            };

            let line_end = self.next_index + offset;
            self.next_index = 0;
            if line_end > self.max_length {
                return Err(NetworkError::ProtocolViolation(format!(
                    "Record exceeds {} bytes",
                    self.max_length
                )));
            }

            let line = src.split_to(line_end + 1);
            let body = &line[..line_end];
            if body.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Self::parse_line(body).map(Some);
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(envelope) => Ok(Some(envelope)),
            None => {
                if !src.is_empty() {
                    debug!(bytes = src.len(), "Discarding unterminated trailing record");
                    src.clear();
                }
                self.next_index = 0;
                Ok(None)
            }
        }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
