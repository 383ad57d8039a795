//! Envelope codec.
//!
//! # Wire Format
//!
//! Each WebSocket message carries one JSON-encoded [`Envelope`]:
//!
//! ```text
//! { "type": "output", "data": "<terminal text>" }
//! { "type": "input",  "data": "<keystrokes>" }
//! { "type": "resize", "data": { "cols": 80, "rows": 24 } }
//! ```
//!
//! Decoding also accepts the flat resize form
//! `{ "type": "resize", "cols": 80, "rows": 24 }`.
//!
//! Terminal output arrives as raw bytes and may split a multi-byte UTF-8
//! sequence across reads. [`Utf8Stream`] carries such partial sequences over
//! to the next chunk so the text inside `output` envelopes stays intact.

use crate::error::{DecodeError, EncodeError};
use crate::messages::{Envelope, FlatResize};

/// Longest possible incomplete UTF-8 tail (a 4-byte sequence missing its last byte).
const MAX_PENDING_BYTES: usize = 3;

/// Serializes an envelope to its JSON wire bytes.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Serializes an envelope to a JSON string, for text frames.
pub fn encode_text(envelope: &Envelope) -> Result<String, EncodeError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Parses wire bytes into an envelope.
///
/// Unknown `type` values, missing fields and zero-sized resizes are all
/// reported as errors; callers decide whether to drop the message.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let envelope = match serde_json::from_slice::<Envelope>(bytes) {
        Ok(envelope) => envelope,
        Err(err) => match serde_json::from_slice::<FlatResize>(bytes) {
            Ok(flat) => flat.into(),
            Err(_) => return Err(err.into()),
        },
    };

    if let Envelope::Resize(size) = &envelope {
        if !size.is_valid() {
            return Err(DecodeError::InvalidSize {
                cols: size.cols,
                rows: size.rows,
            });
        }
    }

    Ok(envelope)
}

/// Incremental, lossy UTF-8 decoder for pty output.
///
/// Invalid bytes become U+FFFD. An incomplete sequence at the end of a chunk
/// is held back and completed by the next call to [`Utf8Stream::decode`].
#[derive(Debug, Default)]
pub struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    /// Creates a decoder with no pending bytes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes the next chunk, prefixed by any bytes held back last time.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(err) => {
                    let (valid, tail) = rest.split_at(err.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));

                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[len..];
                        }
                        None => {
                            debug_assert!(tail.len() <= MAX_PENDING_BYTES);
                            self.pending = tail.to_vec();
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Flushes held-back bytes, replacing them with U+FFFD.
    pub fn finish(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&pending).into_owned()
    }

    /// Returns true if a partial sequence is being held back.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
