//! IMAP response framing.
//!
//! IMAP responses are CRLF-terminated lines, but a line may announce one or
//! more literals (`{n}` or `{n+}` just before the terminator) whose `n`
//! bytes of opaque payload follow the terminator and continue the same
//! logical response. The decoder below accepts arbitrary byte chunks and
//! emits complete response units: one server line with every announced
//! literal inlined, announcement and its terminator included, the final
//! line terminator consumed.

use bytes::{Buf, Bytes, BytesMut};

use crate::{Error, Result};

/// Maximum line length to prevent memory exhaustion.
const MAX_LINE_LENGTH: usize = 1024 * 1024; // 1 MB

/// Maximum literal size to prevent memory exhaustion.
const MAX_LITERAL_SIZE: usize = 100 * 1024 * 1024; // 100 MB

/// Pull-style framing decoder.
///
/// Feed bytes with [`FrameDecoder::push`], then drain complete units with
/// [`FrameDecoder::next_unit`] until it returns `Ok(None)`. Emissions are
/// invariant under chunk boundaries: however the input is split, the same
/// units come out.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Received bytes not yet consumed.
    buffer: BytesMut,
    /// The partially accumulated response unit.
    unit: BytesMut,
    /// Bytes still owed to an announced literal.
    literal_remaining: usize,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends received bytes.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Returns the next complete response unit, or `None` when more input
    /// is needed.
    ///
    /// # Errors
    ///
    /// Fails when a line or literal exceeds its size bound; the stream is
    /// not interpretable past that point.
    pub fn next_unit(&mut self) -> Result<Option<Bytes>> {
        loop {
            // Literal payload is opaque: never scanned for terminators or
            // further announcements.
            if self.literal_remaining > 0 {
                if self.buffer.len() < self.literal_remaining {
                    return Ok(None);
                }
                let payload = self.buffer.split_to(self.literal_remaining);
                self.unit.extend_from_slice(&payload);
                self.literal_remaining = 0;
                continue;
            }

            let Some(lf) = self.buffer.iter().position(|&b| b == b'\n') else {
                if self.unit.len() + self.buffer.len() > MAX_LINE_LENGTH {
                    return Err(Error::Protocol("line too long".to_string()));
                }
                return Ok(None);
            };

            // CR is optional.
            let term_start = if lf > 0 && self.buffer[lf - 1] == b'\r' {
                lf - 1
            } else {
                lf
            };

            if let Some(length) = literal_announcement(&self.buffer[..term_start]) {
                if length > MAX_LITERAL_SIZE {
                    return Err(Error::Protocol(format!(
                        "literal too large: {length} bytes (max {MAX_LITERAL_SIZE})"
                    )));
                }
                // Keep the announcement and its terminator inside the unit;
                // the payload follows.
                let announced = self.buffer.split_to(lf + 1);
                self.unit.extend_from_slice(&announced);
                self.literal_remaining = length;
                continue;
            }

            // Plain line terminator: emit, without the terminator bytes.
            self.unit.extend_from_slice(&self.buffer[..term_start]);
            self.buffer.advance(lf + 1);
            return Ok(Some(self.unit.split().freeze()));
        }
    }

    /// Returns `true` when no partial unit or unconsumed bytes are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.unit.is_empty() && self.literal_remaining == 0
    }
}

/// Parses a literal announcement (`{n}` or `{n+}`) at the end of a line
/// fragment.
fn literal_announcement(line: &[u8]) -> Option<usize> {
    let body = line.strip_suffix(b"}")?;
    let body = body.strip_suffix(b"+").unwrap_or(body);

    let open = body.iter().rposition(|&b| b == b'{')?;
    let digits = &body[open + 1..];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}
