//! Error types for the IMAP transport core.

use std::time::Duration;

use thiserror::Error;

use crate::codec::ResponseCode;

/// Errors that can occur while driving an IMAP connection.
///
/// Transport, framing, timeout and compression errors are fatal for the
/// connection: the connection is torn down and the error is surfaced through
/// the event stream. [`Error::No`], [`Error::Bad`] and precheck failures are
/// local to a single command and only reach that command's completion.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS handshake or encryption error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Invalid DNS name for TLS.
    #[error("Invalid DNS name: {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),

    /// Response could not be parsed.
    #[error("Protocol error at position {position}: {message}")]
    Parse {
        /// Byte position where the error occurred.
        position: usize,
        /// Description of what went wrong.
        message: String,
    },

    /// Protocol violation or unexpected data.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server completed a command with NO.
    #[error("Server returned NO: {message}")]
    No {
        /// Human-readable text from the response.
        message: String,
        /// Machine-readable `[CODE ...]` from the response, if any.
        code: Option<ResponseCode>,
    },

    /// Server completed a command with BAD.
    #[error("Server returned BAD: {message}")]
    Bad {
        /// Human-readable text from the response.
        message: String,
        /// Machine-readable `[CODE ...]` from the response, if any.
        code: Option<ResponseCode>,
    },

    /// No server response arrived within the socket timeout.
    #[error("Socket timed out after {0:?}")]
    Timeout(Duration),

    /// DEFLATE stream error from the compression splice.
    #[error("Compression error: {0}")]
    Compress(String),

    /// Invalid state for the requested operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The connection was closed before the operation completed.
    #[error("Connection closed")]
    Closed,
}

impl Error {
    /// Returns the response code attached to a `NO`/`BAD` completion, if any.
    #[must_use]
    pub const fn response_code(&self) -> Option<&ResponseCode> {
        match self {
            Self::No { code, .. } | Self::Bad { code, .. } => code.as_ref(),
            _ => None,
        }
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
