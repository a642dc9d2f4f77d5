use std::fmt;
use std::io;

/// Crate-wide error type.
///
/// Kept as a flat hand-written enum rather than pulling in `thiserror`,
/// matching the rest of this codebase's error handling.
#[derive(Debug)]
pub enum Error {
    /// The underlying duplex stream returned an I/O error.
    Io(io::Error),

    /// A frame was malformed in a way that cannot be recovered from.
    Protocol(String),

    /// Fewer bytes were available than the declared frame length required.
    Truncated,

    /// The TLS handshake or adapter failed.
    Tls(String),

    /// Authentication failed for reasons other than a plain wrong password
    /// (malformed SASL messages, missing client certificate, etc).
    Auth(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "i/o error: {}", e),
            Error::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            Error::Truncated => write!(f, "truncated message"),
            Error::Tls(msg) => write!(f, "tls error: {}", msg),
            Error::Auth(msg) => write!(f, "authentication error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// What a hook may raise instead of returning normally. A structured
/// `Backend` error is framed and sent to the client before closing; any
/// other error is logged and the stream is aborted without attempting to
/// frame it (see spec §7 "Hook-raised other error").
#[derive(Debug)]
pub enum HookError {
    Backend(crate::error_response::BackendError),
    Other(String),
}

pub type HookResult<T> = std::result::Result<T, HookError>;
