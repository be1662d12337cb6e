//! Crate-wide error types
//!
//! Mirrors the error kinds from the framework's design: most failures are
//! handled locally by the reactor and never surface here. `Error` is
//! reserved for the `Fatal` class — failures during startup that must
//! propagate to the caller with no partial state retained.

use std::fmt::{self, Display};
use std::io;

/// Broad classification of a failure observed at the core boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// `EAGAIN`/`WANT_READ`/`WANT_WRITE`; recovered locally by re-arming readiness.
    Transient,
    /// Peer performed an orderly or abrupt close.
    PeerClosed,
    /// Malformed HTTP or WebSocket input, oversize request, invalid chunk hex.
    ProtocolError,
    /// The security gate returned `Close` or `Drop`.
    SecurityDeny,
    /// A bounded resource (queue, connection table) is full.
    ResourceExhausted,
    /// Cannot be recovered from; no partial state is retained.
    Fatal,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transient => "transient",
            Self::PeerClosed => "peer closed",
            Self::ProtocolError => "protocol error",
            Self::SecurityDeny => "security deny",
            Self::ResourceExhausted => "resource exhausted",
            Self::Fatal => "fatal",
        })
    }
}

/// A classified error carrying an operator-facing message.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    source: Option<io::Error>,
}

impl Error {
    /// Builds an error of the given kind with a static or owned message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Wraps an [`io::Error`] as a `Fatal` error.
    pub fn fatal_io(message: impl Into<String>, source: io::Error) -> Self {
        Self {
            kind: ErrorKind::Fatal,
            message: message.into(),
            source: Some(source),
        }
    }

    /// The classification of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::fatal_io("I/O failure", value)
    }
}

/// Result alias using the crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
