//! Error types shared across the stack.
//!
//! Variants map directly onto the error kinds a caller needs to react to:
//! parse/checksum failures are recovered locally and never reach here except
//! as a log line, while routing, resolution, state and resource errors are
//! always surfaced to the caller that triggered them.

use crate::wire::CursorError;

/// Top-level error type returned by the public stack API.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Malformed header or short buffer while parsing a wire format.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// No route to the given destination.
    #[error("no route to host")]
    NoRoute,

    /// ARP resolution did not complete before the configured timeout.
    #[error("address resolution timed out")]
    ResolutionTimeout,

    /// Destination host could not be reached at the link layer.
    #[error("host unreachable")]
    HostUnreachable,

    /// Operation is not valid in the connection/socket's current state.
    #[error("operation not permitted in current state: {0}")]
    State(String),

    /// A requested port is already bound.
    #[error("port already in use")]
    PortInUse,

    /// No free port was found in the ephemeral range.
    #[error("no ephemeral ports available")]
    NoEphemeralPorts,

    /// The listening socket's accept queue is full.
    #[error("accept queue full")]
    AcceptQueueFull,

    /// The socket or connection has already been closed.
    #[error("socket closed")]
    SocketClosed,

    /// A blocking call exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The underlying frame transport failed.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors from parsing a single wire format (ARP / IPv4 / UDP / TCP).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("buffer exhausted")]
    EndOfBuffer,
    #[error("unsupported field value: {0}")]
    Unsupported(&'static str),
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("checksum mismatch")]
    Checksum,
}

impl From<CursorError> for ParseError {
    fn from(_: CursorError) -> Self {
        ParseError::EndOfBuffer
    }
}

pub type Result<T> = std::result::Result<T, NetworkError>;
