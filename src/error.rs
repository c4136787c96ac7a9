//! Error types for the multi-stream RTSP server.

use std::fmt;

use crate::encoder::DriverError;

/// Errors that can occur in the streaming core.
///
/// Variants map to the failure taxonomy across the stack:
///
/// - **Configuration**: [`CapacityExceeded`](Self::CapacityExceeded),
///   [`InvalidConfig`](Self::InvalidConfig) — rejected at stream
///   registration, never fatal to the server.
/// - **Driver**: [`Driver`](Self::Driver) — encoder/capture failures,
///   retried per cycle and isolated to one stream.
/// - **Protocol**: [`Parse`](Self::Parse) — malformed RTSP messages.
/// - **Resource**: [`Io`](Self::Io) — socket/allocation failures.
/// - **Session**: [`SessionNotFound`](Self::SessionNotFound),
///   [`StreamNotFound`](Self::StreamNotFound).
/// - **Lifecycle**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning),
///   [`NotStopped`](Self::NotStopped).
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// All stream slots in the [`StreamRegistry`](crate::StreamRegistry) are taken.
    #[error("stream capacity exceeded (max {0} streams)")]
    CapacityExceeded(usize),

    /// Stream configuration is missing or carries unusable video parameters.
    #[error("invalid stream config: {0}")]
    InvalidConfig(&'static str),

    /// The encoder driver rejected an operation.
    #[error("encoder driver error: {0}")]
    Driver(#[from] DriverError),

    /// No session with the given ID exists in the session table.
    #[error("session not found: {0}")]
    SessionNotFound(u64),

    /// No registered stream at the requested path.
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already listening.
    #[error("server already running")]
    AlreadyRunning,

    /// [`Server::destroy`](crate::Server::destroy) requires a prior `stop()`.
    #[error("server still running; call stop() first")]
    NotStopped,

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;
