//! Error types and error handling strategy.
//!
//! The error surface is deliberately small and exhaustive:
//!
//! - **Kernel surfaces** on intercepted I/O: transient (`WouldBlock`,
//!   retried), interrupted (`Interrupted`, retried), closed, and timeouts
//!   synthesized by the timer wheel. These travel as `std::io::Error` with
//!   the matching [`std::io::ErrorKind`].
//! - **Session-level**: [`SessionError`]: timeout, I/O failure, or not
//!   connected. A successful request carries its response instead.
//! - **Selection-level**: [`SelectError`]: no service configured, or no
//!   live connection among the configured peers.
//! - **Everything else** (protocol violations, configuration mistakes,
//!   invalid state transitions) is a crate [`Error`] with a typed
//!   [`ErrorKind`].
//!
//! Transient kernel errors are retried locally by the I/O ops. Session I/O
//! errors tear the session down (and trigger reconnect when enabled);
//! request-level failures never do. Scheduler invariant violations are bugs
//! and panic.

use core::fmt;

/// The kind of a crate-level error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Underlying I/O failure.
    Io,
    /// A deadline elapsed before the operation completed.
    TimedOut,
    /// The operation was cancelled (event cancellation, shutdown).
    Cancelled,
    /// A waiter is already armed for this `(fd, direction)`.
    WaiterConflict,
    /// The peer is not connected.
    NotConnected,
    /// A channel was closed before the operation completed.
    ChannelClosed,
    /// Malformed or oversized protocol data.
    Protocol,
    /// A frame exceeded the configured size cap.
    FrameTooLarge,
    /// No service instances are configured.
    NoService,
    /// All configured instances are disconnected.
    NoConnection,
    /// A configuration value was missing or malformed.
    Config,
    /// The runtime is shutting down.
    ShuttingDown,
    /// An operation was attempted in a state that does not permit it.
    InvalidState,
    /// Internal invariant violation.
    Internal,
}

impl ErrorKind {
    /// Short static description of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Io => "i/o error",
            Self::TimedOut => "timed out",
            Self::Cancelled => "cancelled",
            Self::WaiterConflict => "waiter already armed",
            Self::NotConnected => "not connected",
            Self::ChannelClosed => "channel closed",
            Self::Protocol => "protocol error",
            Self::FrameTooLarge => "frame too large",
            Self::NoService => "no service",
            Self::NoConnection => "no connection",
            Self::Config => "configuration error",
            Self::ShuttingDown => "shutting down",
            Self::InvalidState => "invalid state",
            Self::Internal => "internal error",
        }
    }

    /// Whether retrying the same operation may succeed without outside
    /// intervention.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::TimedOut | Self::NoConnection | Self::NotConnected
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Crate-level error: a kind plus optional context and source.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    /// Creates an error of the given kind with no extra context.
    #[must_use]
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    /// Creates an error with a context message.
    #[must_use]
    pub fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
            source: None,
        }
    }

    /// Attaches a source error.
    #[must_use]
    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Whether retrying may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {}", self.kind, msg),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|s| s as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::TimedOut => ErrorKind::TimedOut,
            std::io::ErrorKind::NotConnected => ErrorKind::NotConnected,
            _ => ErrorKind::Io,
        };
        Self::new(kind).with_source(err)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

/// Result alias for crate-level operations.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Outcome of a session request that did not produce a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionError {
    /// The per-request deadline elapsed before a response arrived.
    Timeout,
    /// The stream failed; the session is being torn down.
    Io,
    /// The session is not connected.
    NotConnect,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("request timed out"),
            Self::Io => f.write_str("session i/o error"),
            Self::NotConnect => f.write_str("session not connected"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<SessionError> for Error {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Timeout => Self::new(ErrorKind::TimedOut),
            SessionError::Io => Self::new(ErrorKind::Io),
            SessionError::NotConnect => Self::new(ErrorKind::NotConnected),
        }
    }
}

/// Outcome of a load-balance selection that produced no peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectError {
    /// No items are configured for the service.
    NoService,
    /// Items exist, but none has a live connection.
    NoConnection,
}

impl fmt::Display for SelectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoService => f.write_str("no service configured"),
            Self::NoConnection => f.write_str("no live connection"),
        }
    }
}

impl std::error::Error for SelectError {}

impl From<SelectError> for Error {
    fn from(err: SelectError) -> Self {
        match err {
            SelectError::NoService => Self::new(ErrorKind::NoService),
            SelectError::NoConnection => Self::new(ErrorKind::NoConnection),
        }
    }
}

pub(crate) fn io_timed_out(what: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        Error::with_message(ErrorKind::TimedOut, what),
    )
}

pub(crate) fn io_cancelled(what: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::ConnectionAborted,
        Error::with_message(ErrorKind::Cancelled, what),
    )
}

pub(crate) fn io_conflict(what: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        Error::with_message(ErrorKind::WaiterConflict, what),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_display_matches_as_str() {
        assert_eq!(ErrorKind::TimedOut.to_string(), "timed out");
        assert_eq!(
            ErrorKind::WaiterConflict.to_string(),
            "waiter already armed"
        );
    }

    #[test]
    fn error_carries_message_and_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = Error::with_message(ErrorKind::Io, "while reading frame").with_source(io);
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("while reading frame"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn io_error_kind_mapping() {
        let timed: Error = std::io::Error::from(std::io::ErrorKind::TimedOut).into();
        assert_eq!(timed.kind(), ErrorKind::TimedOut);
        let other: Error = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert_eq!(other.kind(), ErrorKind::Io);
    }

    #[test]
    fn transient_classification() {
        assert!(ErrorKind::TimedOut.is_transient());
        assert!(!ErrorKind::Protocol.is_transient());
        assert!(!ErrorKind::WaiterConflict.is_transient());
    }

    #[test]
    fn session_and_select_conversions() {
        assert_eq!(
            Error::from(SessionError::Timeout).kind(),
            ErrorKind::TimedOut
        );
        assert_eq!(
            Error::from(SessionError::NotConnect).kind(),
            ErrorKind::NotConnected
        );
        assert_eq!(
            Error::from(SelectError::NoService).kind(),
            ErrorKind::NoService
        );
        assert_eq!(
            Error::from(SelectError::NoConnection).kind(),
            ErrorKind::NoConnection
        );
    }
}
