//! Error types for corio operations.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Async completion paths report errors by value, never by panic
//! - The runtime only surfaces what the operating system told it,
//!   plus the two synthesized conditions `Canceled` and `Eof`

use core::fmt;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Operation was cancelled (stop token, `cancel()`, or `close()`).
    Canceled,
    /// A read on a non-empty buffer returned zero bytes.
    Eof,
    /// Transient would-block condition surfaced to the caller.
    WouldBlock,
    /// The peer refused the connection.
    ConnectionRefused,
    /// The peer reset the connection.
    ConnectionReset,
    /// Write on a connection closed by the peer.
    BrokenPipe,
    /// A transport-level timeout expired.
    TimedOut,
    /// Host or network unreachable.
    Unreachable,
    /// The feature is disabled or unavailable on this platform.
    NotSupported,
    /// Out-of-range signal number, malformed endpoint, conflicting flags.
    InvalidArgument,
    /// Service registry conflict: the type or its key is already present.
    AlreadyExists,
    /// Any other operating system error, identified by errno.
    Os,
}

/// The main error type for corio operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    errno: Option<i32>,
    context: Option<String>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            errno: None,
            context: None,
        }
    }

    /// Creates an error from a raw OS errno value.
    ///
    /// The common transport errors are mapped onto their named kinds;
    /// everything else is carried as [`ErrorKind::Os`] with the errno
    /// preserved.
    #[must_use]
    pub fn from_errno(errno: i32) -> Self {
        let kind = match errno {
            libc::ECONNREFUSED => ErrorKind::ConnectionRefused,
            libc::ECONNRESET => ErrorKind::ConnectionReset,
            libc::EPIPE => ErrorKind::BrokenPipe,
            libc::ETIMEDOUT => ErrorKind::TimedOut,
            libc::EHOSTUNREACH | libc::ENETUNREACH => ErrorKind::Unreachable,
            libc::EAGAIN => ErrorKind::WouldBlock,
            libc::ECANCELED => ErrorKind::Canceled,
            libc::EINVAL => ErrorKind::InvalidArgument,
            libc::EOPNOTSUPP => ErrorKind::NotSupported,
            _ => ErrorKind::Os,
        };
        Self {
            kind,
            errno: Some(errno),
            context: None,
        }
    }

    /// Creates an error from the most recent OS error on this thread.
    #[must_use]
    pub fn last_os_error() -> Self {
        Self::from_errno(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the captured OS errno, if this error came from a syscall.
    #[must_use]
    pub const fn errno(&self) -> Option<i32> {
        self.errno
    }

    /// Returns true if this error represents cancellation.
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self.kind, ErrorKind::Canceled)
    }

    /// Returns true if this error represents end-of-stream.
    #[must_use]
    pub const fn is_eof(&self) -> bool {
        matches!(self.kind, ErrorKind::Eof)
    }

    /// Adds context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(errno) = self.errno {
            write!(f, " (errno {errno})")?;
        }
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => Self::from_errno(errno),
            None => Self::new(ErrorKind::Os),
        }
    }
}

/// A specialized Result type for corio operations.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_without_context() {
        let err = Error::new(ErrorKind::Canceled);
        assert_eq!(err.to_string(), "Canceled");
    }

    #[test]
    fn display_with_errno_and_context() {
        let err = Error::from_errno(libc::EPIPE).with_context("write failed");
        assert_eq!(
            err.to_string(),
            format!("BrokenPipe (errno {}): write failed", libc::EPIPE)
        );
    }

    #[test]
    fn errno_mapping_covers_transport_errors() {
        assert_eq!(
            Error::from_errno(libc::ECONNREFUSED).kind(),
            ErrorKind::ConnectionRefused
        );
        assert_eq!(
            Error::from_errno(libc::ECONNRESET).kind(),
            ErrorKind::ConnectionReset
        );
        assert_eq!(
            Error::from_errno(libc::ETIMEDOUT).kind(),
            ErrorKind::TimedOut
        );
        assert_eq!(
            Error::from_errno(libc::EHOSTUNREACH).kind(),
            ErrorKind::Unreachable
        );
        assert_eq!(Error::from_errno(libc::ENOENT).kind(), ErrorKind::Os);
        assert_eq!(Error::from_errno(libc::ENOENT).errno(), Some(libc::ENOENT));
    }

    #[test]
    fn predicates_match_kind() {
        assert!(Error::new(ErrorKind::Canceled).is_canceled());
        assert!(!Error::new(ErrorKind::Canceled).is_eof());
        assert!(Error::new(ErrorKind::Eof).is_eof());
    }

    #[test]
    fn from_io_error_preserves_errno() {
        let io_err = std::io::Error::from_raw_os_error(libc::ECONNRESET);
        let err: Error = io_err.into();
        assert_eq!(err.kind(), ErrorKind::ConnectionReset);
        assert_eq!(err.errno(), Some(libc::ECONNRESET));
    }
}
