//! Error type shared by the writer, its worker and the cancellation gate.

use std::io;
use std::sync::Arc;

/// Errors reported by [`NonBlockWriter`](crate::NonBlockWriter).
///
/// Sink errors are kept behind an [`Arc`] so the same recorded value can be
/// handed to every caller of `close` and `last_result`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A write was attempted after shutdown began.
    #[error("NonBlockWriter is closed")]
    Closed,

    /// A write was attempted after shutdown began, and the worker had
    /// recorded an error before stopping.
    #[error("NonBlockWriter is closed: {0}")]
    ClosedAfter(#[source] Box<Error>),

    /// The wrapped sink returned an error.
    #[error("sink write failed: {0}")]
    Sink(#[source] Arc<io::Error>),

    /// The cancellation token was cancelled.
    #[error("writer cancelled")]
    Cancelled,

    /// The cancellation token's deadline passed.
    #[error("writer deadline exceeded")]
    DeadlineExceeded,

    /// The worker thread panicked inside the sink.
    #[error("writer worker panicked")]
    WorkerPanicked,

    /// `write` was called from the writer's own worker thread, for example by
    /// a log event emitted while the worker handles a sink error. The data is
    /// not queued.
    #[error("write from the NonBlockWriter's own worker thread")]
    FromWorker,
}

impl Error {
    /// Builds the error returned to producers once the writer is closed.
    pub(crate) fn closed(last: Option<Error>) -> Self {
        match last {
            Some(err) => Error::ClosedAfter(Box::new(err)),
            None => Error::Closed,
        }
    }

    /// Returns `true` for [`Error::Closed`] and [`Error::ClosedAfter`].
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed | Error::ClosedAfter(_))
    }

    /// Returns the underlying sink error, looking through `ClosedAfter`.
    pub fn sink_error(&self) -> Option<&io::Error> {
        match self {
            Error::Sink(err) => Some(err),
            Error::ClosedAfter(inner) => inner.sink_error(),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Sink(Arc::new(err))
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::Closed | Error::ClosedAfter(_) => io::ErrorKind::BrokenPipe,
            Error::Sink(inner) => inner.kind(),
            Error::Cancelled => io::ErrorKind::Other,
            Error::DeadlineExceeded => io::ErrorKind::TimedOut,
            Error::WorkerPanicked | Error::FromWorker => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_closed_wraps_last_error() {
        let sink = Error::from(io::Error::new(io::ErrorKind::Other, "disk full"));
        let err = Error::closed(Some(sink));
        assert!(err.is_closed());
        assert_eq!(err.to_string(), "NonBlockWriter is closed: sink write failed: disk full");
        assert_eq!(err.sink_error().map(|e| e.to_string()).as_deref(), Some("disk full"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_closed_without_last_error() {
        let err = Error::closed(None);
        assert!(matches!(err, Error::Closed));
        assert!(err.source().is_none());
        assert!(err.sink_error().is_none());
    }

    #[test]
    fn test_into_io_error_kind() {
        let io_err: io::Error = Error::Closed.into();
        assert_eq!(io_err.kind(), io::ErrorKind::BrokenPipe);

        let io_err: io::Error = Error::DeadlineExceeded.into();
        assert_eq!(io_err.kind(), io::ErrorKind::TimedOut);

        let sink = Error::from(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        let io_err: io::Error = sink.into();
        assert_eq!(io_err.kind(), io::ErrorKind::PermissionDenied);
    }
}
