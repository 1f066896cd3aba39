//! Cancellation gate consulted by the worker before each sink write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::Error;

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
}

/// A cloneable liveness signal.
///
/// Every clone observes the same state. A token trips when [`cancel`] is
/// called on any clone, or when its deadline (if any) has passed.
///
/// [`cancel`]: CancelToken::cancel
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// Creates a token that only trips on an explicit [`CancelToken::cancel`].
    pub fn new() -> Self {
        Self::with_deadline_opt(None)
    }

    /// Creates a token that trips once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline_opt(Instant::now().checked_add(timeout))
    }

    /// Creates a token that trips at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::with_deadline_opt(Some(deadline))
    }

    fn with_deadline_opt(deadline: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline,
            }),
        }
    }

    /// Trips the token. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// The deadline, if one was set.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Returns the reason the token tripped, or `None` while it is live.
    ///
    /// An explicit cancel wins over an expired deadline.
    pub fn error(&self) -> Option<Error> {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return Some(Error::Cancelled);
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Error::DeadlineExceeded),
            _ => None,
        }
    }

    /// Returns `true` once the token has tripped.
    pub fn is_cancelled(&self) -> bool {
        self.error().is_some()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
