use std::{
    future::Future,
    time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Deadline and cancellation state threaded through every suspending call.
///
/// Every network round-trip in this crate (server selection, channel checkout, command
/// send/receive) takes an `OperationContext`. Once the deadline is exceeded the in-flight
/// call is abandoned with a timeout error rather than silently retried; the channel it was
/// using is treated as expired from then on.
#[derive(Clone, Debug)]
pub struct OperationContext {
    deadline: Option<Instant>,
    cancellation: CancellationToken,
}

impl OperationContext {
    /// Creates a context with the given timeout from now. `None` means no deadline.
    pub fn new(timeout: impl Into<Option<Duration>>) -> Self {
        Self {
            deadline: timeout.into().map(|t| Instant::now() + t),
            cancellation: CancellationToken::new(),
        }
    }

    /// A context with no deadline and a fresh cancellation token.
    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// Creates a context with the given cancellation token.
    pub fn with_cancellation(timeout: impl Into<Option<Duration>>, token: CancellationToken) -> Self {
        Self {
            deadline: timeout.into().map(|t| Instant::now() + t),
            cancellation: token,
        }
    }

    /// Derive a context whose deadline is the sooner of this context's deadline and
    /// `timeout` from now. The cancellation token is shared.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        Self {
            deadline: Some(match self.deadline {
                Some(existing) => existing.min(candidate),
                None => candidate,
            }),
            cancellation: self.cancellation.clone(),
        }
    }

    /// Whether a deadline was configured at all.
    pub fn has_deadline(&self) -> bool {
        self.deadline.is_some()
    }

    /// Time left until the deadline. `None` when no deadline is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has passed or the context has been cancelled.
    pub fn is_timed_out(&self) -> bool {
        self.cancellation.is_cancelled()
            || matches!(self.remaining(), Some(remaining) if remaining.is_zero())
    }

    /// Cancel all work running under this context's token.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Runs `fut` to completion unless the deadline passes or the context is cancelled
    /// first, in which case the future is dropped and a timeout error is returned.
    pub async fn run_until<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => Err(Error::network_timeout()),
                _ = tokio::time::sleep_until(deadline.into()) => Err(Error::network_timeout()),
                out = fut => Ok(out),
            },
            None => tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => Err(Error::network_timeout()),
                out = fut => Ok(out),
            },
        }
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::unbounded()
    }
}
