//! Deadline and cancellation propagation.
//!
//! Every operation that crosses a driver boundary takes an [`OpContext`].
//! The context carries an absolute deadline and a cancellation token; child
//! contexts never extend the parent's deadline.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{PrismError, Result};

/// Deadline + cancellation scope for one operation tree
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl OpContext {
    /// Unbounded context (no deadline, not cancelled)
    pub fn new() -> Self {
        Self::default()
    }

    /// Context that expires `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` means unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn expired(&self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel this context and every child derived from it
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Child context bounded by `timeout`, never later than the parent
    /// deadline, cancelled when the parent is cancelled.
    pub fn child(&self, timeout: Duration) -> Self {
        let child_deadline = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) => Some(parent.min(child_deadline)),
            None => Some(child_deadline),
        };
        Self {
            deadline,
            cancel: self.cancel.child_token(),
        }
    }

    /// Run `fut` under this context's deadline and cancellation. Expiry maps
    /// to a transient timeout, cancellation to a transient cancellation.
    pub async fn run<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = T>,
    {
        if self.is_cancelled() {
            return Err(PrismError::cancelled(what));
        }
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => Err(PrismError::cancelled(what)),
                out = tokio::time::timeout_at(deadline, fut) => {
                    out.map_err(|_| PrismError::timeout(what))
                }
            },
            None => tokio::select! {
                _ = self.cancel.cancelled() => Err(PrismError::cancelled(what)),
                out = fut => Ok(out),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_expires() {
        let ctx = OpContext::with_timeout(Duration::from_millis(50));
        let out = ctx
            .run("sleep", tokio::time::sleep(Duration::from_secs(1)))
            .await;
        assert!(out.unwrap_err().is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn child_never_extends_parent() {
        let parent = OpContext::with_timeout(Duration::from_millis(10));
        let child = parent.child(Duration::from_secs(60));
        assert!(child.remaining().unwrap() <= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn cancellation_propagates_to_children() {
        let parent = OpContext::new();
        let child = parent.child(Duration::from_secs(60));
        parent.cancel();
        assert!(child.is_cancelled());
        let out = child.run("noop", async { 1 }).await;
        assert!(out.is_err());
    }
}
