//! Caller context: cancellation and deadlines for a check.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Why a context ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The owner of the [`CancelHandle`] cancelled it.
    Cancelled,
    /// The deadline passed.
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Cancelled => f.write_str("context cancelled"),
            CancelReason::DeadlineExceeded => f.write_str("deadline exceeded"),
        }
    }
}

/// Cancels every [`CheckContext`] derived from the one it was created with.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Cancellation signal and optional deadline carried into a check.
///
/// Cloning or deriving a context shares its cancellation signal; a derived
/// deadline never extends the parent's.
#[derive(Debug, Clone)]
pub struct CheckContext {
    cancelled: watch::Receiver<bool>,
    deadline: Option<Instant>,
}

impl CheckContext {
    /// A context that never ends.
    pub fn background() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self {
            cancelled: rx,
            deadline: None,
        }
    }

    /// A context ended by the returned handle.
    pub fn with_cancel() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let ctx = Self {
            cancelled: rx,
            deadline: None,
        };
        (ctx, CancelHandle { tx: Arc::new(tx) })
    }

    /// Derive a context that also ends after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context that also ends at `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        };
        Self {
            cancelled: self.cancelled.clone(),
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The reason this context has ended, if it has.
    pub fn err(&self) -> Option<CancelReason> {
        if *self.cancelled.borrow() {
            return Some(CancelReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelReason::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolve once the context ends. Pending forever for a background
    /// context.
    pub async fn done(&self) -> CancelReason {
        let mut rx = self.cancelled.clone();
        let cancelled = async move {
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Sender gone without cancelling: never fires
                    std::future::pending::<()>().await;
                }
            }
        };

        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = cancelled => CancelReason::Cancelled,
                _ = tokio::time::sleep_until(deadline) => CancelReason::DeadlineExceeded,
            },
            None => {
                cancelled.await;
                CancelReason::Cancelled
            }
        }
    }

    /// Drive `fut` unless the context ends first, in which case `fut` is
    /// dropped.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, CancelReason> {
        if let Some(reason) = self.err() {
            return Err(reason);
        }
        tokio::select! {
            biased;
            reason = self.done() => Err(reason),
            output = fut => Ok(output),
        }
    }
}

impl Default for CheckContext {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_never_ends() {
        let ctx = CheckContext::background();
        assert_eq!(ctx.err(), None);
        assert_eq!(ctx.run(async { 5 }).await, Ok(5));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_run() {
        let (ctx, handle) = CheckContext::with_cancel();

        let task = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.run(std::future::pending::<()>()).await }
        });
        tokio::task::yield_now().await;
        handle.cancel();

        assert_eq!(task.await.unwrap(), Err(CancelReason::Cancelled));
        assert_eq!(ctx.err(), Some(CancelReason::Cancelled));
    }

    #[tokio::test]
    async fn test_already_cancelled_skips_future() {
        let (ctx, handle) = CheckContext::with_cancel();
        handle.cancel();

        let mut polled = false;
        let result = ctx
            .run(async {
                polled = true;
            })
            .await;
        assert_eq!(result, Err(CancelReason::Cancelled));
        assert!(!polled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline() {
        let ctx = CheckContext::background().with_timeout(Duration::from_millis(50));
        let start = Instant::now();

        let result = ctx.run(tokio::time::sleep(Duration::from_secs(10))).await;
        assert_eq!(result, Err(CancelReason::DeadlineExceeded));
        assert_eq!(start.elapsed(), Duration::from_millis(50));
        assert_eq!(ctx.err(), Some(CancelReason::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_child_deadline_never_extends_parent() {
        let parent = CheckContext::background().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());

        let tighter = parent.with_timeout(Duration::from_millis(10));
        assert!(tighter.deadline() < parent.deadline());
    }

    #[tokio::test]
    async fn test_derived_context_shares_cancellation() {
        let (ctx, handle) = CheckContext::with_cancel();
        let child = ctx.with_timeout(Duration::from_secs(60));

        handle.cancel();
        assert_eq!(child.done().await, CancelReason::Cancelled);
    }
}
