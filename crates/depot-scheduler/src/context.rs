//! Per-build cancellation context.

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

/// Why a running build was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The build ran past the configured timeout.
    Timeout,
    /// An operator asked for the job to be cancelled.
    CancelRequested,
    /// The worker pool gave up waiting during shutdown.
    Shutdown,
}

/// Cancellation token plus the reason it fired. The first reason recorded
/// wins; later calls to [`stop`](Self::stop) only re-cancel the token.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    token: CancellationToken,
    reason: Arc<OnceLock<StopReason>>,
}

impl BuildContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self, reason: StopReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.reason.get().copied()
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn stopped(&self) {
        self.token.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let ctx = BuildContext::new();
        assert!(!ctx.is_stopped());
        assert_eq!(ctx.reason(), None);

        let clone = ctx.clone();
        clone.stop(StopReason::Timeout);
        ctx.stop(StopReason::CancelRequested);

        assert!(ctx.is_stopped());
        assert_eq!(ctx.reason(), Some(StopReason::Timeout));
        assert!(ctx.token().is_cancelled());
    }
}
