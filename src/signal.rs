//! Abort plumbing.
//!
//! An [`AbortController`] owns a cancellation token; its [`AbortSignal`] is
//! cloned into requests and observed at every suspension point: resolver
//! lookups, the connect race, TLS/QUIC handshakes, and body reads.

use tokio_util::sync::CancellationToken;

use crate::error::{Error, ErrorKind};

/// Caller-side handle that can abort in-flight fetches.
#[derive(Debug, Clone, Default)]
pub struct AbortController {
    token: CancellationToken,
}

impl AbortController {
    pub fn new() -> Self {
        Self::default()
    }

    /// The signal to pass in request options.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            token: self.token.clone(),
        }
    }

    /// Abort every fetch observing this controller's signal.
    ///
    /// Propagates synchronously: pending lookups, the happy-eyeballs race,
    /// in-flight sockets and handshakes, and body streams all observe the
    /// same token.
    pub fn abort(&self) {
        self.token.cancel();
    }
}

/// Request-side view of an [`AbortController`].
#[derive(Debug, Clone)]
pub struct AbortSignal {
    token: CancellationToken,
}

impl AbortSignal {
    /// A signal that never fires. Used when the caller passed none.
    pub(crate) fn never() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// True once `abort()` has been called.
    pub fn aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the signal fires.
    pub(crate) async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Fail fast if already aborted.
    pub(crate) fn check(&self) -> Result<(), Error> {
        if self.aborted() {
            Err(Error::new(ErrorKind::Aborted, "request aborted"))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_observes_controller() {
        let controller = AbortController::new();
        let signal = controller.signal();
        assert!(!signal.aborted());
        assert!(signal.check().is_ok());

        controller.abort();
        assert!(signal.aborted());
        assert_eq!(signal.check().unwrap_err().kind(), ErrorKind::Aborted);
    }

    #[tokio::test]
    async fn cancelled_resolves_after_abort() {
        let controller = AbortController::new();
        let signal = controller.signal();
        controller.abort();
        // must not hang
        signal.cancelled().await;
    }
}
