//! Reconnect-and-retry boundary around externally invoked operations.

use std::future::Future;
use std::sync::Arc;

use crate::error::Result;
use crate::registry::SessionRegistry;

/// Runs an operation and, on a transient connection failure, reconnects the
/// resolved backends, re-probes interpreter liveness and runs it exactly
/// once more. Every other error is returned as is.
#[derive(Debug, Clone)]
pub struct SafeOperation {
    registry: Arc<SessionRegistry>,
}

impl SafeOperation {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match call().await {
            Err(e) if e.is_transient() => {
                tracing::warn!(operation, error = %e, "transient failure, reconnecting");
                self.reconnect(operation).await;
                let retried = call().await;
                if let Err(e) = &retried {
                    tracing::error!(operation, error = %e, kind = %e.kind(), "retry failed");
                }
                retried
            }
            other => other,
        }
    }

    async fn reconnect(&self, operation: &str) {
        if let Err(e) = self.registry.context().reconnect().await {
            tracing::warn!(operation, error = %e, "reconnect failed");
        }
        self.registry.refresh_liveness().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::Config;
    use crate::error::Error;
    use crate::mode::ModeContext;
    use crate::test_kernel::FakeHost;
    use crate::ErrorKind;

    fn safe() -> SafeOperation {
        let host = FakeHost::new();
        let ctx = ModeContext::new(Config::default(), Some(host.managers()));
        SafeOperation::new(Arc::new(SessionRegistry::new(Arc::new(ctx))))
    }

    #[tokio::test]
    async fn test_transient_error_is_retried_once() {
        let safe = safe();
        let attempts = &AtomicUsize::new(0);
        let value = safe
            .run("flaky", move || async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::Connection("reset by peer".into()))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_failure_propagates() {
        let safe = safe();
        let attempts = &AtomicUsize::new(0);
        let err = safe
            .run("down", move || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::Connection("refused".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_other_errors_pass_straight_through() {
        let safe = safe();
        for err in [
            Error::validation("bad index"),
            Error::NotFound("x".into()),
            Error::CrdtDesync("diverged".into()),
        ] {
            let attempts = &AtomicUsize::new(0);
            let kind = err.kind();
            let slot = &std::sync::Mutex::new(Some(err));
            let got = safe
                .run("op", move || async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(slot.lock().unwrap().take().unwrap())
                })
                .await
                .unwrap_err();
            assert_eq!(got.kind(), kind);
            assert_eq!(attempts.load(Ordering::SeqCst), 1);
        }
    }
}
