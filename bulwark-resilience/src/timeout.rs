//! Timeout guard for async operations
//!
//! The guard is cooperative. When the limit expires it stops waiting and
//! returns a TIMEOUT error, but it cannot halt work the operation has already
//! started. [`TimeoutGuard::run`] drops the future, which stops it at its
//! next await point; [`TimeoutGuard::run_detached`] runs the operation on its
//! own task and aborts that task. Neither interrupts blocking code.

use bulwark_core::{wrap, BoxError, ErrorContext, ManagedError};
use std::future::Future;
use std::time::Duration;

const DEFAULT_OPERATION_NAME: &str = "operation";

/// Bounds the wall-clock time of a single operation
#[derive(Debug, Clone)]
pub struct TimeoutGuard {
    limit: Duration,
    operation_name: String,
}

impl TimeoutGuard {
    pub fn new(limit: Duration) -> Self {
        Self::named(DEFAULT_OPERATION_NAME, limit)
    }

    /// Create a guard whose timeout errors name the operation
    pub fn named(operation_name: impl Into<String>, limit: Duration) -> Self {
        Self {
            limit,
            operation_name: operation_name.into(),
        }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }

    /// Race `fut` against the limit
    pub async fn run<Fut, T, E>(&self, fut: Fut) -> Result<T, ManagedError>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        match tokio::time::timeout(self.limit, fut).await {
            Ok(result) => result.map_err(|error| wrap(error, ErrorContext::new())),
            Err(_) => Err(self.expired()),
        }
    }

    /// Run `fut` on its own task and abort the task when the limit expires.
    ///
    /// A panic inside the operation is reported as a SYSTEM error.
    pub async fn run_detached<Fut, T, E>(&self, fut: Fut) -> Result<T, ManagedError>
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let mut handle = tokio::spawn(fut);

        match tokio::time::timeout(self.limit, &mut handle).await {
            Ok(Ok(result)) => result.map_err(|error| wrap(error, ErrorContext::new())),
            Ok(Err(join_error)) => Err(ManagedError::system(format!(
                "{} did not complete: {}",
                self.operation_name, join_error
            ))
            .with_context("operation_name", &self.operation_name)
            .with_cause(join_error)),
            Err(_) => {
                handle.abort();
                Err(self.expired().with_context("aborted", true))
            }
        }
    }

    fn expired(&self) -> ManagedError {
        log::warn!(
            "{} timed out after {:?}",
            self.operation_name,
            self.limit
        );
        ManagedError::timeout(self.operation_name.as_str(), self.limit)
    }
}

/// Race `fut` against `limit`, returning a TIMEOUT error on expiry
pub async fn with_timeout<Fut, T, E>(fut: Fut, limit: Duration) -> Result<T, ManagedError>
where
    Fut: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    TimeoutGuard::new(limit).run(fut).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core::ErrorKind;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::time::{sleep, Instant};

    async fn slow_lookup() -> Result<&'static str, ManagedError> {
        sleep(Duration::from_millis(200)).await;
        Ok("done")
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_operation_times_out() {
        let started = Instant::now();
        let err = with_timeout(slow_lookup(), Duration::from_millis(50))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.timeout_ms(), Some(50));
        assert_eq!(err.operation_name(), Some("operation"));
        assert!(err.is_synthesized());
        assert_eq!(
            err.context_value("cooperative").and_then(|v| v.as_bool()),
            Some(true)
        );
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_operation_passes_through() {
        let guard = TimeoutGuard::named("inventory.lookup", Duration::from_millis(500));
        assert_eq!(guard.run(slow_lookup()).await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_operation_error_is_wrapped() {
        let guard = TimeoutGuard::new(Duration::from_secs(1));
        let err = guard
            .run(async {
                Err::<(), _>(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                ))
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(!err.is_synthesized());
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_operation_is_aborted() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let guard = TimeoutGuard::named("report.render", Duration::from_millis(50));

        let err = guard
            .run_detached(async move {
                sleep(Duration::from_millis(200)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<_, ManagedError>(())
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.operation_name(), Some("report.render"));

        sleep(Duration::from_millis(300)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_detached_panic_is_system_error() {
        let guard = TimeoutGuard::new(Duration::from_secs(1));
        let err = guard
            .run_detached(async {
                if true {
                    panic!("boom");
                }
                Ok::<(), ManagedError>(())
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::System);
        assert!(err.cause().is_some());
    }
}
