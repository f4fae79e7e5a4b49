use std::future::Future;
use std::time::Duration;

use crate::errors::VerseError;

/// Bounded race of a non-critical future against a timeout budget.
///
/// Failures and timeouts are logged and swallowed; the primary flow is
/// never blocked on the outcome.
pub async fn best_effort<T>(
    what: &str,
    budget: Duration,
    fut: impl Future<Output = Result<T, VerseError>>,
) -> Option<T> {
    match tokio::time::timeout(budget, fut).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            tracing::warn!("{what} failed: {e}");
            None
        }
        Err(_) => {
            tracing::warn!("{what} timed out after {budget:?}");
            None
        }
    }
}
