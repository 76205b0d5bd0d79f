//! Small helpers for asserting on asynchronous job-processing outcomes
//! without sprinkling ad-hoc `sleep` loops through every test.

use std::time::Duration;

/// Poll `predicate` every `interval` until it returns `true` or `timeout`
/// elapses, whichever comes first. Returns whether the predicate was ever
/// observed true.
pub async fn wait_until<F, Fut>(timeout: Duration, interval: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}
