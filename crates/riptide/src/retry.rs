//! Fixed-backoff retry used around every metadata-store and remote-RPC call.
//!
//! Retried operations are idempotent; termination is external, either
//! through success or through the caller's cancellation token.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Retry policy that sleeps a constant interval between attempts.
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff {
    pub interval: Duration,
}

impl FixedBackoff {
    pub const fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// Run `op` until it succeeds, sleeping `backoff.interval` between failures.
/// Returns an error only when `cancel` fires while waiting to retry.
pub async fn retry_with_backoff<T, F, Fut>(
    backoff: FixedBackoff,
    cancel: &CancellationToken,
    label: &str,
    mut op: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0u64;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                tracing::warn!(op = label, attempt, error = ?err, "operation failed, backing off");
                tokio::select! {
                    _ = cancel.cancelled() => {
                        anyhow::bail!("{label} cancelled after {attempt} failed attempts");
                    }
                    _ = tokio::time::sleep(backoff.interval) => {}
                }
            }
        }
    }
}
