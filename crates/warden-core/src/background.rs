//! Best-effort background work: bounded exponential backoff retries.

use std::future::Future;
use std::time::Duration;

use warden_store::SqliteStore;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// Run `op` until it succeeds or `policy.max_attempts` is reached.
///
/// # Errors
///
/// Returns the last error once every attempt failed.
pub async fn retry_with_backoff<T, E, F, Fut>(
    label: &str,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt + 1 >= attempts => return Err(e),
            Err(e) => {
                let delay = policy.delay(attempt);
                tracing::warn!(
                    task = label,
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    error = %e,
                    "background task failed, retrying in {delay:?}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Persist post-turn notes with retries. Returns how many were lost.
pub async fn flush_notes(
    store: &SqliteStore,
    agent_id: &str,
    session_id: &str,
    notes: &[String],
    policy: RetryPolicy,
) -> usize {
    let result = retry_with_backoff("memory_flush", policy, || async {
        for note in notes {
            store.save_note(agent_id, session_id, note).await?;
        }
        Ok::<_, warden_store::StoreError>(())
    })
    .await;
    match result {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(
                agent = agent_id,
                session = session_id,
                lost = notes.len(),
                error = %e,
                "memory flush exhausted retries"
            );
            notes.len()
        }
    }
}
