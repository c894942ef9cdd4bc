//! Busy-retry executor for write operations.
//!
//! SQLite reports write conflicts as transient busy/locked errors. Every
//! durable write runs through [`RetryPolicy::run_write`], which retries
//! busy errors under capped exponential backoff (100 ms, 200 ms, 400 ms,
//! 800 ms, 1600 ms by default) and gives up after the configured number of
//! retries. Non-busy errors propagate immediately, and a fired
//! cancellation token short-circuits the backoff sleep.

use std::sync::Arc;
use std::time::Duration;

use tokio::task;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StateError};

/// Backoff policy applied to every durable write.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    /// First backoff sleep; doubles on every retry.
    pub base_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_wait: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Run `thunk` on the blocking pool, retrying busy errors.
    ///
    /// The thunk may run up to `max_retries + 1` times. Cancellation is
    /// checked before every attempt and interrupts the backoff sleep; the
    /// resulting error wraps the last busy error observed.
    pub async fn run_write<T, F>(
        &self,
        op: &'static str,
        cancel: &CancellationToken,
        thunk: F,
    ) -> Result<T>
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let thunk = Arc::new(thunk);
        let mut wait = self.base_wait;
        let mut last_busy = "cancelled before execution".to_string();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(StateError::Cancelled {
                    op: op.to_string(),
                    last_error: last_busy,
                });
            }

            let call = Arc::clone(&thunk);
            let result = task::spawn_blocking(move || (*call)())
                .await
                .map_err(|e| StateError::Other(anyhow::anyhow!("blocking write panicked: {e}")))?;

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_busy() && attempt < self.max_retries => {
                    tracing::debug!(
                        op,
                        attempt,
                        wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                        "write conflicted, backing off"
                    );
                    last_busy = err.to_string();
                    tokio::select! {
                        () = cancel.cancelled() => {
                            return Err(StateError::Cancelled {
                                op: op.to_string(),
                                last_error: last_busy,
                            });
                        }
                        () = tokio::time::sleep(wait) => {}
                    }
                    wait *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
