//! Retry policies for instrument connections.
//!
//! Only connection-open is retried automatically. Everything else in a run
//! either degrades (see [`crate::error::Outcome`]) or abandons the current
//! sub-sequence.

use crate::error::{CalError, CalResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, warn};

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

/// Opens a connection, retrying transport faults according to `policy`.
///
/// Non-transport errors (bad configuration, unsupported vendor) are returned
/// immediately. After the last failed attempt the final transport error is
/// returned and the caller is expected to abort the run.
pub async fn connect_with_retry<T, F, Fut>(
    device: &str,
    policy: &RetryPolicy,
    mut connect: F,
) -> CalResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CalResult<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match connect().await {
            Ok(connection) => return Ok(connection),
            Err(err) if err.is_transport() => {
                warn!(
                    "Connection to '{}' failed (attempt {}/{}): {}",
                    device, attempt, attempts, err
                );
                last_error = Some(err);
                if attempt < attempts {
                    sleep(policy.backoff_delay).await;
                }
            }
            Err(err) => return Err(err),
        }
    }
    error!("Giving up on '{}' after {} attempts", device, attempts);
    Err(last_error.unwrap_or_else(|| {
        CalError::transport(device, format!("failed after {} attempts", attempts))
    }))
}
