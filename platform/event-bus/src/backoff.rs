//! Reconnect backoff for the consume loop
//!
//! When the broker connection drops under `start_consuming`, the loop keeps
//! trying to rebuild its session with exponentially growing pauses. A stop
//! request ends the wait immediately instead of sleeping out the delay.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// How hard the consume loop tries to get its connection back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Connection attempts before giving up, the first one included; `None` retries forever
    pub max_attempts: Option<u32>,
    /// Pause after the first failed attempt; doubles after each further failure
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(8),
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Never give up; for long-running services that should ride out broker restarts
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Pause after failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

/// Run `connect` until it succeeds, the policy is exhausted, or `stop` turns true
///
/// Returns `Ok(None)` when stopped before a connection was made, and the last
/// connect error once the policy gives up.
pub async fn reconnect_with_backoff<F, Fut, T, E>(
    connect: F,
    policy: &ReconnectPolicy,
    stop: &mut watch::Receiver<bool>,
) -> Result<Option<T>, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        if *stop.borrow_and_update() {
            return Ok(None);
        }
        attempt += 1;

        let e = match connect().await {
            Ok(session) => {
                if attempt > 1 {
                    info!(attempts = attempt, "Broker connection re-established");
                }
                return Ok(Some(session));
            }
            Err(e) => e,
        };

        if policy.exhausted(attempt) {
            error!(attempts = attempt, error = %e, "Giving up on broker reconnect");
            return Err(e);
        }

        let delay = policy.delay_for(attempt);
        warn!(
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            error = %e,
            "Broker reconnect failed, backing off"
        );

        tokio::select! {
            _ = sleep(delay) => {}
            // Sender gone means nobody can restart us either
            changed = stop.changed() => {
                if changed.is_err() {
                    return Ok(None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: Option<u32>) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let policy = fast(None);
        let delays: Vec<u64> = (1..=5)
            .map(|attempt| policy.delay_for(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![10, 20, 40, 50, 50]);
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_transient_failures() {
        let (_tx, mut stop) = watch::channel(false);
        let attempts = AtomicU32::new(0);

        let result = reconnect_with_backoff(
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(format!("connection refused ({})", n))
                    } else {
                        Ok("session")
                    }
                }
            },
            &fast(Some(5)),
            &mut stop,
        )
        .await;

        assert_eq!(result, Ok(Some("session")));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_with_last_error() {
        let (_tx, mut stop) = watch::channel(false);
        let attempts = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result = reconnect_with_backoff(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("broker unreachable") }
            },
            &fast(Some(4)),
            &mut stop,
        )
        .await;

        assert_eq!(result, Err("broker unreachable"));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        // 10 + 20 + 40 between the four attempts
        assert!(started.elapsed() >= Duration::from_millis(70));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_backoff() {
        let (tx, mut stop) = watch::channel(false);
        let attempts = AtomicU32::new(0);
        let policy = ReconnectPolicy {
            max_attempts: None,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
        };

        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            tx.send_replace(true);
            // Keep the sender alive past the wake-up
            sleep(Duration::from_secs(120)).await;
        });

        let started = tokio::time::Instant::now();
        let result = reconnect_with_backoff(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("broker unreachable") }
            },
            &policy,
            &mut stop,
        )
        .await;

        assert_eq!(result, Ok(None));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_already_stopped_makes_no_attempt() {
        let (_tx, mut stop) = watch::channel(true);
        let attempts = AtomicU32::new(0);

        let result = reconnect_with_backoff(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(()) }
            },
            &ReconnectPolicy::default(),
            &mut stop,
        )
        .await;

        assert_eq!(result, Ok(None));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }
}
