//! Reconnect backoff and timeout utilities.
//!
//! The socket worker never gives up on reconnecting while persistence is
//! enabled; this module only decides how long it waits between attempts.

use std::future::Future;
use std::time::Duration;

/// Tiered delay schedule for socket reconnects.
///
/// Attempts are counted from the last successful open. The first
/// `immediate_attempts` retries happen without delay, then `short_delay`
/// applies until `short_attempts`, then `long_delay` from there on.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReconnectPolicy {
    /// Number of consecutive failures retried immediately.
    pub immediate_attempts: u32,
    /// Last attempt number that still uses `short_delay`.
    pub short_attempts: u32,
    /// Delay for attempts after the immediate tier.
    pub short_delay: Duration,
    /// Delay once the short tier is exhausted.
    pub long_delay: Duration,
}

impl ReconnectPolicy {
    /// Schedule used by [`Connection`](crate::connection::Connection):
    /// 0 ms for attempts 1-3, 2 s for attempts 4-24, 30 s afterwards.
    pub fn tiered() -> Self {
        Self {
            immediate_attempts: 3,
            short_attempts: 24,
            short_delay: Duration::from_millis(2_000),
            long_delay: Duration::from_millis(30_000),
        }
    }

    /// Computes the delay before reconnect attempt `attempt`.
    ///
    /// `attempt` is 1-based: it is the number of consecutive closes seen
    /// since the socket was last open.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= self.immediate_attempts {
            Duration::ZERO
        } else if attempt <= self.short_attempts {
            self.short_delay
        } else {
            self.long_delay
        }
    }

    /// Longest delay this policy ever produces.
    pub fn max_delay(&self) -> Duration {
        self.short_delay.max(self.long_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::tiered()
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{with_timeout, ReconnectPolicy};

    #[test]
    fn first_three_attempts_are_immediate() {
        let policy = ReconnectPolicy::tiered();
        for attempt in 1..=3 {
            assert_eq!(policy.delay_for_attempt(attempt), Duration::ZERO);
        }
    }

    #[test]
    fn attempts_four_through_twenty_four_wait_two_seconds() {
        let policy = ReconnectPolicy::tiered();
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(24), Duration::from_secs(2));
    }

    #[test]
    fn later_attempts_wait_thirty_seconds() {
        let policy = ReconnectPolicy::tiered();
        assert_eq!(policy.delay_for_attempt(25), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(10_000), Duration::from_secs(30));
        assert_eq!(policy.max_delay(), Duration::from_secs(30));
    }

    #[test]
    fn with_timeout_reports_elapsed() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let slow = with_timeout(
                Duration::from_millis(5),
                tokio::time::sleep(Duration::from_secs(5)),
            )
            .await;
            assert!(slow.is_err());

            let fast = with_timeout(Duration::from_secs(1), async { 7 }).await;
            assert_eq!(fast.expect("completes"), 7);
        });
    }
}
