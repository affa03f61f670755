//! Exponential retry spacing.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Highest exponent applied to the base delay.
const MAX_EXPONENT: u32 = 16;

/// Bounded exponential backoff: `base * 2^attempt` for `attempt` in
/// `0..max_attempts`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max_attempts: u32,
}

impl Backoff {
    /// Create a backoff policy.
    pub const fn new(base: Duration, max_attempts: u32) -> Self {
        Self { base, max_attempts }
    }

    /// Delay after the given zero-based attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(MAX_EXPONENT);
        self.base.saturating_mul(factor)
    }

    /// Number of attempts this policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Base delay.
    pub fn base(&self) -> Duration {
        self.base
    }
}

/// Sleep for `delay` unless `cancel` fires first.
///
/// Returns `true` when the full delay elapsed and the token is still live,
/// `false` when cancellation was observed before, during, or after the sleep.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    tokio::select! {
        () = tokio::time::sleep(delay) => !cancel.is_cancelled(),
        () = cancel.cancelled() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double() {
        let b = Backoff::new(Duration::from_secs(1), 5);
        assert_eq!(b.delay(0), Duration::from_secs(1));
        assert_eq!(b.delay(1), Duration::from_secs(2));
        assert_eq!(b.delay(2), Duration::from_secs(4));
        assert_eq!(b.delay(4), Duration::from_secs(16));
        assert_eq!(b.max_attempts(), 5);
    }

    #[test]
    fn huge_attempt_is_clamped() {
        let b = Backoff::new(Duration::from_millis(1), 5);
        assert_eq!(b.delay(100), Duration::from_millis(1 << 16));
    }

    #[test]
    fn zero_base_never_sleeps() {
        let b = Backoff::new(Duration::ZERO, 3);
        assert_eq!(b.delay(3), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_without_cancel() {
        let token = CancellationToken::new();
        assert!(sleep_or_cancel(Duration::from_secs(8), &token).await);
    }

    #[tokio::test]
    async fn already_cancelled_returns_immediately() {
        let token = CancellationToken::new();
        token.cancel();
        let started = std::time::Instant::now();
        assert!(!sleep_or_cancel(Duration::from_secs(300), &token).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn cancel_interrupts_sleep() {
        let token = CancellationToken::new();
        let t2 = token.clone();
        let handle =
            tokio::spawn(async move { sleep_or_cancel(Duration::from_secs(300), &t2).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        let slept = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!slept);
    }
}
