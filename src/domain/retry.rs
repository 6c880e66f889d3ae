use std::time::Duration;

/// What to do with a job whose handler just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

/// Capped exponential backoff, shared by the burst loop and the single-shot drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: i32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_secs(30),
            cap: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// `attempts` already includes the claim that just failed.
    pub fn decide(&self, attempts: i32) -> RetryDecision {
        if attempts >= self.max_retries {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry(self.backoff(attempts))
        }
    }

    pub fn backoff(&self, attempts: i32) -> Duration {
        let exponent = attempts.saturating_sub(1).clamp(0, 31) as u32;
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}
