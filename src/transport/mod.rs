//! Shared transport plumbing for the outbound side of the pipeline: the
//! retry policy used by the evidence publisher and the alert dispatcher, the
//! TLS client configuration, and the SMTP wire client.

pub mod smtp;
pub mod tls;

use std::time::Duration;

/// Exponential backoff schedule: `1 + retries` attempts, delay
/// `base * factor^(n-1)` before retry `n`.
///
/// The loops that use this are explicit at the call sites (publisher,
/// dispatcher); this type only answers "how many attempts" and "how long
/// before the next one", so tests can zero the base and count attempts
/// without sleeping.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
    pub factor: u32,
}

impl RetryPolicy {
    /// Production default: base 2 s, doubling.
    pub fn with_retries(retries: u32) -> Self {
        Self {
            retries,
            base_delay: Duration::from_secs(2),
            factor: 2,
        }
    }

    /// No sleeping, for tests.
    pub fn immediate(retries: u32) -> Self {
        Self {
            retries,
            base_delay: Duration::ZERO,
            factor: 2,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        1 + self.retries
    }

    /// Delay before retry number `retry` (1-based). Monotonically
    /// non-decreasing in `retry`.
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base_delay * self.factor.saturating_pow(exponent)
    }
}
