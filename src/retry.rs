//! Retry backoff utilities.
//!
//! The helpers in this module are transport-agnostic and are shared by the
//! reconnect loop and the subscribe retry path of the RTA connection.

use std::time::Duration;

/// Policy controlling quadratic backoff growth.
///
/// The delay before a retry is `min(attempt² * unit, max_backoff)`, where
/// `attempt` counts the attempts already made since the last success.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Length of one backoff unit.
    pub unit: Duration,
    /// Upper bound for backoff delay growth.
    pub max_backoff: Duration,
}

impl BackoffPolicy {
    /// Returns the service-recommended policy: one-second units capped at a
    /// minute.
    pub fn quadratic() -> Self {
        Self {
            unit: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }

    /// Computes the delay to apply before the given retry attempt.
    ///
    /// `attempt` is 0-based, so the very first retry is immediate.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let squared = u64::from(attempt).saturating_mul(u64::from(attempt));
        let squared = u32::try_from(squared).unwrap_or(u32::MAX);
        std::cmp::min(self.unit.saturating_mul(squared), self.max_backoff)
    }

    /// Returns the delay for `attempt` and advances the counter.
    pub fn next_delay(&self, attempt: &mut u32) -> Duration {
        let delay = self.delay_for_attempt(*attempt);
        *attempt = attempt.saturating_add(1);
        delay
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::quadratic()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::BackoffPolicy;

    #[test]
    fn quadratic_schedule_grows_by_square_of_attempt() {
        let policy = BackoffPolicy::quadratic();
        let delays: Vec<u64> = (0..5)
            .map(|attempt| policy.delay_for_attempt(attempt).as_secs())
            .collect();
        assert_eq!(delays, vec![0, 1, 4, 9, 16]);
    }

    #[test]
    fn delay_is_capped_at_max_backoff() {
        let policy = BackoffPolicy::quadratic();
        assert_eq!(policy.delay_for_attempt(8), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn next_delay_advances_counter() {
        let policy = BackoffPolicy {
            unit: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        };
        let mut attempt = 0;
        assert_eq!(policy.next_delay(&mut attempt), Duration::ZERO);
        assert_eq!(policy.next_delay(&mut attempt), Duration::from_millis(10));
        assert_eq!(policy.next_delay(&mut attempt), Duration::from_millis(40));
        assert_eq!(policy.next_delay(&mut attempt), Duration::from_millis(50));
        assert_eq!(attempt, 4);
    }
}
