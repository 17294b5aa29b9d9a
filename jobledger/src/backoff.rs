//! Retry backoff strategies matching the policies a job can declare.
//!
//! Each [`crate::job::JobRecord`] carries a [`crate::job::BackoffKind`] and a
//! base delay; this module turns those into a concrete delay for a given
//! attempt number, optionally capped and jittered.
//!
//! # Example
//!
//! ```
//! # use jobledger::backoff::BackoffStrategy;
//! # use chrono::TimeDelta;
//! let strategy = BackoffStrategy::exponential(TimeDelta::seconds(2))
//!     .with_max(TimeDelta::seconds(30));
//!
//! assert_eq!(strategy.delay(1), TimeDelta::seconds(2));
//! assert_eq!(strategy.delay(2), TimeDelta::seconds(4));
//! assert_eq!(strategy.delay(3), TimeDelta::seconds(8));
//! assert_eq!(strategy.delay(6), TimeDelta::seconds(30));
//! ```

use chrono::TimeDelta;
use rand::Rng;

/// A backoff strategy with an optional cap and jitter.
///
/// All constructors and configuration functions are `const`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy {
    curve: Curve,
    max: Option<TimeDelta>,
    jitter: Jitter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Curve {
    Fixed(TimeDelta),
    Linear(TimeDelta),
    Exponential(TimeDelta),
}

/// Jitter applied on top of the computed delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    None,
    /// A uniformly random offset in `[-delta, delta]`.
    Absolute(TimeDelta),
    /// A uniformly random scaling in `[1 - factor, 1 + factor]`.
    Relative(f64),
}

impl BackoffStrategy {
    /// The same delay for every attempt.
    pub const fn fixed(delay: TimeDelta) -> Self {
        Self::new(Curve::Fixed(delay))
    }

    /// `base * attempt`.
    pub const fn linear(base: TimeDelta) -> Self {
        Self::new(Curve::Linear(base))
    }

    /// `base * 2^(attempt - 1)`.
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Curve::Exponential(base))
    }

    const fn new(curve: Curve) -> Self {
        Self {
            curve,
            max: None,
            jitter: Jitter::None,
        }
    }

    /// Cap the delay (before jitter) at the given maximum.
    pub const fn with_max(mut self, max: TimeDelta) -> Self {
        self.max = Some(max);
        self
    }

    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// The delay to wait before the given (1-based) attempt is retried.
    ///
    /// Never negative, even with large absolute jitter.
    pub fn delay(&self, attempt: u16) -> TimeDelta {
        let attempt = attempt.max(1);
        let mut millis = match self.curve {
            Curve::Fixed(delay) => delay.num_milliseconds(),
            Curve::Linear(base) => base
                .num_milliseconds()
                .checked_mul(i64::from(attempt))
                .unwrap_or(i64::MAX),
            Curve::Exponential(base) => 2i64
                .checked_pow(u32::from(attempt) - 1)
                .and_then(|factor| base.num_milliseconds().checked_mul(factor))
                .unwrap_or(i64::MAX),
        };
        if let Some(max) = self.max {
            millis = millis.min(max.num_milliseconds());
        }
        TimeDelta::milliseconds(self.apply_jitter(millis).max(0))
    }

    fn apply_jitter(&self, millis: i64) -> i64 {
        match self.jitter {
            Jitter::None => millis,
            Jitter::Absolute(delta) => {
                let delta = delta.num_milliseconds().abs();
                millis + rand::thread_rng().gen_range(-delta..=delta)
            }
            Jitter::Relative(factor) => {
                let factor = rand::thread_rng().gen_range(1.0 - factor..=1.0 + factor);
                (millis as f64 * factor) as i64
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fixed_is_constant() {
        let strategy = BackoffStrategy::fixed(TimeDelta::seconds(10));
        assert_eq!(strategy.delay(1), TimeDelta::seconds(10));
        assert_eq!(strategy.delay(7), TimeDelta::seconds(10));
    }

    #[test]
    fn linear_grows_with_attempt() {
        let strategy = BackoffStrategy::linear(TimeDelta::seconds(10)).with_max(TimeDelta::seconds(40));
        assert_eq!(strategy.delay(1), TimeDelta::seconds(10));
        assert_eq!(strategy.delay(2), TimeDelta::seconds(20));
        assert_eq!(strategy.delay(4), TimeDelta::seconds(40));
        assert_eq!(strategy.delay(5), TimeDelta::seconds(40));
    }

    #[test]
    fn exponential_doubles() {
        let strategy = BackoffStrategy::exponential(TimeDelta::milliseconds(2000));
        assert_eq!(strategy.delay(1), TimeDelta::milliseconds(2000));
        assert_eq!(strategy.delay(2), TimeDelta::milliseconds(4000));
        assert_eq!(strategy.delay(3), TimeDelta::milliseconds(8000));
    }

    #[test]
    fn exponential_does_not_overflow() {
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(2));
        assert_eq!(strategy.delay(u16::MAX), TimeDelta::milliseconds(i64::MAX));
    }

    #[test]
    fn absolute_jitter_stays_within_bounds() {
        let strategy = BackoffStrategy::fixed(TimeDelta::seconds(20))
            .with_jitter(Jitter::Absolute(TimeDelta::seconds(10)));
        for _ in 0..100 {
            let delay = strategy.delay(1);
            assert!(delay >= TimeDelta::seconds(10));
            assert!(delay <= TimeDelta::seconds(30));
        }
    }

    #[test]
    fn relative_jitter_stays_within_bounds() {
        let strategy =
            BackoffStrategy::fixed(TimeDelta::seconds(20)).with_jitter(Jitter::Relative(0.5));
        for _ in 0..100 {
            let delay = strategy.delay(1);
            assert!(delay >= TimeDelta::seconds(10));
            assert!(delay <= TimeDelta::seconds(30));
        }
    }

    #[test]
    fn jitter_never_goes_negative() {
        let strategy = BackoffStrategy::fixed(TimeDelta::seconds(1))
            .with_jitter(Jitter::Absolute(TimeDelta::seconds(60)));
        for _ in 0..100 {
            assert!(strategy.delay(1) >= TimeDelta::zero());
        }
    }
}
