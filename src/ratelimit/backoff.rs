//! Backoff policies deriving a retry delay from an attempt count.

use std::time::Duration;

use crate::error::Result;
use crate::settings::{delay_bounds, positive_finite, unit_interval, whole_millis, BackoffSettings};

/// A resolved backoff policy.
///
/// Every variant applies multiplicative jitter: the raw delay is scaled by
/// `1 - jitter * random`, where `random` is drawn from `[0, 1)` by the caller.
/// A jitter of `0` makes the delay deterministic.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffPolicy {
    /// Always the same delay.
    Constant { delay: Duration, jitter: f64 },
    /// `min_delay * attempt`, capped at `max_delay`.
    Linear {
        min_delay: Duration,
        max_delay: Duration,
        jitter: f64,
    },
    /// `min_delay * multiplier^attempt`, capped at `max_delay`.
    Exponential {
        min_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter: f64,
    },
    /// `min_delay * attempt^degree`, capped at `max_delay`.
    Polynomial {
        min_delay: Duration,
        max_delay: Duration,
        degree: f64,
        jitter: f64,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl BackoffPolicy {
    /// Check the parameters: whole-millisecond delays with `min <= max`, a
    /// jitter within `[0, 1]` and a positive finite growth factor.
    pub fn validate(&self) -> Result<()> {
        match self {
            BackoffPolicy::Constant { delay, jitter } => {
                whole_millis("delay", *delay)?;
                unit_interval("jitter", *jitter)?;
            }
            BackoffPolicy::Linear {
                min_delay,
                max_delay,
                jitter,
            } => {
                delay_bounds(*min_delay, *max_delay)?;
                unit_interval("jitter", *jitter)?;
            }
            BackoffPolicy::Exponential {
                min_delay,
                max_delay,
                multiplier,
                jitter,
            } => {
                delay_bounds(*min_delay, *max_delay)?;
                positive_finite("multiplier", *multiplier)?;
                unit_interval("jitter", *jitter)?;
            }
            BackoffPolicy::Polynomial {
                min_delay,
                max_delay,
                degree,
                jitter,
            } => {
                delay_bounds(*min_delay, *max_delay)?;
                positive_finite("degree", *degree)?;
                unit_interval("jitter", *jitter)?;
            }
        }
        Ok(())
    }

    /// Delay before the caller should retry after `attempt` attempts.
    ///
    /// The arithmetic mirrors the Redis script operation for operation so that
    /// both sides round to the same millisecond.
    pub fn next_delay(&self, attempt: u64, random: f64) -> Duration {
        let attempt = attempt as f64;
        let (raw, jitter) = match self {
            BackoffPolicy::Constant { delay, jitter } => (millis(delay), *jitter),
            BackoffPolicy::Linear {
                min_delay,
                max_delay,
                jitter,
            } => ((millis(min_delay) * attempt).min(millis(max_delay)), *jitter),
            BackoffPolicy::Exponential {
                min_delay,
                max_delay,
                multiplier,
                jitter,
            } => (
                (millis(min_delay) * multiplier.powf(attempt)).min(millis(max_delay)),
                *jitter,
            ),
            BackoffPolicy::Polynomial {
                min_delay,
                max_delay,
                degree,
                jitter,
            } => (
                (millis(min_delay) * attempt.powf(*degree)).min(millis(max_delay)),
                *jitter,
            ),
        };
        let jittered = raw * (1.0 - jitter * random);
        Duration::from_millis(jittered.floor() as u64)
    }

    /// Fully-populated settings describing this policy.
    pub fn to_settings(&self) -> BackoffSettings {
        match self {
            BackoffPolicy::Constant { delay, jitter } => BackoffSettings::Constant {
                delay: Some(*delay),
                jitter: Some(*jitter),
            },
            BackoffPolicy::Linear {
                min_delay,
                max_delay,
                jitter,
            } => BackoffSettings::Linear {
                min_delay: Some(*min_delay),
                max_delay: Some(*max_delay),
                jitter: Some(*jitter),
            },
            BackoffPolicy::Exponential {
                min_delay,
                max_delay,
                multiplier,
                jitter,
            } => BackoffSettings::Exponential {
                min_delay: Some(*min_delay),
                max_delay: Some(*max_delay),
                multiplier: Some(*multiplier),
                jitter: Some(*jitter),
            },
            BackoffPolicy::Polynomial {
                min_delay,
                max_delay,
                degree,
                jitter,
            } => BackoffSettings::Polynomial {
                min_delay: Some(*min_delay),
                max_delay: Some(*max_delay),
                degree: Some(*degree),
                jitter: Some(*jitter),
            },
        }
    }
}

fn millis(duration: &Duration) -> f64 {
    duration.as_millis() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ThrottleError;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_constant() {
        let policy = BackoffPolicy::Constant {
            delay: ms(500),
            jitter: 0.0,
        };
        assert_eq!(policy.next_delay(1, 0.9), ms(500));
        assert_eq!(policy.next_delay(100, 0.1), ms(500));
    }

    #[test]
    fn test_linear_is_capped() {
        let policy = BackoffPolicy::Linear {
            min_delay: ms(100),
            max_delay: ms(350),
            jitter: 0.0,
        };
        assert_eq!(policy.next_delay(1, 0.0), ms(100));
        assert_eq!(policy.next_delay(3, 0.0), ms(300));
        assert_eq!(policy.next_delay(4, 0.0), ms(350));
    }

    #[test]
    fn test_exponential_is_capped() {
        let policy = BackoffPolicy::Exponential {
            min_delay: ms(100),
            max_delay: ms(5_000),
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(policy.next_delay(1, 0.0), ms(200));
        assert_eq!(policy.next_delay(4, 0.0), ms(1_600));
        assert_eq!(policy.next_delay(10, 0.0), ms(5_000));
    }

    #[test]
    fn test_polynomial() {
        let policy = BackoffPolicy::Polynomial {
            min_delay: ms(10),
            max_delay: ms(60_000),
            degree: 3.0,
            jitter: 0.0,
        };
        assert_eq!(policy.next_delay(2, 0.0), ms(80));
        assert_eq!(policy.next_delay(5, 0.0), ms(1_250));
    }

    #[test]
    fn test_jitter_shrinks_delay() {
        let policy = BackoffPolicy::Constant {
            delay: ms(1_000),
            jitter: 0.5,
        };
        assert_eq!(policy.next_delay(1, 0.0), ms(1_000));
        assert_eq!(policy.next_delay(1, 0.5), ms(750));
        // Full jitter with random near 1 approaches half the delay.
        assert!(policy.next_delay(1, 0.999) >= ms(500));
    }

    #[test]
    fn test_validate_rejects_bad_parameters() {
        let too_much_jitter = BackoffPolicy::Constant {
            delay: ms(1_000),
            jitter: 1.5,
        };
        let inverted = BackoffPolicy::Linear {
            min_delay: ms(5_000),
            max_delay: ms(1_000),
            jitter: 0.0,
        };
        let sub_millisecond = BackoffPolicy::Constant {
            delay: Duration::from_micros(1_500),
            jitter: 0.0,
        };
        let flat = BackoffPolicy::Exponential {
            min_delay: ms(100),
            max_delay: ms(1_000),
            multiplier: f64::NAN,
            jitter: 0.0,
        };
        for policy in [too_much_jitter, inverted, sub_millisecond, flat] {
            assert!(
                matches!(policy.validate(), Err(ThrottleError::Validation(_))),
                "{policy:?} accepted"
            );
        }
        BackoffPolicy::default().validate().unwrap();
    }
}
