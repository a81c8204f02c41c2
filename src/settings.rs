//! Policy and backoff settings.
//!
//! Settings come in two shapes. The partial shape ([`PolicySettings`],
//! [`BackoffSettings`]) is what users write in configuration files; every
//! field is optional. `resolve()` fills defaults and validates, producing the
//! concrete policy types. Resolved policies convert back into fully-populated
//! partial settings, whose JSON form is the transport format handed to the
//! Redis script: a flat object tagged by `type`, with durations as plain
//! milliseconds.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, ThrottleError};
use crate::ratelimit::backoff::BackoffPolicy;
use crate::ratelimit::policy::{FixedWindow, SlidingWindow, WindowPolicy};

const DEFAULT_WINDOW: Duration = Duration::from_secs(1);
const DEFAULT_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
const DEFAULT_JITTER: f64 = 0.5;
const DEFAULT_MULTIPLIER: f64 = 2.0;
const DEFAULT_DEGREE: f64 = 2.0;

/// Window policy settings, as supplied by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PolicySettings {
    /// Fixed window counter.
    FixedWindow {
        #[serde(default, with = "millis", skip_serializing_if = "Option::is_none")]
        window: Option<Duration>,
    },
    /// Weighted two-bucket sliding window.
    SlidingWindow {
        #[serde(default, with = "millis", skip_serializing_if = "Option::is_none")]
        window: Option<Duration>,
        #[serde(default, with = "millis", skip_serializing_if = "Option::is_none")]
        margin: Option<Duration>,
    },
}

/// A resolved window policy of either kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedPolicy {
    FixedWindow(FixedWindow),
    SlidingWindow(SlidingWindow),
}

impl ResolvedPolicy {
    /// Fully-populated settings describing this policy.
    pub fn to_settings(&self) -> PolicySettings {
        match self {
            ResolvedPolicy::FixedWindow(policy) => policy.to_settings(),
            ResolvedPolicy::SlidingWindow(policy) => policy.to_settings(),
        }
    }
}

impl Default for PolicySettings {
    fn default() -> Self {
        PolicySettings::FixedWindow { window: None }
    }
}

impl PolicySettings {
    /// Fill defaults and validate.
    pub fn resolve(&self) -> Result<ResolvedPolicy> {
        match self {
            PolicySettings::FixedWindow { window } => Ok(ResolvedPolicy::FixedWindow(
                FixedWindow::new(window.unwrap_or(DEFAULT_WINDOW))?,
            )),
            PolicySettings::SlidingWindow { window, margin } => {
                let window = window.unwrap_or(DEFAULT_WINDOW);
                let policy = match margin {
                    Some(margin) => SlidingWindow::with_margin(window, *margin)?,
                    None => SlidingWindow::new(window)?,
                };
                Ok(ResolvedPolicy::SlidingWindow(policy))
            }
        }
    }

    /// Encode as the flat JSON transport form.
    pub fn to_transport(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode from the JSON transport form.
    pub fn from_transport(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Backoff settings, as supplied by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BackoffSettings {
    #[serde(rename_all = "camelCase")]
    Constant {
        #[serde(default, with = "millis", skip_serializing_if = "Option::is_none")]
        delay: Option<Duration>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        jitter: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    Linear {
        #[serde(default, with = "millis", skip_serializing_if = "Option::is_none")]
        min_delay: Option<Duration>,
        #[serde(default, with = "millis", skip_serializing_if = "Option::is_none")]
        max_delay: Option<Duration>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        jitter: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    Exponential {
        #[serde(default, with = "millis", skip_serializing_if = "Option::is_none")]
        min_delay: Option<Duration>,
        #[serde(default, with = "millis", skip_serializing_if = "Option::is_none")]
        max_delay: Option<Duration>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        multiplier: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        jitter: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    Polynomial {
        #[serde(default, with = "millis", skip_serializing_if = "Option::is_none")]
        min_delay: Option<Duration>,
        #[serde(default, with = "millis", skip_serializing_if = "Option::is_none")]
        max_delay: Option<Duration>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        degree: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        jitter: Option<f64>,
    },
}

impl Default for BackoffSettings {
    fn default() -> Self {
        BackoffSettings::Exponential {
            min_delay: None,
            max_delay: None,
            multiplier: None,
            jitter: None,
        }
    }
}

impl BackoffSettings {
    /// Fill defaults and validate.
    pub fn resolve(&self) -> Result<BackoffPolicy> {
        let policy = match self {
            BackoffSettings::Constant { delay, jitter } => BackoffPolicy::Constant {
                delay: delay.unwrap_or(DEFAULT_DELAY),
                jitter: jitter.unwrap_or(DEFAULT_JITTER),
            },
            BackoffSettings::Linear {
                min_delay,
                max_delay,
                jitter,
            } => BackoffPolicy::Linear {
                min_delay: min_delay.unwrap_or(DEFAULT_DELAY),
                max_delay: max_delay.unwrap_or(DEFAULT_MAX_DELAY),
                jitter: jitter.unwrap_or(DEFAULT_JITTER),
            },
            BackoffSettings::Exponential {
                min_delay,
                max_delay,
                multiplier,
                jitter,
            } => BackoffPolicy::Exponential {
                min_delay: min_delay.unwrap_or(DEFAULT_DELAY),
                max_delay: max_delay.unwrap_or(DEFAULT_MAX_DELAY),
                multiplier: multiplier.unwrap_or(DEFAULT_MULTIPLIER),
                jitter: jitter.unwrap_or(DEFAULT_JITTER),
            },
            BackoffSettings::Polynomial {
                min_delay,
                max_delay,
                degree,
                jitter,
            } => BackoffPolicy::Polynomial {
                min_delay: min_delay.unwrap_or(DEFAULT_DELAY),
                max_delay: max_delay.unwrap_or(DEFAULT_MAX_DELAY),
                degree: degree.unwrap_or(DEFAULT_DEGREE),
                jitter: jitter.unwrap_or(DEFAULT_JITTER),
            },
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Encode as the flat JSON transport form.
    pub fn to_transport(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode from the JSON transport form.
    pub fn from_transport(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

pub(crate) fn delay_bounds(min: Duration, max: Duration) -> Result<()> {
    whole_millis("minDelay", min)?;
    whole_millis("maxDelay", max)?;
    if min > max {
        return Err(ThrottleError::validation(format!(
            "minDelay ({}ms) must not exceed maxDelay ({}ms)",
            min.as_millis(),
            max.as_millis()
        )));
    }
    Ok(())
}

/// A positive whole number of milliseconds that fits epoch arithmetic.
pub(crate) fn whole_millis(name: &str, value: Duration) -> Result<i64> {
    if value.is_zero() {
        return Err(ThrottleError::validation(format!("{name} must be positive")));
    }
    non_negative_millis(name, value)
}

pub(crate) fn non_negative_millis(name: &str, value: Duration) -> Result<i64> {
    if value.subsec_nanos() % 1_000_000 != 0 {
        return Err(ThrottleError::validation(format!(
            "{name} must be a whole number of milliseconds, got {value:?}"
        )));
    }
    i64::try_from(value.as_millis())
        .map_err(|_| ThrottleError::validation(format!("{name} is too large, got {value:?}")))
}

pub(crate) fn unit_interval(name: &str, value: f64) -> Result<f64> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ThrottleError::validation(format!(
            "{name} must be between 0 and 1, got {value}"
        )));
    }
    Ok(value)
}

pub(crate) fn positive_finite(name: &str, value: f64) -> Result<f64> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ThrottleError::validation(format!(
            "{name} must be a positive number, got {value}"
        )));
    }
    Ok(value)
}

/// Optional durations as JSON milliseconds.
///
/// Output is always whole milliseconds, rounded down. Fractional milliseconds
/// are accepted on input so that validation can reject them with a clear
/// message instead of a parse error.
pub(crate) mod millis {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        let Some(ms) = Option::<f64>::deserialize(deserializer)? else {
            return Ok(None);
        };
        if !ms.is_finite() || ms < 0.0 {
            return Err(D::Error::custom(format!(
                "duration must be a non-negative number of milliseconds, got {ms}"
            )));
        }
        if ms.fract() == 0.0 {
            Ok(Some(Duration::from_millis(ms as u64)))
        } else {
            Ok(Some(Duration::from_nanos((ms * 1_000_000.0).round() as u64)))
        }
    }
}
