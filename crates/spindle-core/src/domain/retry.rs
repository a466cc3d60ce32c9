//! Retry policy: decides how long a released job waits before it is ready again.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Backoff applied when a failed job is released for another attempt.
///
/// `attempts` below is the number of attempts already made (1-indexed: the
/// first failure passes 1).
///
/// Text form (config / CLI), seconds as integers:
/// - `immediate`
/// - `fixed:5`
/// - `linear:5` -> 5s, 10s, 15s, ...
/// - `exponential:2` -> 2s, 4s, 8s, ... capped at one day
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum RetryPolicy {
    /// Back on the ready list right away.
    #[default]
    Immediate,

    /// Same delay for every retry.
    Fixed(Duration),

    /// `step * attempts`.
    Linear { step: Duration },

    /// `base * multiplier^(attempts - 1)`, capped at `max`.
    Exponential {
        base: Duration,
        multiplier: f64,
        max: Duration,
    },
}

const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(86_400);

impl RetryPolicy {
    pub fn exponential(base: Duration) -> Self {
        RetryPolicy::Exponential {
            base,
            multiplier: 2.0,
            max: DEFAULT_MAX_BACKOFF,
        }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        match self {
            RetryPolicy::Immediate => Duration::ZERO,
            RetryPolicy::Fixed(delay) => *delay,
            RetryPolicy::Linear { step } => step.saturating_mul(attempts.max(1)),
            RetryPolicy::Exponential {
                base,
                multiplier,
                max,
            } => {
                let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
                let secs = base.as_secs_f64() * multiplier.powi(exponent);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    *max
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        }
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryPolicy::Immediate => f.write_str("immediate"),
            RetryPolicy::Fixed(d) => write!(f, "fixed:{}", d.as_secs()),
            RetryPolicy::Linear { step } => write!(f, "linear:{}", step.as_secs()),
            RetryPolicy::Exponential { base, .. } => write!(f, "exponential:{}", base.as_secs()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid backoff '{0}': expected immediate, fixed:<secs>, linear:<secs> or exponential:<secs>")]
pub struct ParseRetryPolicyError(String);

impl FromStr for RetryPolicy {
    type Err = ParseRetryPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseRetryPolicyError(s.to_string());
        let s = s.trim();
        if s.eq_ignore_ascii_case("immediate") {
            return Ok(RetryPolicy::Immediate);
        }

        let (name, secs) = s.split_once(':').ok_or_else(err)?;
        let secs: u64 = secs.trim().parse().map_err(|_| err())?;
        let delay = Duration::from_secs(secs);

        match name.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(RetryPolicy::Fixed(delay)),
            "linear" => Ok(RetryPolicy::Linear { step: delay }),
            "exponential" => Ok(RetryPolicy::exponential(delay)),
            _ => Err(err()),
        }
    }
}

impl TryFrom<String> for RetryPolicy {
    type Error = ParseRetryPolicyError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_is_immediate() {
        assert_eq!(RetryPolicy::default(), RetryPolicy::Immediate);
        assert_eq!(RetryPolicy::default().next_delay(1), Duration::ZERO);
    }

    #[rstest]
    #[case(1, 5)]
    #[case(2, 5)]
    #[case(7, 5)]
    fn fixed_never_changes(#[case] attempts: u32, #[case] expected: u64) {
        let policy = RetryPolicy::Fixed(Duration::from_secs(5));
        assert_eq!(policy.next_delay(attempts), Duration::from_secs(expected));
    }

    #[rstest]
    #[case(1, 5)]
    #[case(2, 10)]
    #[case(3, 15)]
    fn linear_grows_by_step(#[case] attempts: u32, #[case] expected: u64) {
        let policy = RetryPolicy::Linear {
            step: Duration::from_secs(5),
        };
        assert_eq!(policy.next_delay(attempts), Duration::from_secs(expected));
    }

    #[rstest]
    #[case(1, 2)]
    #[case(2, 4)]
    #[case(3, 8)]
    #[case(4, 16)]
    fn exponential_doubles(#[case] attempts: u32, #[case] expected: u64) {
        let policy = RetryPolicy::exponential(Duration::from_secs(2));
        assert_eq!(policy.next_delay(attempts), Duration::from_secs(expected));
    }

    #[test]
    fn exponential_is_capped() {
        let policy = RetryPolicy::exponential(Duration::from_secs(2));
        assert_eq!(policy.next_delay(40), Duration::from_secs(86_400));
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(86_400));
    }

    #[rstest]
    #[case("immediate", RetryPolicy::Immediate)]
    #[case("fixed:5", RetryPolicy::Fixed(Duration::from_secs(5)))]
    #[case("linear:3", RetryPolicy::Linear { step: Duration::from_secs(3) })]
    #[case("exponential:2", RetryPolicy::exponential(Duration::from_secs(2)))]
    fn parses_text_form(#[case] input: &str, #[case] expected: RetryPolicy) {
        let parsed: RetryPolicy = input.parse().unwrap();
        assert_eq!(parsed, expected);
        assert_eq!(parsed.to_string(), input);
    }

    #[rstest]
    #[case("")]
    #[case("fixed")]
    #[case("fixed:abc")]
    #[case("random:5")]
    fn rejects_bad_text(#[case] input: &str) {
        assert!(input.parse::<RetryPolicy>().is_err());
    }

    #[test]
    fn deserializes_from_string() {
        let p: RetryPolicy = serde_json::from_str("\"linear:4\"").unwrap();
        assert_eq!(p.next_delay(2), Duration::from_secs(8));
    }
}
