//! Retransmission schedules.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::MAX_TIMER_DURATION;

/// How long to wait before each retransmission of a guaranteed message.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Same delay before every retry.
    Fixed {
        #[serde(with = "humantime_serde")]
        interval: Duration,
    },
    /// Delay grows by `multiplier` after every retry, capped at `max`.
    Exponential {
        #[serde(with = "humantime_serde")]
        initial: Duration,
        multiplier: f64,
        #[serde(with = "humantime_serde")]
        max: Duration,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Fixed {
            interval: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`, measured from the previous
    /// transmission.
    pub fn interval(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed { interval } => interval,
            Self::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let factor = multiplier.max(1.0).powi(attempt.min(64) as i32);
                let secs = initial.as_secs_f64() * factor;
                if secs.is_finite() && secs < max.as_secs_f64() {
                    Duration::from_secs_f64(secs)
                } else {
                    max
                }
            }
        }
    }

    /// Whether every interval is non-zero and at most [`MAX_TIMER_DURATION`].
    pub fn is_valid(&self) -> bool {
        match *self {
            Self::Fixed { interval } => !interval.is_zero() && interval <= MAX_TIMER_DURATION,
            Self::Exponential {
                initial,
                multiplier,
                max,
            } => {
                !initial.is_zero()
                    && multiplier.is_finite()
                    && multiplier >= 1.0
                    && max >= initial
                    && max <= MAX_TIMER_DURATION
            }
        }
    }
}
