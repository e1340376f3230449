//! Core types used throughout OGP.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Longest timer any protocol setting may request.
pub const MAX_TIMER_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// `now + after`, with `after` capped at [`MAX_TIMER_DURATION`].
pub(crate) fn deadline_after(now: Instant, after: Duration) -> Instant {
    now.checked_add(after.min(MAX_TIMER_DURATION)).unwrap_or(now)
}

/// Process-unique identifier of an application message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u64);

static NEXT_MESSAGE_ID: OnceLock<AtomicU64> = OnceLock::new();

impl MessageId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocate the next id for this process.
    ///
    /// The counter starts at a random point so ids from a restarted process
    /// don't land in a peer's dedup window.
    pub fn generate() -> Self {
        let counter =
            NEXT_MESSAGE_ID.get_or_init(|| AtomicU64::new(rand::random::<u64>() >> 1));
        Self(counter.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Identifier of a link within a link set, assigned at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LinkId(pub u32);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// How hard the endpoint tries to get a message across.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Sent once on every link, never acknowledged or retried.
    #[default]
    BestEffort,
    /// Retried until acknowledged, retries are exhausted or the TTL passes.
    Guaranteed,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BestEffort => write!(f, "best-effort"),
            Self::Guaranteed => write!(f, "guaranteed"),
        }
    }
}

/// An application message.
///
/// The delivery mode is a property of the submission, not of the message:
/// it decides whether the sender tracks the message for retries and is
/// never carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub payload: Bytes,
}

impl Message {
    pub fn new(id: MessageId, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Terminal outcome of a guaranteed-mode send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// The peer acknowledged the message.
    Acked,
    /// Every retry was spent without an acknowledgment.
    RetryExhausted,
    /// The time-to-live passed without an acknowledgment.
    TtlExpired,
    /// The caller withdrew the message.
    Cancelled,
}

impl DeliveryOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Acked)
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Acked => write!(f, "acked"),
            Self::RetryExhausted => write!(f, "retry-exhausted"),
            Self::TtlExpired => write!(f, "ttl-expired"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Where a guaranteed-mode send currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendState {
    Pending { retries_sent: u32 },
    Finished(DeliveryOutcome),
}

/// A finished guaranteed send, reported once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub id: MessageId,
    pub outcome: DeliveryOutcome,
    pub retries_sent: u32,
}

/// Link health classification.
///
/// Purely diagnostic: OGP sends on every open link regardless of health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkHealth {
    Healthy,
    Degraded,
    Unhealthy,
    /// The link reported itself closed and is skipped by broadcasts.
    Down,
    #[default]
    Unknown,
}

impl LinkHealth {
    pub fn is_open(self) -> bool {
        !matches!(self, Self::Down)
    }
}

impl fmt::Display for LinkHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Down => write!(f, "down"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_ids_are_unique() {
        let a = MessageId::generate();
        let b = MessageId::generate();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_message_id_display() {
        assert_eq!(MessageId(0xabc).to_string(), "0000000000000abc");
        assert_eq!(LinkId(3).to_string(), "link-3");
    }

    #[test]
    fn test_delivery_mode_serde_names() {
        let mode: DeliveryMode = toml::Value::String("guaranteed".into())
            .try_into()
            .unwrap();
        assert_eq!(mode, DeliveryMode::Guaranteed);
    }
}
