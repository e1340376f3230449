//! Retry and TTL handling for guaranteed messages.
//!
//! Each guaranteed message gets an outstanding record holding its encoded
//! fragments. [`Reliability::tick`] decides, per record, whether to
//! retransmit or give up; an acknowledgment or a cancellation resolves the
//! record early. Every record ends in exactly one [`DeliveryOutcome`].
//!
//! ```text
//!            ack                 ┌──────────┐
//!        ┌──────────────────────►│  Acked   │
//!        │                       └──────────┘
//!   ┌─────────┐  retries = 0     ┌────────────────┐
//!   │ Pending │─────────────────►│ RetryExhausted │
//!   └─────────┘                  └────────────────┘
//!     │  │ ▲   ttl passed        ┌────────────┐
//!     │  │ │  ──────────────────►│ TtlExpired │
//!     │  └─┘ retransmit          └────────────┘
//!     │      cancel              ┌───────────┐
//!     └─────────────────────────►│ Cancelled │
//!                                └───────────┘
//! ```

mod policy;
mod probes;

pub use policy::RetryPolicy;
pub use probes::{MAX_OPEN_PROBES, PROBE_WINDOW};

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::types::{deadline_after, DeliveryOutcome, DeliveryReport, LinkId, MessageId, SendState};
use probes::RoundTripProbes;

/// Number of finished sends whose outcome stays queryable.
pub const FINISHED_RETENTION: usize = 4096;

/// Reliability parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReliabilityConfig {
    pub max_retries: u32,
    pub ttl: Duration,
    pub policy: RetryPolicy,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            ttl: Duration::from_secs(1),
            policy: RetryPolicy::default(),
        }
    }
}

/// Work produced by [`Reliability::tick`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReliabilityEvent {
    /// Send these fragments again on every link.
    Retransmit {
        id: MessageId,
        fragments: Vec<Bytes>,
        /// 1 for the first retry.
        attempt: u32,
    },
    /// The record reached a terminal outcome.
    Finished(DeliveryReport),
}

#[derive(Debug)]
struct OutstandingSend {
    fragments: Vec<Bytes>,
    retries_remaining: u32,
    retries_sent: u32,
    next_retry_at: Instant,
    ttl_deadline: Instant,
    last_sent_at: Instant,
}

impl OutstandingSend {
    fn next_deadline(&self) -> Instant {
        self.next_retry_at.min(self.ttl_deadline)
    }
}

/// Retry bookkeeping for every guaranteed message in flight.
#[derive(Debug)]
pub struct Reliability {
    config: ReliabilityConfig,
    outstanding: HashMap<MessageId, OutstandingSend>,
    finished: HashMap<MessageId, DeliveryReport>,
    finished_order: VecDeque<MessageId>,
    reports: VecDeque<DeliveryReport>,
    probes: RoundTripProbes,
}

impl Reliability {
    pub fn new(config: ReliabilityConfig) -> Self {
        Self {
            config,
            outstanding: HashMap::new(),
            finished: HashMap::new(),
            finished_order: VecDeque::new(),
            reports: VecDeque::new(),
            probes: RoundTripProbes::default(),
        }
    }

    pub fn config(&self) -> &ReliabilityConfig {
        &self.config
    }

    /// Start tracking a guaranteed message that was just transmitted.
    pub fn track(&mut self, id: MessageId, fragments: Vec<Bytes>, now: Instant) {
        let record = OutstandingSend {
            fragments,
            retries_remaining: self.config.max_retries,
            retries_sent: 0,
            next_retry_at: deadline_after(now, self.config.policy.interval(0)),
            ttl_deadline: deadline_after(now, self.config.ttl),
            last_sent_at: now,
        };
        tracing::trace!(
            message_id = %id,
            fragments = record.fragments.len(),
            "Tracking guaranteed message"
        );
        self.outstanding.insert(id, record);
    }

    /// Resolve every record whose deadline has passed.
    pub fn tick(&mut self, now: Instant) -> Vec<ReliabilityEvent> {
        let mut due: Vec<(Instant, MessageId)> = self
            .outstanding
            .iter()
            .filter(|(_, record)| record.next_deadline() <= now)
            .map(|(id, record)| (record.next_deadline(), *id))
            .collect();
        due.sort_unstable();

        let mut events = Vec::with_capacity(due.len());
        for (_, id) in due {
            let Some(record) = self.outstanding.get_mut(&id) else {
                continue;
            };

            let exhausted_at =
                (record.retries_remaining == 0).then_some(record.next_retry_at);
            let ttl_passed = record.ttl_deadline <= now
                && exhausted_at.map_or(true, |at| record.ttl_deadline <= at);

            if ttl_passed {
                let report = self.finish(id, DeliveryOutcome::TtlExpired);
                events.extend(report.map(ReliabilityEvent::Finished));
            } else if record.retries_remaining == 0 {
                let report = self.finish(id, DeliveryOutcome::RetryExhausted);
                events.extend(report.map(ReliabilityEvent::Finished));
            } else {
                record.retries_remaining -= 1;
                record.retries_sent += 1;
                record.last_sent_at = now;
                record.next_retry_at =
                    deadline_after(now, self.config.policy.interval(record.retries_sent));

                tracing::debug!(
                    message_id = %id,
                    attempt = record.retries_sent,
                    remaining = record.retries_remaining,
                    "Retransmitting"
                );
                events.push(ReliabilityEvent::Retransmit {
                    id,
                    fragments: record.fragments.clone(),
                    attempt: record.retries_sent,
                });
            }
        }
        events
    }

    /// Resolve a record as acknowledged. Unknown or finished ids are ignored.
    pub fn acknowledge(&mut self, id: MessageId, now: Instant) -> bool {
        let Some(last_sent_at) = self.outstanding.get(&id).map(|r| r.last_sent_at) else {
            return false;
        };
        self.probes.open(id, last_sent_at, now);
        self.finish(id, DeliveryOutcome::Acked).is_some()
    }

    /// Note an ack copy arriving on `link`; returns an RTT sample for the
    /// first copy on each link.
    pub fn probe_ack(&mut self, id: MessageId, link: LinkId, now: Instant) -> Option<Duration> {
        self.probes.answer(id, link, now)
    }

    /// Close probe windows that have passed, returning per-link delivery
    /// samples.
    pub fn expire_probes(&mut self, now: Instant, links: &[LinkId]) -> Vec<(LinkId, bool)> {
        self.probes.expire(now, links)
    }

    /// Stop retransmitting a message. Idempotent.
    pub fn cancel(&mut self, id: MessageId) -> bool {
        self.finish(id, DeliveryOutcome::Cancelled).is_some()
    }

    pub fn state(&self, id: MessageId) -> Option<SendState> {
        if let Some(record) = self.outstanding.get(&id) {
            return Some(SendState::Pending {
                retries_sent: record.retries_sent,
            });
        }
        self.finished
            .get(&id)
            .map(|report| SendState::Finished(report.outcome))
    }

    /// Take all terminal reports produced since the last call.
    pub fn take_reports(&mut self) -> Vec<DeliveryReport> {
        self.reports.drain(..).collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let records = self.outstanding.values().map(OutstandingSend::next_deadline);
        records.chain(self.probes.next_deadline()).min()
    }

    /// Messages still awaiting an outcome.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    fn finish(&mut self, id: MessageId, outcome: DeliveryOutcome) -> Option<DeliveryReport> {
        let record = self.outstanding.remove(&id)?;
        let report = DeliveryReport {
            id,
            outcome,
            retries_sent: record.retries_sent,
        };

        match outcome {
            DeliveryOutcome::Acked | DeliveryOutcome::Cancelled => {
                tracing::debug!(message_id = %id, outcome = ?outcome, retries = record.retries_sent, "Send finished");
            }
            DeliveryOutcome::RetryExhausted | DeliveryOutcome::TtlExpired => {
                tracing::warn!(message_id = %id, outcome = ?outcome, retries = record.retries_sent, "Guaranteed send failed");
            }
        }

        if self.finished_order.len() >= FINISHED_RETENTION {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
        self.finished.insert(id, report);
        self.finished_order.push_back(id);

        if self.reports.len() >= FINISHED_RETENTION {
            self.reports.pop_front();
        }
        self.reports.push_back(report);

        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn reliability(max_retries: u32, interval: u64, ttl: u64) -> Reliability {
        Reliability::new(ReliabilityConfig {
            max_retries,
            ttl: ms(ttl),
            policy: RetryPolicy::Fixed { interval: ms(interval) },
        })
    }

    fn frags() -> Vec<Bytes> {
        vec![Bytes::from_static(b"frag")]
    }

    /// Step the clock in 1 ms increments, collecting every event.
    fn run(rel: &mut Reliability, start: Instant, until: u64) -> Vec<(u64, ReliabilityEvent)> {
        let mut events = Vec::new();
        for t in 0..=until {
            for event in rel.tick(start + ms(t)) {
                events.push((t, event));
            }
        }
        events
    }

    #[test]
    fn test_retry_exhausted_after_exact_retries() {
        let start = Instant::now();
        let mut rel = reliability(3, 100, 1000);
        let id = MessageId(1);
        rel.track(id, frags(), start);

        let events = run(&mut rel, start, 1000);
        let retransmits: Vec<u64> = events
            .iter()
            .filter(|(_, e)| matches!(e, ReliabilityEvent::Retransmit { .. }))
            .map(|(t, _)| *t)
            .collect();
        assert_eq!(retransmits, vec![100, 200, 300]);

        let finished: Vec<_> = events
            .iter()
            .filter_map(|(t, e)| match e {
                ReliabilityEvent::Finished(report) => Some((*t, *report)),
                _ => None,
            })
            .collect();
        assert_eq!(
            finished,
            vec![(
                400,
                DeliveryReport {
                    id,
                    outcome: DeliveryOutcome::RetryExhausted,
                    retries_sent: 3
                }
            )]
        );
        assert_eq!(rel.state(id), Some(SendState::Finished(DeliveryOutcome::RetryExhausted)));
    }

    #[test]
    fn test_ttl_shorter_than_schedule() {
        let start = Instant::now();
        let mut rel = reliability(3, 100, 250);
        let id = MessageId(2);
        rel.track(id, frags(), start);

        let events = run(&mut rel, start, 1000);
        let outcomes: Vec<_> = events
            .iter()
            .filter_map(|(t, e)| match e {
                ReliabilityEvent::Finished(r) => Some((*t, r.outcome, r.retries_sent)),
                _ => None,
            })
            .collect();
        assert_eq!(outcomes, vec![(250, DeliveryOutcome::TtlExpired, 2)]);
    }

    #[test]
    fn test_ttl_wins_on_tie() {
        let start = Instant::now();
        let mut rel = reliability(3, 100, 300);
        let id = MessageId(3);
        rel.track(id, frags(), start);

        let events = rel.tick(start + ms(300));
        // One coarse tick: no catch-up retransmissions, the TTL has passed.
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            ReliabilityEvent::Finished(DeliveryReport { outcome: DeliveryOutcome::TtlExpired, .. })
        ));
    }

    #[test]
    fn test_exhaustion_before_late_tick() {
        let start = Instant::now();
        let mut rel = reliability(0, 100, 1000);
        let id = MessageId(4);
        rel.track(id, frags(), start);

        // Exhaustion became due at 100ms, before the TTL; a late tick still
        // reports the earlier outcome.
        let events = rel.tick(start + ms(2000));
        assert!(matches!(
            events.as_slice(),
            [ReliabilityEvent::Finished(DeliveryReport { outcome: DeliveryOutcome::RetryExhausted, .. })]
        ));
    }

    #[test]
    fn test_acknowledge_resolves_once() {
        let start = Instant::now();
        let mut rel = reliability(3, 100, 1000);
        let id = MessageId(5);
        rel.track(id, frags(), start);
        rel.tick(start + ms(100));

        assert!(rel.acknowledge(id, start + ms(150)));
        assert!(!rel.acknowledge(id, start + ms(160)));
        assert!(!rel.cancel(id));
        assert!(run(&mut rel, start, 1000)
            .iter()
            .all(|(_, e)| !matches!(e, ReliabilityEvent::Retransmit { .. })));

        let reports = rel.take_reports();
        assert_eq!(
            reports,
            vec![DeliveryReport {
                id,
                outcome: DeliveryOutcome::Acked,
                retries_sent: 1
            }]
        );
        assert!(rel.take_reports().is_empty());
    }

    #[test]
    fn test_ack_for_unknown_id_ignored() {
        let mut rel = reliability(3, 100, 1000);
        assert!(!rel.acknowledge(MessageId(99), Instant::now()));
        assert_eq!(rel.state(MessageId(99)), None);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let start = Instant::now();
        let mut rel = reliability(3, 100, 1000);
        let id = MessageId(6);
        rel.track(id, frags(), start);

        assert!(rel.cancel(id));
        assert!(!rel.cancel(id));
        assert!(rel.tick(start + ms(5000)).is_empty());
        assert_eq!(rel.state(id), Some(SendState::Finished(DeliveryOutcome::Cancelled)));
        assert_eq!(rel.outstanding(), 0);
    }

    #[test]
    fn test_pending_state_counts_retries() {
        let start = Instant::now();
        let mut rel = reliability(3, 100, 1000);
        let id = MessageId(7);
        rel.track(id, frags(), start);
        assert_eq!(rel.state(id), Some(SendState::Pending { retries_sent: 0 }));

        rel.tick(start + ms(100));
        assert_eq!(rel.state(id), Some(SendState::Pending { retries_sent: 1 }));
        assert_eq!(rel.next_deadline(), Some(start + ms(200)));
    }

    #[test]
    fn test_huge_ttl_does_not_overflow() {
        let start = Instant::now();
        let mut rel = Reliability::new(ReliabilityConfig {
            max_retries: 1,
            ttl: Duration::MAX,
            policy: RetryPolicy::Fixed { interval: Duration::MAX },
        });
        let id = MessageId(9);
        rel.track(id, frags(), start);

        assert_eq!(rel.next_deadline(), Some(start + crate::types::MAX_TIMER_DURATION));
        assert!(rel.tick(start + ms(1000)).is_empty());
    }

    #[test]
    fn test_ack_probe_samples() {
        let start = Instant::now();
        let mut rel = reliability(3, 100, 1000);
        let id = MessageId(8);
        rel.track(id, frags(), start);

        let at = start + ms(40);
        assert!(rel.acknowledge(id, at));
        assert_eq!(rel.probe_ack(id, LinkId(0), at), Some(ms(40)));
        assert_eq!(rel.probe_ack(id, LinkId(1), start + ms(60)), Some(ms(60)));

        let samples = rel.expire_probes(at + PROBE_WINDOW, &[LinkId(0), LinkId(1), LinkId(2)]);
        assert_eq!(
            samples,
            vec![(LinkId(0), true), (LinkId(1), true), (LinkId(2), false)]
        );
    }
}
