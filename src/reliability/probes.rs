//! Per-link round-trip probes piggybacked on acknowledgments.
//!
//! The receiver acks a completed message on every link, so each acked
//! message doubles as a probe of all links at once: the first ack copy per
//! link gives that link an RTT sample, and a link whose copy never shows up
//! within the probe window gets a loss sample.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use crate::types::{LinkId, MessageId};

/// How long ack copies are collected after the first one arrives.
pub const PROBE_WINDOW: Duration = Duration::from_secs(1);

/// Upper bound on concurrently open probes.
pub const MAX_OPEN_PROBES: usize = 1024;

#[derive(Debug)]
struct Probe {
    sent_at: Instant,
    closes_at: Instant,
    answered: Vec<LinkId>,
}

#[derive(Debug, Default)]
pub(crate) struct RoundTripProbes {
    open: HashMap<MessageId, Probe>,
    order: VecDeque<MessageId>,
}

impl RoundTripProbes {
    /// Start collecting ack copies for `id`, last transmitted at `sent_at`.
    pub fn open(&mut self, id: MessageId, sent_at: Instant, now: Instant) {
        if self.open.contains_key(&id) {
            return;
        }
        while self.open.len() >= MAX_OPEN_PROBES {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.open.remove(&oldest);
                }
                None => break,
            }
        }
        self.open.insert(
            id,
            Probe {
                sent_at,
                closes_at: now + PROBE_WINDOW,
                answered: Vec::new(),
            },
        );
        self.order.push_back(id);
    }

    /// Note an ack copy for `id` arriving on `link`. Returns an RTT sample for
    /// the first copy per link.
    pub fn answer(&mut self, id: MessageId, link: LinkId, now: Instant) -> Option<Duration> {
        let probe = self.open.get_mut(&id)?;
        if now >= probe.closes_at || probe.answered.contains(&link) {
            return None;
        }
        probe.answered.push(link);
        Some(now.saturating_duration_since(probe.sent_at))
    }

    /// Close every probe whose window has passed. Yields one sample per
    /// `(probe, link)`: whether that link answered.
    pub fn expire(&mut self, now: Instant, links: &[LinkId]) -> Vec<(LinkId, bool)> {
        let mut samples = Vec::new();
        while let Some(&id) = self.order.front() {
            let Some(probe) = self.open.get(&id) else {
                self.order.pop_front();
                continue;
            };
            if probe.closes_at > now {
                break;
            }
            samples.extend(links.iter().map(|link| (*link, probe.answered.contains(link))));
            self.open.remove(&id);
            self.order.pop_front();
        }
        samples
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.order
            .iter()
            .find_map(|id| self.open.get(id))
            .map(|probe| probe.closes_at)
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }
}
