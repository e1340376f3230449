//! The link set: broadcast to every link, receive from all of them.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::select_all;
use tokio::time::{sleep_until, Instant};

use super::stats::{LinkMonitor, LinkStats};
use crate::error::LinkError;
use crate::link::Link;
use crate::types::{deadline_after, LinkHealth, LinkId};

/// Upper bound on datagrams taken from one link per drain pass, so a busy
/// link cannot starve the others.
pub const MAX_DRAIN_PER_LINK: usize = 64;

/// A datagram and the link it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub link: LinkId,
    pub payload: bytes::Bytes,
}

/// Per-link outcome of one broadcast.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub results: Vec<(LinkId, Result<(), LinkError>)>,
}

impl BroadcastReport {
    /// Number of links that accepted the datagram.
    pub fn sent(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_ok()).count()
    }

    /// Number of links that refused the datagram.
    pub fn failed(&self) -> usize {
        self.results.len() - self.sent()
    }

    /// True if no link was attempted.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Description of a registered link.
#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub id: LinkId,
    pub kind: &'static str,
    pub label: String,
    pub mtu: usize,
    pub stats: LinkStats,
}

struct LinkEntry {
    link: Box<dyn Link>,
    monitor: LinkMonitor,
}

/// The set of links to one peer.
///
/// Every datagram goes out on every open link. Received datagrams are
/// returned tagged with their link; the set itself keeps no per-message
/// state.
pub struct LinkSet {
    links: BTreeMap<LinkId, LinkEntry>,
    next_id: u32,
    inbound: Vec<Datagram>,
}

impl Default for LinkSet {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkSet {
    pub fn new() -> Self {
        Self {
            links: BTreeMap::new(),
            next_id: 0,
            inbound: Vec::new(),
        }
    }

    /// Add a link. It takes part in every broadcast from now on.
    pub fn register_link(&mut self, link: Box<dyn Link>) -> LinkId {
        let id = LinkId(self.next_id);
        self.next_id += 1;

        tracing::info!(link = %id, label = %link.label(), mtu = link.mtu(), "Link registered");

        self.links.insert(
            id,
            LinkEntry {
                link,
                monitor: LinkMonitor::default(),
            },
        );
        id
    }

    /// Remove a link, handing it back to the caller.
    pub fn deregister_link(&mut self, id: LinkId) -> Option<Box<dyn Link>> {
        let entry = self.links.remove(&id)?;
        tracing::info!(link = %id, label = %entry.link.label(), "Link deregistered");
        Some(entry.link)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn contains(&self, id: LinkId) -> bool {
        self.links.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<LinkId> {
        self.links.keys().copied().collect()
    }

    /// Number of links that are not down.
    pub fn open_count(&self) -> usize {
        self.links.values().filter(|e| e.monitor.is_open()).count()
    }

    pub fn links(&self) -> Vec<LinkInfo> {
        self.links
            .iter()
            .map(|(id, entry)| LinkInfo {
                id: *id,
                kind: entry.link.kind(),
                label: entry.link.label(),
                mtu: entry.link.mtu(),
                stats: entry.monitor.snapshot(),
            })
            .collect()
    }

    pub fn stats(&self, id: LinkId) -> Option<LinkStats> {
        self.links.get(&id).map(|e| e.monitor.snapshot())
    }

    pub fn health(&self, id: LinkId) -> Option<LinkHealth> {
        self.links.get(&id).map(|e| e.monitor.health())
    }

    /// Send one datagram on every open link.
    ///
    /// Failures are per link and never stop the other links from being
    /// tried.
    pub async fn broadcast(&mut self, datagram: &[u8]) -> BroadcastReport {
        let now = Instant::now();
        let mut report = BroadcastReport {
            results: Vec::with_capacity(self.links.len()),
        };

        for (id, entry) in &mut self.links {
            if !entry.monitor.is_open() {
                continue;
            }

            let mtu = entry.link.mtu();
            let result = if datagram.len() > mtu {
                Err(LinkError::MtuExceeded {
                    size: datagram.len(),
                    max: mtu,
                })
            } else {
                entry.link.send(datagram).await
            };

            match &result {
                Ok(()) => entry.monitor.record_send(datagram.len(), now),
                Err(e) => {
                    tracing::debug!(link = %id, error = %e, "Link send failed");
                    entry.monitor.record_send_failure(e);
                    if !entry.monitor.is_open() {
                        tracing::warn!(link = %id, error = %e, "Link is down");
                    }
                }
            }
            report.results.push((*id, result));
        }

        // Simulated links may have zero-delay datagrams queued.
        self.service(now).await;
        report
    }

    /// Collect received datagrams, waiting up to `timeout` if none are ready.
    ///
    /// Waits at most once; an empty result means the timeout passed or a
    /// link timer fired with nothing to deliver yet.
    pub async fn poll(&mut self, timeout: Duration) -> Inbound<'_> {
        let start = Instant::now();
        let deadline = deadline_after(start, timeout);

        self.service(start).await;
        self.drain_ready(start);

        if self.inbound.is_empty() && !timeout.is_zero() {
            let wake_at = self
                .next_deadline()
                .map_or(deadline, |d| d.min(deadline));
            self.wait_readable(wake_at).await;

            let now = Instant::now();
            self.service(now).await;
            self.drain_ready(now);
        }

        Inbound {
            inner: self.inbound.drain(..),
        }
    }

    /// Earliest instant at which some link has timed work.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.links
            .values()
            .filter(|e| e.monitor.is_open())
            .filter_map(|e| e.link.next_deadline())
            .min()
    }

    /// Feed a round-trip sample for `id`.
    pub fn record_rtt(&mut self, id: LinkId, rtt: Duration) {
        if let Some(entry) = self.links.get_mut(&id) {
            entry.monitor.record_rtt(rtt);
            tracing::trace!(link = %id, rtt = ?rtt, "RTT sample");
        }
    }

    /// Record whether a probe was answered on `id`.
    pub fn record_probe(&mut self, id: LinkId, delivered: bool) {
        if let Some(entry) = self.links.get_mut(&id) {
            entry.monitor.record_probe(delivered);
        }
    }

    async fn service(&mut self, now: Instant) {
        for (id, entry) in &mut self.links {
            if !entry.monitor.is_open() {
                continue;
            }
            if let Err(e) = entry.link.service(now).await {
                tracing::debug!(link = %id, error = %e, "Link service failed");
                entry.monitor.record_send_failure(&e);
            }
        }
    }

    fn drain_ready(&mut self, now: Instant) {
        for (id, entry) in &mut self.links {
            if !entry.monitor.is_open() {
                continue;
            }

            for _ in 0..MAX_DRAIN_PER_LINK {
                match entry.link.try_recv() {
                    Ok(Some(payload)) => {
                        entry.monitor.record_recv(payload.len(), now);
                        self.inbound.push(Datagram { link: *id, payload });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(link = %id, error = %e, "Link receive failed");
                        entry.monitor.record_receive_failure(&e);
                        if !entry.monitor.is_open() {
                            tracing::warn!(link = %id, error = %e, "Link is down");
                        }
                        break;
                    }
                }
            }
        }
    }

    /// Wait until any open link is readable or `until` passes.
    async fn wait_readable(&mut self, until: Instant) {
        let (ids, waits): (Vec<LinkId>, Vec<_>) = self
            .links
            .iter()
            .filter(|(_, e)| e.monitor.is_open())
            .map(|(id, e)| (*id, e.link.readable()))
            .unzip();

        if waits.is_empty() {
            sleep_until(until).await;
            return;
        }

        let failed = tokio::select! {
            (result, index, _) = select_all(waits) => result.err().map(|e| (ids[index], e)),
            () = sleep_until(until) => None,
        };

        if let Some((id, e)) = failed {
            if let Some(entry) = self.links.get_mut(&id) {
                tracing::debug!(link = %id, error = %e, "Link readiness failed");
                entry.monitor.record_receive_failure(&e);
            }
        }
    }
}

/// Draining iterator over datagrams returned by [`LinkSet::poll`].
pub struct Inbound<'a> {
    inner: std::vec::Drain<'a, Datagram>,
}

impl Iterator for Inbound<'_> {
    type Item = Datagram;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Inbound<'_> {}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;

    use super::*;
    use crate::link::{LinkSimulator, MemoryLink, SimulatorConfig};

    /// Link whose sends always fail, recording the attempts.
    struct FailingLink {
        attempts: Arc<Mutex<u32>>,
        error: LinkError,
    }

    #[async_trait]
    impl Link for FailingLink {
        fn mtu(&self) -> usize {
            1500
        }

        async fn send(&self, _datagram: &[u8]) -> Result<(), LinkError> {
            *self.attempts.lock() += 1;
            Err(self.error.clone())
        }

        fn try_recv(&self) -> Result<Option<Bytes>, LinkError> {
            Ok(None)
        }

        async fn readable(&self) -> Result<(), LinkError> {
            std::future::pending().await
        }

        fn kind(&self) -> &'static str {
            "failing"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_reaches_every_link() {
        let mut set = LinkSet::new();
        let (a1, b1) = MemoryLink::pair(1500);
        let (a2, b2) = MemoryLink::pair(1500);
        set.register_link(Box::new(a1));
        set.register_link(Box::new(a2));

        let report = set.broadcast(b"hello").await;
        assert_eq!(report.sent(), 2);
        assert_eq!(report.failed(), 0);
        assert_eq!(b1.queued(), 1);
        assert_eq!(b2.queued(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_failure_is_per_link() {
        let mut set = LinkSet::new();
        let attempts = Arc::new(Mutex::new(0));
        let bad = set.register_link(Box::new(FailingLink {
            attempts: Arc::clone(&attempts),
            error: LinkError::SendFailed("unreachable".into()),
        }));
        let (good, peer) = MemoryLink::pair(1500);
        set.register_link(Box::new(good));

        let report = set.broadcast(b"x").await;
        assert_eq!(report.sent(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(peer.queued(), 1);
        assert_eq!(set.stats(bad).unwrap().send_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_link_is_skipped() {
        let mut set = LinkSet::new();
        let attempts = Arc::new(Mutex::new(0));
        let closed = set.register_link(Box::new(FailingLink {
            attempts: Arc::clone(&attempts),
            error: LinkError::Closed,
        }));

        set.broadcast(b"one").await;
        set.broadcast(b"two").await;

        assert_eq!(*attempts.lock(), 1);
        assert_eq!(set.health(closed), Some(LinkHealth::Down));
        assert_eq!(set.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mtu_exceeded_on_small_link_only() {
        let mut set = LinkSet::new();
        let (small, _p1) = MemoryLink::pair(4);
        let (large, p2) = MemoryLink::pair(1500);
        let small = set.register_link(Box::new(small));
        set.register_link(Box::new(large));

        let report = set.broadcast(b"eight by").await;
        assert_eq!(report.sent(), 1);
        let (id, result) = &report.results[0];
        assert_eq!(*id, small);
        assert!(matches!(result, Err(LinkError::MtuExceeded { size: 8, max: 4 })));
        assert_eq!(p2.queued(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_tags_datagrams_with_link() {
        let mut set = LinkSet::new();
        let (a1, b1) = MemoryLink::pair(1500);
        let (a2, b2) = MemoryLink::pair(1500);
        let id1 = set.register_link(Box::new(b1));
        let id2 = set.register_link(Box::new(b2));

        a1.send(b"via one").await.unwrap();
        a2.send(b"via two").await.unwrap();

        let got: Vec<_> = set.poll(Duration::from_millis(10)).await.collect();
        assert_eq!(
            got,
            vec![
                Datagram { link: id1, payload: Bytes::from_static(b"via one") },
                Datagram { link: id2, payload: Bytes::from_static(b"via two") },
            ]
        );
        assert_eq!(set.stats(id1).unwrap().datagrams_received, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_empty() {
        let mut set = LinkSet::new();
        let (a, _b) = MemoryLink::pair(1500);
        set.register_link(Box::new(a));

        let start = Instant::now();
        let got = set.poll(Duration::from_millis(50)).await.count();
        assert_eq!(got, 0);
        assert!(Instant::now() >= start + Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_wakes_for_simulated_delay() {
        let mut sender = LinkSet::new();
        let mut receiver = LinkSet::new();
        let (a, b) = MemoryLink::pair(1500);
        let latency = Duration::from_millis(20);
        sender.register_link(Box::new(LinkSimulator::new(
            a,
            SimulatorConfig::lossless().with_latency(latency, latency),
        )));
        receiver.register_link(Box::new(b));

        sender.broadcast(b"delayed").await;
        assert!(sender.next_deadline().is_some());

        // The sender's poll sleeps until the release instant and flushes it.
        assert_eq!(sender.poll(Duration::from_secs(1)).await.count(), 0);
        let got: Vec<_> = receiver.poll(Duration::from_millis(1)).await.collect();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload, Bytes::from_static(b"delayed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deregister_returns_link() {
        let mut set = LinkSet::new();
        let (a, _b) = MemoryLink::pair(1500);
        let id = set.register_link(Box::new(a));

        let link = set.deregister_link(id).unwrap();
        assert_eq!(link.kind(), "memory");
        assert!(set.deregister_link(id).is_none());
        assert!(set.is_empty());
    }
}
