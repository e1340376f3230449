//! The OGP endpoint.
//!
//! An [`Endpoint`] owns everything: the link set, the fragmenter and
//! reassembler, and the reliability layer. All protocol work happens inside
//! its `&mut self` methods on the caller's task; the only place it ever
//! waits is the link set's multiplexed readiness wait, bounded by the
//! nearest timer.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::config::{Config, ProtocolConfig};
use crate::error::{Error, ProtocolError, Result};
use crate::link::{Link, LinkSimulator, UdpLink};
use crate::multipath::{Datagram, LinkInfo, LinkSet};
use crate::protocol::{Accepted, Fragment, Fragmenter, Reassembler, MAX_MESSAGE_SIZE};
use crate::reliability::{Reliability, ReliabilityEvent};
use crate::types::{
    deadline_after, DeliveryMode, DeliveryReport, LinkId, Message, MessageId, SendState,
};

/// Endpoint counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    pub messages_sent: u64,
    pub messages_delivered: u64,
    /// Fragments handed to the link set, counted once per fragment rather
    /// than once per link.
    pub fragments_sent: u64,
    pub fragments_received: u64,
    pub malformed: u64,
    pub checksum_failures: u64,
    pub duplicates: u64,
    pub retransmissions: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
    pub reassembly_expired: u64,
    /// Guaranteed messages awaiting an outcome.
    pub outstanding: usize,
    /// Partially received messages.
    pub buffered: usize,
}

#[derive(Debug, Default)]
struct Counters {
    messages_sent: u64,
    messages_delivered: u64,
    fragments_sent: u64,
    fragments_received: u64,
    malformed: u64,
    retransmissions: u64,
    acks_sent: u64,
    acks_received: u64,
}

/// One side of an OGP association.
pub struct Endpoint {
    config: ProtocolConfig,
    links: LinkSet,
    fragmenter: Fragmenter,
    reassembler: Reassembler,
    reliability: Reliability,
    delivered: VecDeque<Message>,
    counters: Counters,
}

impl Endpoint {
    /// Create an endpoint with no links.
    pub fn new(config: ProtocolConfig) -> Self {
        tracing::debug!(
            max_payload = config.max_payload_size,
            max_retries = config.max_retries,
            ttl = ?config.ttl,
            "Endpoint created"
        );

        Self {
            fragmenter: Fragmenter::new(config.max_payload_size),
            reassembler: Reassembler::new(config.reassembler()),
            reliability: Reliability::new(config.reliability()),
            links: LinkSet::new(),
            delivered: VecDeque::new(),
            counters: Counters::default(),
            config,
        }
    }

    /// Create an endpoint and open every configured UDP link.
    pub async fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let mut endpoint = Self::new(config.protocol.clone());

        for link_config in &config.links {
            let udp = UdpLink::bind(link_config.bind, link_config.peer, link_config.mtu).await?;
            let link: Box<dyn Link> = match &link_config.simulator {
                Some(simulator) => Box::new(LinkSimulator::new(udp, simulator.clone())),
                None => Box::new(udp),
            };
            let id = endpoint.add_link(link);
            tracing::info!(link = %id, name = %link_config.name, "Configured link up");
        }

        Ok(endpoint)
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn add_link(&mut self, link: Box<dyn Link>) -> LinkId {
        let min_datagram = self.fragmenter.max_payload_size() + crate::protocol::HEADER_SIZE;
        if link.mtu() < min_datagram {
            tracing::warn!(
                mtu = link.mtu(),
                needed = min_datagram,
                "Link MTU is below the largest fragment; full fragments will fail on it"
            );
        }
        self.links.register_link(link)
    }

    pub fn remove_link(&mut self, id: LinkId) -> Result<Box<dyn Link>> {
        self.links.deregister_link(id).ok_or(Error::LinkNotFound(id))
    }

    pub fn links(&self) -> Vec<LinkInfo> {
        self.links.links()
    }

    /// Submit a message. It is transmitted on every link before this
    /// returns; guaranteed messages are also retried until acknowledged.
    ///
    /// Link failures never fail the send. The only error is a payload
    /// above 64 KiB, in which case nothing is transmitted.
    pub async fn send(&mut self, payload: impl Into<Bytes>, mode: DeliveryMode) -> Result<MessageId> {
        let payload = payload.into();
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let message = Message::new(MessageId::generate(), payload);
        let encoded: Vec<Bytes> = self
            .fragmenter
            .fragment(&message)?
            .iter()
            .map(Fragment::encode)
            .collect();

        if self.links.is_empty() {
            tracing::warn!(message_id = %message.id, "No links registered; message not transmitted");
        }

        let now = Instant::now();
        for datagram in &encoded {
            let report = self.links.broadcast(datagram).await;
            if !report.is_empty() && report.sent() == 0 {
                tracing::debug!(message_id = %message.id, "Fragment failed on every link");
            }
            self.counters.fragments_sent += 1;
        }
        self.counters.messages_sent += 1;

        tracing::trace!(
            message_id = %message.id,
            len = message.len(),
            fragments = encoded.len(),
            mode = %mode,
            "Message sent"
        );

        if mode == DeliveryMode::Guaranteed {
            self.reliability.track(message.id, encoded, now);
        }

        Ok(message.id)
    }

    /// Run the endpoint until at least one message has been delivered or
    /// `timeout` passes. Messages come out in no particular order.
    pub async fn poll_received(&mut self, timeout: Duration) -> std::collections::vec_deque::Drain<'_, Message> {
        let deadline = deadline_after(Instant::now(), timeout);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.drive(remaining).await;
            if !self.delivered.is_empty() || remaining.is_zero() {
                break;
            }
        }
        self.delivered.drain(..)
    }

    /// One pass of the event loop: wait for datagrams (at most `timeout`,
    /// less if a timer is due sooner), process them, then run due timers.
    ///
    /// Delivered messages are kept for the next `poll_received`.
    pub async fn drive(&mut self, timeout: Duration) {
        let start = Instant::now();
        let wait = match self.next_timer() {
            Some(at) => timeout.min(at.saturating_duration_since(start)),
            None => timeout,
        };

        let datagrams: Vec<Datagram> = self.links.poll(wait).await.collect();

        let now = Instant::now();
        let mut acks = Vec::new();
        for datagram in datagrams {
            self.handle_datagram(datagram, now, &mut acks);
        }
        for id in acks {
            self.send_ack(id).await;
        }

        self.run_timers(now).await;
    }

    /// Stop retransmitting a guaranteed message. Returns false if it had
    /// already finished or was never tracked.
    pub fn cancel(&mut self, id: MessageId) -> bool {
        self.reliability.cancel(id)
    }

    /// Current state of a guaranteed send. `None` for best-effort sends and
    /// for outcomes old enough to have been forgotten.
    pub fn send_state(&self, id: MessageId) -> Option<SendState> {
        self.reliability.state(id)
    }

    /// Terminal outcomes reached since the last call.
    pub fn poll_outcomes(&mut self) -> Vec<DeliveryReport> {
        self.reliability.take_reports()
    }

    pub fn stats(&self) -> EndpointStats {
        let reassembly = self.reassembler.stats();
        EndpointStats {
            messages_sent: self.counters.messages_sent,
            messages_delivered: self.counters.messages_delivered,
            fragments_sent: self.counters.fragments_sent,
            fragments_received: self.counters.fragments_received,
            malformed: self.counters.malformed,
            checksum_failures: reassembly.checksum_failures,
            duplicates: reassembly.duplicates,
            retransmissions: self.counters.retransmissions,
            acks_sent: self.counters.acks_sent,
            acks_received: self.counters.acks_received,
            reassembly_expired: reassembly.expired + reassembly.evicted,
            outstanding: self.reliability.outstanding(),
            buffered: self.reassembler.buffered_len(),
        }
    }

    fn next_timer(&self) -> Option<Instant> {
        match (self.reliability.next_deadline(), self.reassembler.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn handle_datagram(&mut self, datagram: Datagram, now: Instant, acks: &mut Vec<MessageId>) {
        let fragment = match Fragment::decode(&datagram.payload) {
            Ok(fragment) => fragment,
            Err(ProtocolError::ChecksumMismatch) => {
                self.reassembler.record_checksum_failure();
                tracing::debug!(link = %datagram.link, "Dropping datagram with bad checksum");
                return;
            }
            Err(e) => {
                self.counters.malformed += 1;
                tracing::debug!(link = %datagram.link, error = %e, "Dropping malformed datagram");
                return;
            }
        };

        let id = fragment.message_id;

        if fragment.is_ack() {
            self.counters.acks_received += 1;
            if self.reliability.acknowledge(id, now) {
                tracing::trace!(message_id = %id, link = %datagram.link, "Acknowledged");
            }
            if let Some(rtt) = self.reliability.probe_ack(id, datagram.link, now) {
                self.links.record_rtt(datagram.link, rtt);
            }
            return;
        }

        self.counters.fragments_received += 1;
        match self.reassembler.accept(fragment, now) {
            Accepted::Complete(message) => {
                tracing::trace!(
                    message_id = %id,
                    link = %datagram.link,
                    len = message.len(),
                    "Message delivered"
                );
                self.counters.messages_delivered += 1;
                self.delivered.push_back(message);
                acks.push(id);
            }
            Accepted::Duplicate { reack: true } => acks.push(id),
            Accepted::Pending | Accepted::Duplicate { reack: false } | Accepted::Rejected => {}
        }
    }

    async fn send_ack(&mut self, id: MessageId) {
        let frame = Fragment::ack(id).encode();
        self.links.broadcast(&frame).await;
        self.counters.acks_sent += 1;
    }

    async fn run_timers(&mut self, now: Instant) {
        self.reassembler.expire(now);

        for event in self.reliability.tick(now) {
            match event {
                ReliabilityEvent::Retransmit { fragments, .. } => {
                    for datagram in &fragments {
                        self.links.broadcast(datagram).await;
                    }
                    self.counters.retransmissions += 1;
                }
                ReliabilityEvent::Finished(_) => {}
            }
        }

        let ids = self.links.ids();
        for (link, delivered) in self.reliability.expire_probes(now, &ids) {
            self.links.record_probe(link, delivered);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MemoryLink;
    use crate::types::DeliveryOutcome;

    fn pair() -> (Endpoint, Endpoint) {
        let mut a = Endpoint::new(ProtocolConfig::default());
        let mut b = Endpoint::new(ProtocolConfig::default());
        let (la, lb) = MemoryLink::pair(1500);
        a.add_link(Box::new(la));
        b.add_link(Box::new(lb));
        (a, b)
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_and_receive() {
        let (mut a, mut b) = pair();
        let id = a.send(&b"hello"[..], DeliveryMode::BestEffort).await.unwrap();

        let got: Vec<_> = b.poll_received(Duration::from_millis(100)).await.collect();
        assert_eq!(got, vec![Message::new(id, &b"hello"[..])]);
        assert_eq!(b.stats().messages_delivered, 1);
        assert_eq!(b.stats().acks_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guaranteed_is_acked() {
        let (mut a, mut b) = pair();
        let id = a.send(&b"cmd"[..], DeliveryMode::Guaranteed).await.unwrap();
        assert_eq!(a.send_state(id), Some(SendState::Pending { retries_sent: 0 }));

        assert_eq!(b.poll_received(Duration::from_millis(100)).await.count(), 1);
        a.drive(Duration::from_millis(10)).await;

        assert_eq!(a.send_state(id), Some(SendState::Finished(DeliveryOutcome::Acked)));
        assert_eq!(
            a.poll_outcomes(),
            vec![DeliveryReport {
                id,
                outcome: DeliveryOutcome::Acked,
                retries_sent: 0
            }]
        );
        assert_eq!(a.stats().retransmissions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_best_effort_has_no_state() {
        let (mut a, _b) = pair();
        let id = a.send(&b"fire"[..], DeliveryMode::BestEffort).await.unwrap();
        assert_eq!(a.send_state(id), None);
        assert!(!a.cancel(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_payload_rejected() {
        let (mut a, _b) = pair();
        let err = a
            .send(vec![0u8; MAX_MESSAGE_SIZE + 1], DeliveryMode::Guaranteed)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { .. }));
        assert_eq!(a.stats().fragments_sent, 0);
        assert_eq!(a.stats().outstanding, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_datagram_counted() {
        let mut b = Endpoint::new(ProtocolConfig::default());
        let (raw, lb) = MemoryLink::pair(1500);
        b.add_link(Box::new(lb));

        raw.send(b"short").await.unwrap();
        assert_eq!(b.poll_received(Duration::from_millis(10)).await.count(), 0);
        assert_eq!(b.stats().malformed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_unknown_link() {
        let mut a = Endpoint::new(ProtocolConfig::default());
        assert!(matches!(
            a.remove_link(LinkId(42)),
            Err(Error::LinkNotFound(LinkId(42)))
        ));
    }
}
