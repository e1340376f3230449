//! Link layer for OGP.
//!
//! A link is one unreliable datagram channel to the peer. The link set only
//! ever sees the [`Link`] trait, so real sockets, in-memory pairs and
//! simulated links are interchangeable:
//!
//! - [`UdpLink`]: a connected UDP socket.
//! - [`MemoryLink`]: an in-process pair, for tests and embedding.
//! - [`LinkSimulator`]: wraps any link and injects loss, delay, duplication
//!   and reordering from a seeded RNG.
//!
//! Receiving is readiness based: [`Link::readable`] resolves when
//! [`Link::try_recv`] has something to return, which lets the link set wait on
//! every link at once from a single task.

mod memory;
mod simulator;
mod udp;

pub use memory::MemoryLink;
pub use simulator::{
    ImpairmentModel, LinkSimulator, SimDecision, SimulatorConfig, SimulatorHandle,
    SimulatorStats, MAX_JITTER_FACTOR, MAX_SIMULATED_DELAY,
};
pub use udp::UdpLink;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;

use crate::error::LinkError;

/// Default MTU: an Ethernet frame minus IPv4 and UDP headers.
pub const DEFAULT_MTU: usize = 1472;

/// Largest datagram any link reads.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// One unreliable datagram channel.
#[async_trait]
pub trait Link: Send + Sync {
    /// Largest datagram `send` accepts.
    fn mtu(&self) -> usize;

    /// Send one datagram. Success only means the datagram was handed off.
    async fn send(&self, datagram: &[u8]) -> Result<(), LinkError>;

    /// Take one received datagram without blocking.
    fn try_recv(&self) -> Result<Option<Bytes>, LinkError>;

    /// Resolve once `try_recv` is likely to return data. Spurious wakeups are
    /// allowed.
    async fn readable(&self) -> Result<(), LinkError>;

    /// Perform time-driven work that is due at `now`.
    async fn service(&self, _now: Instant) -> Result<(), LinkError> {
        Ok(())
    }

    /// When `service` next has work to do.
    fn next_deadline(&self) -> Option<Instant> {
        None
    }

    /// Short type name for logs.
    fn kind(&self) -> &'static str;

    /// Human-readable description for logs and diagnostics.
    fn label(&self) -> String {
        self.kind().to_string()
    }
}

#[async_trait]
impl<L: Link + ?Sized> Link for Box<L> {
    fn mtu(&self) -> usize {
        (**self).mtu()
    }

    async fn send(&self, datagram: &[u8]) -> Result<(), LinkError> {
        (**self).send(datagram).await
    }

    fn try_recv(&self) -> Result<Option<Bytes>, LinkError> {
        (**self).try_recv()
    }

    async fn readable(&self) -> Result<(), LinkError> {
        (**self).readable().await
    }

    async fn service(&self, now: Instant) -> Result<(), LinkError> {
        (**self).service(now).await
    }

    fn next_deadline(&self) -> Option<Instant> {
        (**self).next_deadline()
    }

    fn kind(&self) -> &'static str {
        (**self).kind()
    }

    fn label(&self) -> String {
        (**self).label()
    }
}
