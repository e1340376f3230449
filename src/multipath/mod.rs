//! Redundant multi-path transmission.
//!
//! There is no path selection: every datagram is replicated onto every open
//! link, and whichever copy arrives first wins at the receiver. Per-link
//! statistics (RTT, probe loss, failure streaks) are tracked for diagnostics
//! only and never influence where datagrams go.

mod manager;
mod stats;

pub use manager::{BroadcastReport, Datagram, Inbound, LinkInfo, LinkSet, MAX_DRAIN_PER_LINK};
pub use stats::LinkStats;
