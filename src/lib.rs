//! # OGP
//!
//! Redundant multi-path datagram protocol.
//!
//! OGP copies every outgoing message onto every available network link and
//! delivers whichever copy arrives first, trading bandwidth for latency and
//! robustness. It is meant for small command-and-control messages over
//! several independent, lossy wireless links.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Application (Endpoint)                    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │        Reliability: retries, TTL, acks, round-trip probes       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │        Framing: fragmentation, reassembly, dedup window         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                Link Set: broadcast out, fan-in back             │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────┐         │
//! │  │  Link 1  │  │  Link 2  │  │  Link 3  │  │  Link N  │         │
//! │  │  (UDP)   │  │(Simulated│  │ (Memory) │  │   ...    │         │
//! │  └──────────┘  └──────────┘  └──────────┘  └──────────┘         │
//! └─────────────────────────────────────────────────────────────────┘
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use ogp::prelude::*;
//!
//! # async fn run() -> ogp::Result<()> {
//! let config = Config::load("ogp.toml")?;
//! let mut endpoint = Endpoint::from_config(&config).await?;
//!
//! endpoint.send(&b"PING"[..], DeliveryMode::Guaranteed).await?;
//! for message in endpoint.poll_received(Duration::from_millis(500)).await {
//!     println!("{} bytes from message {}", message.len(), message.id);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow stylistic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]      // Many functions can't be const due to trait bounds
#![allow(clippy::doc_markdown)]              // ASCII diagrams in docs
#![allow(clippy::unreadable_literal)]
#![allow(clippy::cast_possible_truncation)]  // Wire fields are u16, bounds checked before casting
#![allow(clippy::cast_precision_loss)]       // Acceptable for stats
#![allow(clippy::similar_names)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::option_if_let_else)]        // More readable in context
#![allow(clippy::use_self)]
#![allow(clippy::redundant_pub_crate)]       // Explicit visibility
#![allow(clippy::future_not_send)]
#![allow(clippy::match_same_arms)]           // Explicit arm per variant is clearer
#![allow(clippy::return_self_not_must_use)]  // Builder methods don't need must_use

pub mod config;
pub mod endpoint;
pub mod error;
pub mod link;
pub mod multipath;
pub mod protocol;
pub mod reliability;
pub mod types;

pub use config::Config;
pub use endpoint::{Endpoint, EndpointStats};
pub use error::{Error, Result};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version for wire compatibility
pub const PROTOCOL_VERSION: u8 = 1;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{Config, ProtocolConfig};
    pub use crate::endpoint::Endpoint;
    pub use crate::error::{Error, Result};
    pub use crate::link::{Link, LinkSimulator, MemoryLink, SimulatorConfig, UdpLink};
    pub use crate::multipath::{LinkInfo, LinkSet};
    pub use crate::reliability::RetryPolicy;
    pub use crate::types::*;
}
