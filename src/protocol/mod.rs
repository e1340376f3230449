//! Wire protocol for OGP.
//!
//! Defines the fragment format, message fragmentation and reassembly, and the
//! receive-side dedup window.
//!
//! ## Fragment Format
//!
//! All integers are little-endian.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Message ID (8)                            │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Index (2) │ Count (2) │ Payload Length (2) │ Checksum (4) │ ...  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A fragment with `count == 0` and an empty payload is an acknowledgment of
//! the message named by its id.

mod dedup;
mod fragment;
mod framer;

pub use dedup::DedupWindow;
pub use fragment::{Fragment, FragmentKind};
pub use framer::{Accepted, Fragmenter, Reassembler, ReassemblerConfig, ReassemblyStats};

/// Header size in bytes.
pub const HEADER_SIZE: usize = 18;

/// Largest application message, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Default payload bytes carried by one fragment.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1200;

/// Smallest fragment payload that can still carry a maximum-size message
/// within the 16-bit fragment count.
pub const MIN_PAYLOAD_SIZE: usize = MAX_MESSAGE_SIZE.div_ceil(u16::MAX as usize);

/// Calculate CRC32 checksum.
pub fn checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Number of fragments a message of `len` bytes needs.
pub fn fragment_count(len: usize, max_payload_size: usize) -> usize {
    len.div_ceil(max_payload_size).max(1)
}
