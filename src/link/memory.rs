//! In-process link pairs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::Link;
use crate::error::LinkError;

/// One direction of a memory link pair.
#[derive(Debug, Default)]
struct Channel {
    queue: Mutex<VecDeque<Bytes>>,
    notify: Notify,
    closed: AtomicBool,
}

impl Channel {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// One end of an in-process datagram channel.
///
/// Datagrams are delivered reliably and in order; wrap the link in a
/// [`LinkSimulator`](super::LinkSimulator) to make it behave like a network.
#[derive(Debug)]
pub struct MemoryLink {
    tx: Arc<Channel>,
    rx: Arc<Channel>,
    mtu: usize,
}

impl MemoryLink {
    /// Create two connected ends.
    pub fn pair(mtu: usize) -> (Self, Self) {
        let a_to_b = Arc::new(Channel::default());
        let b_to_a = Arc::new(Channel::default());

        let a = Self {
            tx: Arc::clone(&a_to_b),
            rx: Arc::clone(&b_to_a),
            mtu,
        };
        let b = Self {
            tx: b_to_a,
            rx: a_to_b,
            mtu,
        };
        (a, b)
    }

    /// Close both directions. Either end fails subsequent sends.
    pub fn close(&self) {
        self.tx.close();
        self.rx.close();
    }

    /// Datagrams waiting to be received on this end.
    pub fn queued(&self) -> usize {
        self.rx.queue.lock().len()
    }
}

#[async_trait]
impl Link for MemoryLink {
    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn send(&self, datagram: &[u8]) -> Result<(), LinkError> {
        if self.tx.is_closed() {
            return Err(LinkError::Closed);
        }
        if datagram.len() > self.mtu {
            return Err(LinkError::MtuExceeded {
                size: datagram.len(),
                max: self.mtu,
            });
        }

        self.tx
            .queue
            .lock()
            .push_back(Bytes::copy_from_slice(datagram));
        self.tx.notify.notify_one();
        Ok(())
    }

    fn try_recv(&self) -> Result<Option<Bytes>, LinkError> {
        if let Some(datagram) = self.rx.queue.lock().pop_front() {
            return Ok(Some(datagram));
        }
        if self.rx.is_closed() {
            return Err(LinkError::Closed);
        }
        Ok(None)
    }

    async fn readable(&self) -> Result<(), LinkError> {
        loop {
            let notified = self.rx.notify.notified();
            if !self.rx.queue.lock().is_empty() {
                return Ok(());
            }
            if self.rx.is_closed() {
                return Err(LinkError::Closed);
            }
            notified.await;
        }
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}
