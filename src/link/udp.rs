//! UDP link.
//!
//! Each link is a UDP socket connected to one peer address, so the kernel
//! filters out datagrams from anyone else. Binding the socket to a specific
//! local address (one per network interface) is what makes several links
//! take physically different paths.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;

use super::{Link, MAX_DATAGRAM_SIZE};
use crate::error::LinkError;

/// A connected UDP socket.
#[derive(Debug)]
pub struct UdpLink {
    socket: UdpSocket,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    mtu: usize,
    /// Scratch buffer for `try_recv`.
    recv_buf: Mutex<Vec<u8>>,
}

impl UdpLink {
    /// Bind to `local` and connect to `peer`.
    pub async fn bind(local: SocketAddr, peer: SocketAddr, mtu: usize) -> Result<Self, LinkError> {
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| LinkError::BindFailed {
                addr: local,
                reason: e.to_string(),
            })?;

        socket
            .connect(peer)
            .await
            .map_err(|e| LinkError::BindFailed {
                addr: local,
                reason: format!("connect to {peer}: {e}"),
            })?;

        let local_addr = socket.local_addr().map_err(|e| LinkError::BindFailed {
            addr: local,
            reason: e.to_string(),
        })?;

        tracing::debug!(local = %local_addr, peer = %peer, mtu, "UDP link bound");

        Ok(Self {
            socket,
            local_addr,
            peer_addr: peer,
            mtu,
            recv_buf: Mutex::new(vec![0u8; MAX_DATAGRAM_SIZE]),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

#[async_trait]
impl Link for UdpLink {
    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn send(&self, datagram: &[u8]) -> Result<(), LinkError> {
        if datagram.len() > self.mtu {
            return Err(LinkError::MtuExceeded {
                size: datagram.len(),
                max: self.mtu,
            });
        }

        self.socket
            .send(datagram)
            .await
            .map(|_| ())
            .map_err(|e| LinkError::SendFailed(e.to_string()))
    }

    fn try_recv(&self) -> Result<Option<Bytes>, LinkError> {
        let mut buf = self.recv_buf.lock();
        match self.socket.try_recv(&mut buf) {
            Ok(len) => Ok(Some(Bytes::copy_from_slice(&buf[..len]))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // ICMP port unreachable from an earlier send; the peer may not be up yet
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(None),
            Err(e) => Err(LinkError::ReceiveFailed(e.to_string())),
        }
    }

    async fn readable(&self) -> Result<(), LinkError> {
        self.socket
            .readable()
            .await
            .map_err(|e| LinkError::ReceiveFailed(e.to_string()))
    }

    fn kind(&self) -> &'static str {
        "udp"
    }

    fn label(&self) -> String {
        format!("udp {} -> {}", self.local_addr, self.peer_addr)
    }
}
