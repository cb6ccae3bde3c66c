//! UDP endpoints.
//!
//! A port binds either to a queued endpoint (blocking reads from a bounded
//! channel) or to a callback invoked inline on the delivery thread. One
//! process-wide mapping per stack enforces unique binding.

use std::{
    net::SocketAddrV4,
    sync::{Arc, Weak},
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender};

use super::StackShared;
use crate::error::NetError;

/// Datagrams a queued endpoint buffers before dropping; delivery is
/// best-effort.
pub(crate) const QUEUE_DEPTH: usize = 256;

/// Handler invoked inline for callback endpoints. The payload is borrowed
/// from the delivery; retain by copying.
pub type UdpHandler = dyn Fn(&[u8], SocketAddrV4) + Send + Sync;

/// One bound port: a queue for readers or an inline callback.
pub(crate) enum UdpEndpoint {
    Queued(Sender<(Vec<u8>, SocketAddrV4)>),
    Callback(Arc<UdpHandler>),
}

/// A socket-style handle to a queued UDP endpoint.
pub struct UdpSocket {
    pub(crate) port: u16,
    pub(crate) rx: Receiver<(Vec<u8>, SocketAddrV4)>,
    pub(crate) stack: Weak<StackShared>,
    read_timeout: Option<Duration>,
}

impl UdpSocket {
    pub(crate) fn new(
        port: u16,
        rx: Receiver<(Vec<u8>, SocketAddrV4)>,
        stack: Weak<StackShared>,
    ) -> Self {
        Self {
            port,
            rx,
            stack,
            read_timeout: None,
        }
    }

    /// The bound local port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Deadline for blocking receives; expiry returns [`NetError::Timeout`].
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    /// Block until a datagram arrives.
    pub fn recv_from(&self) -> Result<(Vec<u8>, SocketAddrV4), NetError> {
        match self.read_timeout {
            Some(timeout) => self.rx.recv_timeout(timeout).map_err(|e| match e {
                crossbeam_channel::RecvTimeoutError::Timeout => NetError::Timeout,
                crossbeam_channel::RecvTimeoutError::Disconnected => NetError::Closed,
            }),
            None => self.rx.recv().map_err(|_| NetError::Closed),
        }
    }

    /// Send a datagram to a guest address from this socket's port.
    pub fn send_to(&self, payload: &[u8], dst: SocketAddrV4) -> Result<(), NetError> {
        let stack = self.stack.upgrade().ok_or(NetError::Closed)?;
        stack.send_udp_to_guest(self.port, dst, payload);
        Ok(())
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        if let Some(stack) = self.stack.upgrade() {
            stack.remove_udp(self.port);
        }
    }
}
