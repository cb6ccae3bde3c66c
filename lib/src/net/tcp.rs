//! TCP connections, listeners and the socket-style API.
//!
//! Connections are keyed by 4-tuple and owned by the stack's table; they
//! hold only a weak reference back to the stack. Segment handling runs on
//! the driver's delivery thread under the connection lock; outgoing frames
//! are collected first and transmitted after the lock drops, so a backend
//! that synchronously re-enters the stack never observes held locks.

use std::{
    net::Ipv4Addr,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use super::{
    congestion::{AckOutcome, CongestionController},
    rtt::RttEstimator,
    seq,
    tcp_buf::{RecvBuffer, SendBuffer, SendSegment},
    wire::{TcpBuild, TcpPacket, TCP_ACK, TCP_FIN, TCP_PSH, TCP_RST, TCP_SYN},
    StackShared,
};
use crate::error::NetError;

/// Window advertised to the guest.
pub(crate) const RECV_WINDOW: u16 = 0xffff;

/// MSS assumed when the peer's SYN carries no option.
const DEFAULT_MSS: u16 = 1460;

/// Bytes beyond the expected sequence we will buffer out of order.
const RECV_WINDOW_SPAN: u32 = 256 * 1024;

/// The 4-tuple identifying a connection, from the guest's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourTuple {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

impl std::fmt::Display for FourTuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TcpStatus {
    SynRcvd,
    Established,
    FinWait,
    Closed,
}

/// Invoked once the handshake completes, instead of a listener delivery.
pub(crate) type OnEstablished = Box<dyn FnOnce(TcpSocket) + Send>;

enum ReadEvent {
    Data(Vec<u8>),
    Eof,
    Reset,
}

struct ConnState {
    status: TcpStatus,
    /// Next sequence number expected from the guest.
    guest_seq: u32,
    /// Next sequence number we will send.
    host_seq: u32,
    /// Highest ack the guest has sent for our data.
    last_acked: u32,
    /// Our initial sequence number; the handshake completes when the guest
    /// acks `iss + 1`.
    iss: u32,
    peer_window: u32,
    window_scale: u8,
    scale_enabled: bool,
    mss: u16,
    send_buf: SendBuffer,
    recv_buf: RecvBuffer,
    rtt: RttEstimator,
    cc: CongestionController,
    our_fin: Option<u32>,
    syn_ack_sent_at: Instant,
    delivery: Option<Delivery>,
}

pub(crate) enum Delivery {
    Listener(Sender<TcpSocket>),
    Callback(OnEstablished),
}

/// A segment queued for transmission after the connection lock drops.
struct Out {
    seq: u32,
    ack: u32,
    flags: u8,
    mss: Option<u16>,
    window_scale: Option<u8>,
    payload: Vec<u8>,
}

pub(crate) struct TcpConn {
    key: FourTuple,
    stack: Weak<StackShared>,
    state: Mutex<ConnState>,
    /// Writers park here while the send window is closed.
    window_open: Condvar,
    read_tx: Sender<ReadEvent>,
    read_rx: Receiver<ReadEvent>,
}

impl TcpConn {
    /// Create a connection for an inbound SYN. The caller inserts it into
    /// the table and then calls [`send_syn_ack`](Self::send_syn_ack), so a
    /// backend that answers synchronously finds the connection in place.
    pub(crate) fn accept_syn(
        key: FourTuple,
        stack: Weak<StackShared>,
        packet: &TcpPacket<'_>,
        delivery: Delivery,
    ) -> Arc<Self> {
        let iss: u32 = rand::random();
        let mss = packet.mss.unwrap_or(DEFAULT_MSS);
        let scale_enabled = packet.window_scale.is_some();
        let window_scale = packet.window_scale.unwrap_or(0);
        let (read_tx, read_rx) = crossbeam_channel::unbounded();

        let conn = Arc::new(Self {
            key,
            stack,
            state: Mutex::new(ConnState {
                status: TcpStatus::SynRcvd,
                guest_seq: seq::add(packet.seq, 1),
                host_seq: seq::add(iss, 1),
                last_acked: iss,
                iss,
                peer_window: (packet.window as u32) << window_scale,
                window_scale,
                scale_enabled,
                mss,
                send_buf: SendBuffer::new(),
                recv_buf: RecvBuffer::new(),
                rtt: RttEstimator::new(),
                cc: CongestionController::new(mss as u32),
                our_fin: None,
                syn_ack_sent_at: Instant::now(),
                delivery: Some(delivery),
            }),
            window_open: Condvar::new(),
            read_tx,
            read_rx,
        });

        debug!(key = %key, mss, scale = window_scale, "SYN received");
        conn
    }

    /// Transmit the SYN-ACK for a freshly accepted connection.
    pub(crate) fn send_syn_ack(&self) {
        let syn_ack = self.syn_ack();
        self.transmit_all(vec![syn_ack]);
    }

    pub(crate) fn listener_delivery(tx: Sender<TcpSocket>) -> Delivery {
        Delivery::Listener(tx)
    }

    pub(crate) fn callback_delivery(callback: OnEstablished) -> Delivery {
        Delivery::Callback(callback)
    }

    fn syn_ack(&self) -> Out {
        let state = self.state.lock();
        Out {
            seq: state.iss,
            ack: state.guest_seq,
            flags: TCP_SYN | TCP_ACK,
            mss: Some(DEFAULT_MSS),
            // Echoed only when the peer offered scaling.
            window_scale: state.scale_enabled.then_some(0),
            payload: Vec::new(),
        }
    }

    /// Handle a segment from the guest. Runs on the delivery thread.
    pub(crate) fn on_segment(self: &Arc<Self>, packet: &TcpPacket<'_>) {
        let mut out = Vec::new();
        let mut established = None;

        {
            let mut state = self.state.lock();

            if packet.flags & TCP_RST != 0 {
                trace!(key = %self.key, "RST");
                self.teardown(&mut state, ReadEvent::Reset);
                return;
            }

            match state.status {
                TcpStatus::SynRcvd => {
                    if packet.flags & TCP_SYN != 0 {
                        // Retransmitted SYN; repeat the SYN-ACK.
                        out.push(Out {
                            seq: state.iss,
                            ack: state.guest_seq,
                            flags: TCP_SYN | TCP_ACK,
                            mss: Some(DEFAULT_MSS),
                            window_scale: state.scale_enabled.then_some(0),
                            payload: Vec::new(),
                        });
                    } else if packet.flags & TCP_ACK != 0
                        && seq::ge(packet.ack, seq::add(state.iss, 1))
                    {
                        state.status = TcpStatus::Established;
                        state.last_acked = packet.ack;
                        state.peer_window = (packet.window as u32) << state.window_scale;
                        established = state.delivery.take();
                        debug!(key = %self.key, "established");

                        // Data or FIN riding the handshake ACK.
                        if !packet.payload.is_empty() {
                            self.on_data(&mut state, packet, &mut out);
                        }
                        if packet.flags & TCP_FIN != 0 {
                            self.on_fin(&mut state, packet, &mut out);
                        }
                    }
                }

                TcpStatus::Established => {
                    if packet.flags & TCP_ACK != 0 {
                        self.on_ack(&mut state, packet, &mut out);
                    }
                    if !packet.payload.is_empty() {
                        self.on_data(&mut state, packet, &mut out);
                    }
                    if packet.flags & TCP_FIN != 0 {
                        self.on_fin(&mut state, packet, &mut out);
                    }
                }

                TcpStatus::FinWait => {
                    if packet.flags & TCP_ACK != 0 {
                        if let Some(fin) = state.our_fin {
                            if seq::ge(packet.ack, seq::add(fin, 1)) {
                                trace!(key = %self.key, "FIN acked");
                                self.teardown(&mut state, ReadEvent::Eof);
                            }
                        }
                    }
                    // Data and further FINs in this state are dropped.
                }

                TcpStatus::Closed => {}
            }
        }

        self.transmit_all(out);

        if let Some(delivery) = established {
            self.deliver(delivery);
        }
    }

    fn deliver(self: &Arc<Self>, delivery: Delivery) {
        let socket = TcpSocket::new(Arc::clone(self));
        match delivery {
            Delivery::Listener(tx) => {
                if tx.send(socket).is_err() {
                    debug!(key = %self.key, "listener closed; dropping connection");
                    self.close();
                }
            }
            Delivery::Callback(callback) => {
                // Callbacks do blocking I/O; keep the delivery thread free.
                std::thread::spawn(move || callback(socket));
            }
        }
    }

    fn on_ack(&self, state: &mut ConnState, packet: &TcpPacket<'_>, out: &mut Vec<Out>) {
        state.peer_window = (packet.window as u32) << state.window_scale;

        // An ack for data never sent means the two sides disagree about the
        // stream; there is no way to resynchronize.
        if seq::gt(packet.ack, state.host_seq) {
            debug_assert!(false, "ack {} beyond host_seq {}", packet.ack, state.host_seq);
            tracing::error!(key = %self.key, ack = packet.ack, "ack beyond sent data; closing");
            self.teardown(state, ReadEvent::Reset);
            return;
        }

        if seq::gt(packet.ack, state.last_acked) {
            let acked = state.send_buf.ack(packet.ack);
            state.last_acked = packet.ack;
            if let Some(sent_at) = acked.rtt_sample {
                state.rtt.sample(sent_at.elapsed());
            }
            state.cc.on_new_ack(acked.bytes);
            self.window_open.notify_all();
        } else if packet.ack == state.last_acked
            && !state.send_buf.is_empty()
            && packet.payload.is_empty()
            && packet.flags & (TCP_SYN | TCP_FIN) == 0
        {
            if state.cc.on_dup_ack() == AckOutcome::FastRetransmit {
                trace!(key = %self.key, "fast retransmit");
                if let Some(segment) = state.send_buf.retransmit_oldest(Instant::now()) {
                    out.push(Out {
                        seq: segment.seq_start,
                        ack: state.guest_seq,
                        flags: TCP_PSH | TCP_ACK,
                        mss: None,
                        window_scale: None,
                        payload: segment.payload,
                    });
                }
            }
        }
    }

    fn on_data(&self, state: &mut ConnState, packet: &TcpPacket<'_>, out: &mut Vec<Out>) {
        let seq_start = packet.seq;
        let len = packet.payload.len() as u32;

        if seq_start == state.guest_seq {
            state.guest_seq = seq::add(state.guest_seq, len);
            let _ = self.read_tx.send(ReadEvent::Data(packet.payload.to_vec()));

            // Gap filled: drain whatever became contiguous.
            let mut next = state.guest_seq;
            let drained = state.recv_buf.collect_contiguous(&mut next);
            if !drained.is_empty() {
                let _ = self.read_tx.send(ReadEvent::Data(drained));
            }
            state.guest_seq = next;
        } else if seq::gt(seq_start, state.guest_seq)
            && seq::lt(seq_start, seq::add(state.guest_seq, RECV_WINDOW_SPAN))
        {
            // Out of order but in window: hold it and repeat the ack.
            state
                .recv_buf
                .insert(seq_start, packet.payload.to_vec(), state.guest_seq);
        }
        // seq < expected: pure retransmission; the duplicate ack below covers it.

        out.push(Out {
            seq: state.host_seq,
            ack: state.guest_seq,
            flags: TCP_ACK,
            mss: None,
            window_scale: None,
            payload: Vec::new(),
        });
    }

    fn on_fin(&self, state: &mut ConnState, packet: &TcpPacket<'_>, out: &mut Vec<Out>) {
        let fin_seq = seq::add(packet.seq, packet.payload.len() as u32);
        if fin_seq != state.guest_seq {
            // FIN beyond a gap; ack what we have and wait for the fill.
            out.push(Out {
                seq: state.host_seq,
                ack: state.guest_seq,
                flags: TCP_ACK,
                mss: None,
                window_scale: None,
                payload: Vec::new(),
            });
            return;
        }

        state.guest_seq = seq::add(state.guest_seq, 1);
        let _ = self.read_tx.send(ReadEvent::Eof);

        // Ack the FIN and answer with ours.
        let fin = state.host_seq;
        state.our_fin = Some(fin);
        state.host_seq = seq::add(state.host_seq, 1);
        state.status = TcpStatus::FinWait;
        debug!(key = %self.key, "FIN; entering fin-wait");
        out.push(Out {
            seq: fin,
            ack: state.guest_seq,
            flags: TCP_FIN | TCP_ACK,
            mss: None,
            window_scale: None,
            payload: Vec::new(),
        });
    }

    /// Close the connection. The 4-tuple is released by the timer sweep,
    /// which prunes closed connections without holding this lock; taking
    /// the table lock here would invert the table-before-connection order.
    fn teardown(&self, state: &mut ConnState, event: ReadEvent) {
        state.status = TcpStatus::Closed;
        let _ = self.read_tx.send(event);
        self.window_open.notify_all();
    }

    /// Retransmission timer tick; returns true when the connection is gone
    /// and can be dropped from the table.
    pub(crate) fn on_timer(&self, now: Instant) -> bool {
        let mut out = Vec::new();
        {
            let mut state = self.state.lock();
            match state.status {
                TcpStatus::Closed => return true,
                TcpStatus::SynRcvd => {
                    if now.duration_since(state.syn_ack_sent_at) >= state.rtt.rto() {
                        state.syn_ack_sent_at = now;
                        state.rtt.backoff();
                        out.push(Out {
                            seq: state.iss,
                            ack: state.guest_seq,
                            flags: TCP_SYN | TCP_ACK,
                            mss: Some(DEFAULT_MSS),
                            window_scale: state.scale_enabled.then_some(0),
                            payload: Vec::new(),
                        });
                    }
                }
                TcpStatus::Established | TcpStatus::FinWait => {
                    let expired = state
                        .send_buf
                        .oldest()
                        .is_some_and(|oldest| now.duration_since(oldest.sent_at) >= state.rtt.rto());
                    if expired {
                        let mss = state.mss as usize;
                        state.send_buf.coalesce_oldest(mss);
                        if let Some(segment) = state.send_buf.retransmit_oldest(now) {
                            trace!(key = %self.key, seq = segment.seq_start, "timeout retransmit");
                            state.cc.on_timeout();
                            state.rtt.backoff();
                            out.push(Out {
                                seq: segment.seq_start,
                                ack: state.guest_seq,
                                flags: TCP_PSH | TCP_ACK,
                                mss: None,
                                window_scale: None,
                                payload: segment.payload,
                            });
                        }
                    }
                }
            }
        }
        self.transmit_all(out);
        false
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().status == TcpStatus::Closed
    }

    fn transmit_all(&self, out: Vec<Out>) {
        let Some(stack) = self.stack.upgrade() else {
            return;
        };
        for segment in out {
            stack.send_tcp_to_guest(
                &self.key,
                TcpBuild {
                    src_port: self.key.dst_port,
                    dst_port: self.key.src_port,
                    seq: segment.seq,
                    ack: segment.ack,
                    flags: segment.flags,
                    window: RECV_WINDOW,
                    mss: segment.mss,
                    window_scale: segment.window_scale,
                    payload: &segment.payload,
                },
            );
        }
    }

    fn close(self: &Arc<Self>) {
        let mut out = Vec::new();
        {
            let mut state = self.state.lock();
            match state.status {
                TcpStatus::Established | TcpStatus::SynRcvd => {
                    let fin = state.host_seq;
                    state.our_fin = Some(fin);
                    state.host_seq = seq::add(state.host_seq, 1);
                    state.status = TcpStatus::FinWait;
                    let _ = self.read_tx.send(ReadEvent::Eof);
                    out.push(Out {
                        seq: fin,
                        ack: state.guest_seq,
                        flags: TCP_FIN | TCP_ACK,
                        mss: None,
                        window_scale: None,
                        payload: Vec::new(),
                    });
                }
                TcpStatus::FinWait | TcpStatus::Closed => {}
            }
        }
        self.transmit_all(out);
    }

    /// Queue `data`, blocking while the effective window is closed.
    fn write(&self, data: &[u8], timeout: Option<Duration>) -> Result<usize, NetError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut written = 0;

        while written < data.len() {
            let mut out = None;
            {
                let mut state = self.state.lock();
                loop {
                    match state.status {
                        TcpStatus::Established => {}
                        TcpStatus::SynRcvd => {}
                        _ => return Err(NetError::Closed),
                    }

                    let window = state.cc.window().min(state.peer_window) as usize;
                    let room = window.saturating_sub(state.send_buf.in_flight());
                    if room > 0 && state.send_buf.has_room() {
                        let len = room.min(state.mss as usize).min(data.len() - written);
                        let seq_start = state.host_seq;
                        state.host_seq = seq::add(state.host_seq, len as u32);
                        let payload = data[written..written + len].to_vec();
                        let seq_end = state.host_seq;
                        state.send_buf.push(SendSegment {
                            seq_start,
                            seq_end,
                            payload: payload.clone(),
                            sent_at: Instant::now(),
                            retx_count: 0,
                        });
                        out = Some(Out {
                            seq: seq_start,
                            ack: state.guest_seq,
                            flags: TCP_PSH | TCP_ACK,
                            mss: None,
                            window_scale: None,
                            payload,
                        });
                        written += len;
                        break;
                    }

                    // The window is closed; park until an ack opens it.
                    match deadline {
                        Some(deadline) => {
                            if self.window_open.wait_until(&mut state, deadline).timed_out() {
                                return Err(NetError::Timeout);
                            }
                        }
                        None => self.window_open.wait(&mut state),
                    }
                }
            }
            if let Some(out) = out {
                self.transmit_all(vec![out]);
            }
        }
        Ok(written)
    }
}

/// A connected TCP stream backed by a guest connection.
///
/// Cloning shares the connection; at most one clone should read.
#[derive(Clone)]
pub struct TcpSocket {
    conn: Arc<TcpConn>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl std::fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSocket").field("key", &self.conn.key).finish()
    }
}

impl TcpSocket {
    fn new(conn: Arc<TcpConn>) -> Self {
        Self {
            conn,
            read_timeout: None,
            write_timeout: None,
        }
    }

    /// The connection's 4-tuple, guest side first.
    pub fn peer(&self) -> FourTuple {
        self.conn.key
    }

    /// Deadline for blocking reads; expiry returns [`NetError::Timeout`],
    /// which is distinguishable from EOF.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    /// Deadline for blocking writes; enforced by the window-wait path.
    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.write_timeout = timeout;
    }

    /// Receive the next chunk of in-order data. Returns an empty vec at EOF.
    pub fn recv(&self) -> Result<Vec<u8>, NetError> {
        let event = match self.read_timeout {
            Some(timeout) => self
                .conn
                .read_rx
                .recv_timeout(timeout)
                .map_err(|e| match e {
                    crossbeam_channel::RecvTimeoutError::Timeout => NetError::Timeout,
                    crossbeam_channel::RecvTimeoutError::Disconnected => NetError::Closed,
                })?,
            None => self.conn.read_rx.recv().map_err(|_| NetError::Closed)?,
        };
        match event {
            ReadEvent::Data(data) => Ok(data),
            // Terminal events are re-queued so every later read sees them
            // too instead of parking forever.
            ReadEvent::Eof => {
                let _ = self.conn.read_tx.send(ReadEvent::Eof);
                Ok(Vec::new())
            }
            ReadEvent::Reset => {
                let _ = self.conn.read_tx.send(ReadEvent::Reset);
                Err(NetError::Reset)
            }
        }
    }

    /// Write all of `data` to the guest.
    pub fn send(&self, data: &[u8]) -> Result<usize, NetError> {
        self.conn.write(data, self.write_timeout)
    }

    /// Send our FIN. The connection is released once the guest acks it.
    pub fn close(&self) {
        self.conn.close();
    }
}

/// Accepts inbound connections on a port.
pub struct TcpListener {
    pub(crate) port: u16,
    pub(crate) rx: Receiver<TcpSocket>,
    pub(crate) stack: Weak<StackShared>,
}

impl TcpListener {
    /// Block until a connection completes its handshake.
    pub fn accept(&self) -> Result<TcpSocket, NetError> {
        self.rx.recv().map_err(|_| NetError::Closed)
    }

    /// Like [`accept`](Self::accept) with a deadline.
    pub fn accept_timeout(&self, timeout: Duration) -> Result<TcpSocket, NetError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            crossbeam_channel::RecvTimeoutError::Timeout => NetError::Timeout,
            crossbeam_channel::RecvTimeoutError::Disconnected => NetError::Closed,
        })
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        if let Some(stack) = self.stack.upgrade() {
            stack.remove_listener(self.port);
        }
    }
}
