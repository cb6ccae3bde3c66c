//! The user-space network stack behind the guest's virtual NIC.
//!
//! Exactly one interface: frames arrive via [`Netstack::deliver_from_guest`]
//! on the driver's delivery thread and leave through the backend callback
//! installed with [`Netstack::attach_backend`]. ARP, ICMP echo, UDP demux
//! and the TCP state machines all run here; a DNS responder and a
//! service-localhost proxy sit on top.
//!
//! Locking: the stack-level table locks order before any connection lock,
//! and the transmit callback is never invoked while a stack lock is held,
//! so backends may synchronously re-enter `deliver_from_guest`.

use std::{
    collections::HashMap,
    io::Write,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bon::Builder;
use parking_lot::Mutex;
use tracing::{debug, trace};

pub mod congestion;
pub mod dns;
pub mod pcap;
mod proxy;
pub mod rtt;
pub mod seq;
pub mod tcp;
pub mod tcp_buf;
pub mod udp;
pub mod wire;

pub use pcap::PcapStats;
pub use tcp::{FourTuple, TcpListener, TcpSocket};
pub use udp::{UdpHandler, UdpSocket};

use tcp::TcpConn;
use udp::UdpEndpoint;
use wire::{
    ArpPacket, EthernetFrame, IcmpPacket, Ipv4Packet, Mac, TcpBuild, TcpPacket, UdpDatagram,
    ARP_REPLY, ARP_REQUEST, ETHERTYPE_ARP, ETHERTYPE_IPV4, PROTO_ICMP, PROTO_TCP, PROTO_UDP,
    TCP_ACK, TCP_FIN, TCP_RST, TCP_SYN,
};

use crate::error::NetError;

/// Retransmission timer granularity.
const TIMER_TICK: Duration = Duration::from_millis(20);

/// Addressing and policy for one stack instance.
#[derive(Debug, Clone, Builder)]
pub struct NetstackConfig {
    /// MAC the stack answers as.
    #[builder(default = Mac([0x02, 0x73, 0x6b, 0x66, 0x00, 0x01]))]
    pub host_mac: Mac,

    /// Address host-side services (DNS, listeners) live on.
    pub host_ip: Ipv4Addr,

    /// Address assigned to the guest.
    pub guest_ip: Ipv4Addr,

    /// Distinguished address bridged to host loopback.
    pub service_ip: Ipv4Addr,

    /// Whether guest connections may leave the host.
    #[builder(default = false)]
    pub allow_internet: bool,
}

/// Frame and drop counters for one stack instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetstackStats {
    pub frames_in: u64,
    pub frames_out: u64,
    /// Unicast frames dropped by the L2 filter.
    pub l2_drops: u64,
}

#[derive(Default)]
struct Counters {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    l2_drops: AtomicU64,
}

/// State shared between the stack handle, its connections and its timer
/// thread. Connections hold only weak references back here.
pub(crate) struct StackShared {
    config: NetstackConfig,
    guest_mac: Mutex<Option<Mac>>,
    backend: Mutex<Option<Arc<dyn Fn(&[u8]) + Send + Sync>>>,
    udp_ports: Mutex<HashMap<u16, UdpEndpoint>>,
    conns: Mutex<HashMap<FourTuple, Arc<TcpConn>>>,
    listeners: Mutex<HashMap<u16, crossbeam_channel::Sender<TcpSocket>>>,
    allow_internet: AtomicBool,
    proxy_enabled: AtomicBool,
    closed: AtomicBool,
    capture: Mutex<Option<pcap::PcapHandle>>,
    counters: Counters,
}

impl StackShared {
    /// Hand a frame to the backend. No stack lock is held across the call:
    /// the backend may synchronously deliver a response frame.
    fn transmit(&self, frame: &[u8]) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        if let Some(capture) = &*self.capture.lock() {
            capture.capture(frame);
        }
        self.counters.frames_out.fetch_add(1, Ordering::Relaxed);

        let backend = self.backend.lock().clone();
        if let Some(backend) = backend {
            backend(frame);
        }
    }

    fn guest_dst_mac(&self) -> Mac {
        self.guest_mac.lock().unwrap_or(Mac::BROADCAST)
    }

    fn send_ipv4_to_guest(&self, src: Ipv4Addr, dst: Ipv4Addr, proto: u8, payload: &[u8]) {
        let packet = wire::ipv4(src, dst, proto, payload);
        let frame = wire::eth(
            self.guest_dst_mac(),
            self.config.host_mac,
            ETHERTYPE_IPV4,
            &packet,
        );
        self.transmit(&frame);
    }

    /// Send a TCP segment back along a guest connection's 4-tuple.
    pub(crate) fn send_tcp_to_guest(&self, key: &FourTuple, build: TcpBuild<'_>) {
        let payload = wire::tcp(key.dst_ip, key.src_ip, build);
        self.send_ipv4_to_guest(key.dst_ip, key.src_ip, PROTO_TCP, &payload);
    }

    /// Send a UDP datagram from `(host_ip, src_port)` to a guest address.
    pub(crate) fn send_udp_to_guest(&self, src_port: u16, dst: SocketAddrV4, payload: &[u8]) {
        let src = self.config.host_ip;
        let datagram = wire::udp(src, *dst.ip(), src_port, dst.port(), payload);
        self.send_ipv4_to_guest(src, *dst.ip(), PROTO_UDP, &datagram);
    }

    pub(crate) fn config(&self) -> &NetstackConfig {
        &self.config
    }

    pub(crate) fn allow_internet(&self) -> &AtomicBool {
        &self.allow_internet
    }

    pub(crate) fn remove_listener(&self, port: u16) {
        self.listeners.lock().remove(&port);
    }

    pub(crate) fn remove_udp(&self, port: u16) {
        self.udp_ports.lock().remove(&port);
    }
}

/// The stack handle. Dropping it closes every endpoint and releases the
/// NIC backend.
pub struct Netstack {
    shared: Arc<StackShared>,
    timer: Option<std::thread::JoinHandle<()>>,
}

impl Netstack {
    pub fn new(config: NetstackConfig) -> Self {
        let allow_internet = config.allow_internet;
        let shared = Arc::new(StackShared {
            config,
            guest_mac: Mutex::new(None),
            backend: Mutex::new(None),
            udp_ports: Mutex::new(HashMap::new()),
            conns: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            allow_internet: AtomicBool::new(allow_internet),
            proxy_enabled: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            capture: Mutex::new(None),
            counters: Counters::default(),
        });

        let timer = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("netstack-timer".to_string())
                .spawn(move || timer_loop(shared))
                .expect("spawn netstack timer")
        };

        Self {
            shared,
            timer: Some(timer),
        }
    }

    /// Install the transmit callback the backend provides. Frames handed to
    /// it are owned by the stack only for the duration of the call.
    pub fn attach_backend(&self, backend: impl Fn(&[u8]) + Send + Sync + 'static) {
        *self.shared.backend.lock() = Some(Arc::new(backend));
    }

    /// Deliver a frame from the guest. The frame is borrowed for the
    /// duration of the call; anything retained is copied.
    pub fn deliver_from_guest(&self, frame: &[u8]) {
        self.deliver(frame);
    }

    /// Like [`deliver_from_guest`](Self::deliver_from_guest), invoking
    /// `release` once the stack is done with the buffer.
    pub fn deliver_from_guest_with_release(&self, frame: &[u8], release: impl FnOnce()) {
        self.deliver(frame);
        release();
    }

    fn deliver(&self, frame: &[u8]) {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Relaxed) {
            return;
        }
        shared.counters.frames_in.fetch_add(1, Ordering::Relaxed);
        if let Some(capture) = &*shared.capture.lock() {
            capture.capture(frame);
        }

        let Some(eth) = EthernetFrame::parse(frame) else {
            return;
        };

        // Learn the guest's MAC from the first non-broadcast frame.
        if !eth.dst.is_broadcast() {
            let mut guest_mac = shared.guest_mac.lock();
            if guest_mac.is_none() && eth.src != shared.config.host_mac {
                debug!(mac = %eth.src, "learned guest MAC");
                *guest_mac = Some(eth.src);
            }
        }

        // L2 filter: broadcast, our MAC, or the learned guest MAC.
        let accepted = eth.dst.is_broadcast()
            || eth.dst == shared.config.host_mac
            || Some(eth.dst) == *shared.guest_mac.lock();
        if !accepted {
            shared.counters.l2_drops.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match eth.ethertype {
            ETHERTYPE_ARP => self.handle_arp(&eth),
            ETHERTYPE_IPV4 => self.handle_ipv4(&eth),
            other => trace!(ethertype = format!("{other:#06x}"), "ignored ethertype"),
        }
    }

    fn handle_arp(&self, eth: &EthernetFrame<'_>) {
        let shared = &self.shared;
        let Some(arp) = ArpPacket::parse(eth.payload) else {
            return;
        };
        if arp.op != ARP_REQUEST {
            return;
        }
        let ours = arp.target_ip == shared.config.host_ip
            || arp.target_ip == shared.config.service_ip;
        if !ours {
            return;
        }

        let reply = ArpPacket {
            op: ARP_REPLY,
            sender_mac: shared.config.host_mac,
            sender_ip: arp.target_ip,
            target_mac: arp.sender_mac,
            target_ip: arp.sender_ip,
        };
        // Unicast back to the requester.
        let frame = wire::eth(
            arp.sender_mac,
            shared.config.host_mac,
            ETHERTYPE_ARP,
            &reply.build(),
        );
        shared.transmit(&frame);
    }

    fn handle_ipv4(&self, eth: &EthernetFrame<'_>) {
        let Some(ip) = Ipv4Packet::parse(eth.payload) else {
            return;
        };
        match ip.proto {
            PROTO_ICMP => self.handle_icmp(&ip),
            PROTO_UDP => self.handle_udp(&ip),
            PROTO_TCP => self.handle_tcp(&ip),
            other => trace!(proto = other, "ignored protocol"),
        }
    }

    fn handle_icmp(&self, ip: &Ipv4Packet<'_>) {
        let shared = &self.shared;
        if ip.dst != shared.config.host_ip && ip.dst != shared.config.service_ip {
            return;
        }
        // Corrupt checksums drop in the parser.
        let Some(icmp) = IcmpPacket::parse(ip.payload) else {
            return;
        };
        // Only Echo Request is handled.
        if icmp.kind != 8 || icmp.code != 0 {
            return;
        }
        let reply = wire::icmp(0, 0, icmp.rest);
        shared.send_ipv4_to_guest(ip.dst, ip.src, PROTO_ICMP, &reply);
    }

    fn handle_udp(&self, ip: &Ipv4Packet<'_>) {
        let shared = &self.shared;
        let Some(datagram) = UdpDatagram::parse(ip.src, ip.dst, ip.payload) else {
            return;
        };
        let remote = SocketAddrV4::new(ip.src, datagram.src_port);

        // Split by endpoint kind so callbacks run without the table lock.
        let callback = {
            let ports = shared.udp_ports.lock();
            match ports.get(&datagram.dst_port) {
                Some(UdpEndpoint::Queued(tx)) => {
                    // Best-effort: a full queue drops the datagram.
                    let _ = tx.try_send((datagram.payload.to_vec(), remote));
                    None
                }
                Some(UdpEndpoint::Callback(callback)) => Some(Arc::clone(callback)),
                // No endpoint: silent drop, no ICMP unreachable.
                None => None,
            }
        };
        if let Some(callback) = callback {
            callback(datagram.payload, remote);
        }
    }

    fn handle_tcp(&self, ip: &Ipv4Packet<'_>) {
        let shared = &self.shared;
        let Some(packet) = TcpPacket::parse(ip.src, ip.dst, ip.payload) else {
            return;
        };
        let key = FourTuple {
            src_ip: ip.src,
            src_port: packet.src_port,
            dst_ip: ip.dst,
            dst_port: packet.dst_port,
        };

        let conn = {
            let conns = shared.conns.lock();
            conns.get(&key).filter(|c| !c.is_closed()).cloned()
        };
        if let Some(conn) = conn {
            conn.on_segment(&packet);
            return;
        }

        if packet.flags & TCP_SYN != 0 && packet.flags & TCP_ACK == 0 {
            self.handle_syn(key, &packet);
            return;
        }
        if packet.flags & TCP_RST != 0 {
            return;
        }
        // Anything else against a missing connection is reset.
        self.send_rst(&key, &packet);
    }

    fn handle_syn(&self, key: FourTuple, packet: &TcpPacket<'_>) {
        let shared = &self.shared;
        let delivery = if key.dst_ip == shared.config.service_ip {
            if !shared.proxy_enabled.load(Ordering::Relaxed) {
                self.send_rst(&key, packet);
                return;
            }
            // Bridge to the same port on host loopback.
            TcpConn::callback_delivery(proxy::bridge(SocketAddr::from((
                Ipv4Addr::LOCALHOST,
                key.dst_port,
            ))))
        } else if key.dst_ip == shared.config.host_ip {
            let listeners = shared.listeners.lock();
            match listeners.get(&key.dst_port) {
                Some(tx) => TcpConn::listener_delivery(tx.clone()),
                None => {
                    drop(listeners);
                    debug!(%key, "no listener; reset");
                    self.send_rst(&key, packet);
                    return;
                }
            }
        } else if shared.allow_internet.load(Ordering::Relaxed) {
            TcpConn::callback_delivery(proxy::bridge(SocketAddr::from((
                key.dst_ip,
                key.dst_port,
            ))))
        } else {
            debug!(%key, "internet disabled; reset");
            self.send_rst(&key, packet);
            return;
        };

        let conn = TcpConn::accept_syn(key, Arc::downgrade(shared), packet, delivery);
        shared.conns.lock().insert(key, Arc::clone(&conn));
        conn.send_syn_ack();
    }

    fn send_rst(&self, key: &FourTuple, packet: &TcpPacket<'_>) {
        let mut ack = seq::add(packet.seq, packet.payload.len() as u32);
        if packet.flags & (TCP_SYN | TCP_FIN) != 0 {
            ack = seq::add(ack, 1);
        }
        let seq = if packet.flags & TCP_ACK != 0 {
            packet.ack
        } else {
            0
        };
        self.shared.send_tcp_to_guest(
            key,
            TcpBuild {
                src_port: key.dst_port,
                dst_port: key.src_port,
                seq,
                ack,
                flags: TCP_RST | TCP_ACK,
                window: 0,
                payload: &[],
                ..Default::default()
            },
        );
    }

    /// Listen for guest connections to `(host_ip, port)`.
    pub fn listen(&self, port: u16) -> Result<TcpListener, NetError> {
        let mut listeners = self.shared.listeners.lock();
        if listeners.contains_key(&port) {
            return Err(NetError::PortInUse(port));
        }
        let (tx, rx) = crossbeam_channel::unbounded();
        listeners.insert(port, tx);
        Ok(TcpListener {
            port,
            rx,
            stack: Arc::downgrade(&self.shared),
        })
    }

    /// Bind a queued UDP endpoint on `port`.
    pub fn bind_udp(&self, port: u16) -> Result<UdpSocket, NetError> {
        let mut ports = self.shared.udp_ports.lock();
        if ports.contains_key(&port) {
            return Err(NetError::PortInUse(port));
        }
        let (tx, rx) = crossbeam_channel::bounded(udp::QUEUE_DEPTH);
        ports.insert(port, UdpEndpoint::Queued(tx));
        Ok(UdpSocket::new(port, rx, Arc::downgrade(&self.shared)))
    }

    /// Bind a callback UDP endpoint on `port`; the handler runs inline on
    /// the delivery thread and must copy anything it retains.
    pub fn bind_udp_callback(
        &self,
        port: u16,
        handler: impl Fn(&[u8], SocketAddrV4) + Send + Sync + 'static,
    ) -> Result<(), NetError> {
        let mut ports = self.shared.udp_ports.lock();
        if ports.contains_key(&port) {
            return Err(NetError::PortInUse(port));
        }
        ports.insert(port, UdpEndpoint::Callback(Arc::new(handler)));
        Ok(())
    }

    /// Send a UDP datagram from `(host_ip, src_port)` without binding.
    pub fn send_udp(&self, src_port: u16, dst: SocketAddrV4, payload: &[u8]) {
        self.shared.send_udp_to_guest(src_port, dst, payload);
    }

    /// Toggle guest access to destinations beyond the host.
    pub fn set_allow_internet(&self, allow: bool) {
        self.shared.allow_internet.store(allow, Ordering::Relaxed);
    }

    pub fn allow_internet(&self) -> bool {
        self.shared.allow_internet.load(Ordering::Relaxed)
    }

    /// Toggle the service-localhost proxy; disabled, service SYNs reset.
    pub fn set_proxy_enabled(&self, enabled: bool) {
        self.shared.proxy_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Start capturing every frame crossing the interface.
    pub fn enable_capture(&self, writer: impl Write + Send + 'static) {
        *self.shared.capture.lock() = Some(pcap::PcapHandle::new(Box::new(writer)));
    }

    /// Capture counters, if capture is enabled.
    pub fn capture_stats(&self) -> Option<PcapStats> {
        self.shared.capture.lock().as_ref().map(|c| c.stats())
    }

    pub fn stats(&self) -> NetstackStats {
        NetstackStats {
            frames_in: self.shared.counters.frames_in.load(Ordering::Relaxed),
            frames_out: self.shared.counters.frames_out.load(Ordering::Relaxed),
            l2_drops: self.shared.counters.l2_drops.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &NetstackConfig {
        &self.shared.config
    }

    pub(crate) fn shared(&self) -> &Arc<StackShared> {
        &self.shared
    }

    /// Close every endpoint and listener and release the NIC.
    pub fn close(&self) {
        let shared = &self.shared;
        shared.closed.store(true, Ordering::Relaxed);
        shared.listeners.lock().clear();
        shared.udp_ports.lock().clear();
        shared.conns.lock().clear();
        *shared.backend.lock() = None;
    }
}

impl Drop for Netstack {
    fn drop(&mut self) {
        self.close();
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
    }
}

fn timer_loop(shared: Arc<StackShared>) {
    while !shared.closed.load(Ordering::Relaxed) {
        std::thread::sleep(TIMER_TICK);

        let conns: Vec<(FourTuple, Arc<TcpConn>)> = shared
            .conns
            .lock()
            .iter()
            .map(|(k, v)| (*k, Arc::clone(v)))
            .collect();

        let now = std::time::Instant::now();
        let mut dead = Vec::new();
        for (key, conn) in conns {
            if conn.on_timer(now) {
                dead.push(key);
            }
        }
        if !dead.is_empty() {
            let mut table = shared.conns.lock();
            for key in dead {
                if table.get(&key).is_some_and(|c| c.is_closed()) {
                    trace!(%key, "connection released");
                    table.remove(&key);
                }
            }
        }
    }
}
