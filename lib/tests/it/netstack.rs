//! End-to-end network stack scenarios driven through the frame interface.

use std::{
    net::Ipv4Addr,
    time::Duration,
};

use skiff_lib::net::{
    dns,
    wire::{
        self, ArpPacket, EthernetFrame, Ipv4Packet, Mac, TcpBuild, TcpPacket, UdpDatagram,
        ARP_REPLY, ARP_REQUEST, ETHERTYPE_ARP, ETHERTYPE_IPV4, PROTO_TCP, PROTO_UDP, TCP_ACK,
        TCP_FIN, TCP_PSH, TCP_RST, TCP_SYN,
    },
    Netstack, NetstackConfig,
};

const HOST_IP: Ipv4Addr = Ipv4Addr::new(10, 42, 0, 1);
const GUEST_IP: Ipv4Addr = Ipv4Addr::new(10, 42, 0, 2);
const SERVICE_IP: Ipv4Addr = Ipv4Addr::new(10, 42, 0, 3);
const GUEST_MAC: Mac = Mac([0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]);

struct Harness {
    stack: Netstack,
    rx: crossbeam_channel::Receiver<Vec<u8>>,
}

/// A TCP segment captured on its way to the guest.
#[derive(Debug, Clone)]
struct GuestSegment {
    src_ip: Ipv4Addr,
    flags: u8,
    seq: u32,
    ack: u32,
    payload: Vec<u8>,
}

fn harness(allow_internet: bool) -> Harness {
    let stack = Netstack::new(
        NetstackConfig::builder()
            .host_ip(HOST_IP)
            .guest_ip(GUEST_IP)
            .service_ip(SERVICE_IP)
            .allow_internet(allow_internet)
            .build(),
    );
    let (tx, rx) = crossbeam_channel::unbounded();
    stack.attach_backend(move |frame| {
        let _ = tx.send(frame.to_vec());
    });
    Harness { stack, rx }
}

impl Harness {
    fn host_mac(&self) -> Mac {
        self.stack.config().host_mac
    }

    fn deliver_tcp(&self, dst_ip: Ipv4Addr, build: TcpBuild<'_>) {
        let segment = wire::tcp(GUEST_IP, dst_ip, build);
        let packet = wire::ipv4(GUEST_IP, dst_ip, PROTO_TCP, &segment);
        let frame = wire::eth(self.host_mac(), GUEST_MAC, ETHERTYPE_IPV4, &packet);
        self.stack.deliver_from_guest(&frame);
    }

    fn deliver_udp(&self, dst_port: u16, src_port: u16, payload: &[u8]) {
        let datagram = wire::udp(GUEST_IP, HOST_IP, src_port, dst_port, payload);
        let packet = wire::ipv4(GUEST_IP, HOST_IP, PROTO_UDP, &datagram);
        let frame = wire::eth(self.host_mac(), GUEST_MAC, ETHERTYPE_IPV4, &packet);
        self.stack.deliver_from_guest(&frame);
    }

    fn next_frame(&self) -> Vec<u8> {
        self.rx
            .recv_timeout(Duration::from_secs(5))
            .expect("expected a frame from the stack")
    }

    fn next_tcp(&self) -> GuestSegment {
        loop {
            let frame = self.next_frame();
            let eth = EthernetFrame::parse(&frame).expect("ethernet");
            if eth.ethertype != ETHERTYPE_IPV4 {
                continue;
            }
            let ip = Ipv4Packet::parse(eth.payload).expect("ipv4");
            if ip.proto != PROTO_TCP {
                continue;
            }
            let tcp = TcpPacket::parse(ip.src, ip.dst, ip.payload).expect("tcp");
            return GuestSegment {
                src_ip: ip.src,
                flags: tcp.flags,
                seq: tcp.seq,
                ack: tcp.ack,
                payload: tcp.payload.to_vec(),
            };
        }
    }

    fn next_udp(&self) -> (u16, u16, Vec<u8>) {
        loop {
            let frame = self.next_frame();
            let eth = EthernetFrame::parse(&frame).expect("ethernet");
            if eth.ethertype != ETHERTYPE_IPV4 {
                continue;
            }
            let ip = Ipv4Packet::parse(eth.payload).expect("ipv4");
            if ip.proto != PROTO_UDP {
                continue;
            }
            let udp = UdpDatagram::parse(ip.src, ip.dst, ip.payload).expect("udp");
            return (udp.src_port, udp.dst_port, udp.payload.to_vec());
        }
    }

    /// Drive the handshake for a guest-initiated connection, returning the
    /// guest's next seq and the host's next seq.
    fn open(&self, dst_ip: Ipv4Addr, src_port: u16, dst_port: u16, iss: u32) -> (u32, u32) {
        self.deliver_tcp(
            dst_ip,
            TcpBuild {
                src_port,
                dst_port,
                seq: iss,
                flags: TCP_SYN,
                window: 0xffff,
                mss: Some(1460),
                ..Default::default()
            },
        );
        let syn_ack = self.next_tcp();
        assert_eq!(syn_ack.flags & (TCP_SYN | TCP_ACK), TCP_SYN | TCP_ACK);
        assert_eq!(syn_ack.ack, iss.wrapping_add(1));

        let guest_seq = iss.wrapping_add(1);
        let host_seq = syn_ack.seq.wrapping_add(1);
        self.deliver_tcp(
            dst_ip,
            TcpBuild {
                src_port,
                dst_port,
                seq: guest_seq,
                ack: host_seq,
                flags: TCP_ACK,
                window: 0xffff,
                ..Default::default()
            },
        );
        (guest_seq, host_seq)
    }
}

#[test_log::test]
fn arp_request_is_answered_for_service_ip() {
    let h = harness(false);
    let request = ArpPacket {
        op: ARP_REQUEST,
        sender_mac: GUEST_MAC,
        sender_ip: GUEST_IP,
        target_mac: Mac([0; 6]),
        target_ip: SERVICE_IP,
    };
    let frame = wire::eth(Mac::BROADCAST, GUEST_MAC, ETHERTYPE_ARP, &request.build());
    h.stack.deliver_from_guest(&frame);

    let reply = h.next_frame();
    let eth = EthernetFrame::parse(&reply).expect("ethernet");
    assert_eq!(eth.dst, GUEST_MAC);
    let arp = ArpPacket::parse(eth.payload).expect("arp");
    assert_eq!(arp.op, ARP_REPLY);
    assert_eq!(arp.sender_ip, SERVICE_IP);
}

#[test_log::test]
fn stream_to_guest_delivers_exactly_once_in_order() {
    let h = harness(false);
    let listener = h.stack.listen(7000).expect("listen");

    let (guest_seq, mut expect_host) = h.open(HOST_IP, 41000, 7000, 5000);
    let socket = listener
        .accept_timeout(Duration::from_secs(2))
        .expect("accept");

    // A payload far larger than the initial window forces the writer to
    // block on acks.
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i * 31 % 251) as u8).collect();
    let writer = {
        let socket = socket.clone();
        let payload = payload.clone();
        std::thread::spawn(move || {
            socket.send(&payload).expect("send stream");
            socket.close();
        })
    };

    let mut received = Vec::new();
    let mut fin_acked = false;
    while !fin_acked {
        let segment = h.next_tcp();
        if segment.flags & TCP_RST != 0 {
            panic!("unexpected RST");
        }

        let mut ack = expect_host;
        if segment.seq == expect_host && !segment.payload.is_empty() {
            received.extend_from_slice(&segment.payload);
            expect_host = expect_host.wrapping_add(segment.payload.len() as u32);
            ack = expect_host;
        } else if !segment.payload.is_empty() {
            // Retransmission or reordering: re-ack the edge, keep nothing.
            ack = expect_host;
        }
        if segment.flags & TCP_FIN != 0 && segment.seq == expect_host {
            ack = expect_host.wrapping_add(1);
            fin_acked = true;
        }

        h.deliver_tcp(
            HOST_IP,
            TcpBuild {
                src_port: 41000,
                dst_port: 7000,
                seq: guest_seq,
                ack,
                flags: TCP_ACK,
                window: 0xffff,
                ..Default::default()
            },
        );
    }

    writer.join().expect("join writer");
    // The stream arrives complete, in order, with no duplicates.
    assert_eq!(received.len(), payload.len());
    assert_eq!(received, payload);
}

#[test_log::test]
fn write_deadline_is_enforced() {
    let h = harness(false);
    let listener = h.stack.listen(7001).expect("listen");

    // Handshake advertising a zero window: nothing may be sent.
    h.deliver_tcp(
        HOST_IP,
        TcpBuild {
            src_port: 41001,
            dst_port: 7001,
            seq: 100,
            flags: TCP_SYN,
            window: 0,
            ..Default::default()
        },
    );
    let syn_ack = h.next_tcp();
    h.deliver_tcp(
        HOST_IP,
        TcpBuild {
            src_port: 41001,
            dst_port: 7001,
            seq: 101,
            ack: syn_ack.seq.wrapping_add(1),
            flags: TCP_ACK,
            window: 0,
            ..Default::default()
        },
    );
    let mut socket = listener
        .accept_timeout(Duration::from_secs(2))
        .expect("accept");

    socket.set_write_timeout(Some(Duration::from_millis(50)));
    let err = socket.send(b"blocked").expect_err("window is closed");
    assert!(err.is_timeout());
}

#[test_log::test]
fn syn_to_external_destination_is_reset_without_internet() {
    let h = harness(false);
    h.deliver_tcp(
        Ipv4Addr::new(93, 184, 216, 34),
        TcpBuild {
            src_port: 41002,
            dst_port: 80,
            seq: 700,
            flags: TCP_SYN,
            window: 0xffff,
            ..Default::default()
        },
    );
    let reply = h.next_tcp();
    assert_ne!(reply.flags & TCP_RST, 0);
    assert_eq!(reply.src_ip, Ipv4Addr::new(93, 184, 216, 34));
    assert_eq!(reply.ack, 701);
}

#[test_log::test]
fn disabled_proxy_resets_service_connections() {
    let h = harness(false);
    h.stack.set_proxy_enabled(false);
    h.deliver_tcp(
        SERVICE_IP,
        TcpBuild {
            src_port: 41003,
            dst_port: 8080,
            seq: 900,
            flags: TCP_SYN,
            window: 0xffff,
            ..Default::default()
        },
    );
    let reply = h.next_tcp();
    assert_ne!(reply.flags & TCP_RST, 0);
}

#[test_log::test]
fn service_proxy_bridges_to_loopback() {
    let h = harness(false);

    // A host-side service on loopback; the guest reaches it via service IP.
    let server = std::net::TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let port = server.local_addr().expect("addr").port();
    let server_thread = std::thread::spawn(move || {
        use std::io::{Read, Write};
        let (mut stream, _) = server.accept().expect("accept");
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).expect("read ping");
        assert_eq!(&buf, b"ping");
        stream.write_all(b"pong").expect("write pong");
    });

    let (guest_seq, host_seq) = h.open(SERVICE_IP, 41004, port, 42);

    h.deliver_tcp(
        SERVICE_IP,
        TcpBuild {
            src_port: 41004,
            dst_port: port,
            seq: guest_seq,
            ack: host_seq,
            flags: TCP_PSH | TCP_ACK,
            window: 0xffff,
            payload: b"ping",
            ..Default::default()
        },
    );

    // Collect until the proxied response shows up; ack everything.
    let mut pong = Vec::new();
    let mut expect_host = host_seq;
    while pong.len() < 4 {
        let segment = h.next_tcp();
        if segment.seq == expect_host && !segment.payload.is_empty() {
            pong.extend_from_slice(&segment.payload);
            expect_host = expect_host.wrapping_add(segment.payload.len() as u32);
            h.deliver_tcp(
                SERVICE_IP,
                TcpBuild {
                    src_port: 41004,
                    dst_port: port,
                    seq: guest_seq.wrapping_add(4),
                    ack: expect_host,
                    flags: TCP_ACK,
                    window: 0xffff,
                    ..Default::default()
                },
            );
        }
    }
    assert_eq!(pong, b"pong");
    server_thread.join().expect("server thread");
}

#[test_log::test]
fn dns_split_resolution() {
    let h = harness(false);
    dns::serve(&h.stack).expect("bind dns");

    // host.internal resolves to the configured address with no external call.
    h.deliver_udp(53, 5353, &dns::build_query(7, "host.internal", 1));
    let (src_port, dst_port, response) = h.next_udp();
    assert_eq!(src_port, 53);
    assert_eq!(dst_port, 5353);
    assert_eq!(response[3] & 0x0f, 0, "expected NOERROR");
    assert_eq!(&response[response.len() - 4..], &HOST_IP.octets());

    // guest.internal and service.internal answer likewise.
    h.deliver_udp(53, 5353, &dns::build_query(8, "service.internal", 1));
    let (_, _, response) = h.next_udp();
    assert_eq!(&response[response.len() - 4..], &SERVICE_IP.octets());

    // Anything else is NXDOMAIN while the internet is disabled.
    h.deliver_udp(53, 5353, &dns::build_query(9, "example.com", 1));
    let (_, _, response) = h.next_udp();
    assert_eq!(response[3] & 0x0f, 3, "expected NXDOMAIN");
    assert_eq!(&response[6..8], &0u16.to_be_bytes(), "no answers");
}

#[test_log::test]
fn non_a_questions_get_no_answer() {
    let h = harness(false);
    dns::serve(&h.stack).expect("bind dns");

    // An AAAA (28) question is ignored: response carries no answer records.
    h.deliver_udp(53, 5353, &dns::build_query(10, "host.internal", 28));
    let (_, _, response) = h.next_udp();
    assert_eq!(&response[6..8], &0u16.to_be_bytes());
}

#[test_log::test]
fn capture_counts_frames() {
    let h = harness(false);
    h.stack.enable_capture(std::io::sink());

    let request = ArpPacket {
        op: ARP_REQUEST,
        sender_mac: GUEST_MAC,
        sender_ip: GUEST_IP,
        target_mac: Mac([0; 6]),
        target_ip: HOST_IP,
    };
    let frame = wire::eth(Mac::BROADCAST, GUEST_MAC, ETHERTYPE_ARP, &request.build());
    h.stack.deliver_from_guest(&frame);
    let _reply = h.next_frame();

    let stats = h.stack.capture_stats().expect("capture enabled");
    // Both directions cross the tap.
    assert_eq!(stats.captured, 2);
    assert_eq!(stats.dropped, 0);
}
