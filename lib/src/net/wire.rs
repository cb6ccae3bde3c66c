//! Ethernet, ARP, IPv4, ICMP, UDP and TCP codecs.
//!
//! Parsers borrow from the delivered frame; builders allocate the full frame
//! so the transmit path hands the backend a buffer it is free to copy or
//! drop. All multi-byte fields are network byte order.

use std::net::Ipv4Addr;

/// EtherType for IPv4.
pub const ETHERTYPE_IPV4: u16 = 0x0800;

/// EtherType for ARP.
pub const ETHERTYPE_ARP: u16 = 0x0806;

/// IPv4 protocol numbers.
pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// ARP opcodes.
pub const ARP_REQUEST: u16 = 1;
pub const ARP_REPLY: u16 = 2;

/// TCP flag bits.
pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;

/// A MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mac(pub [u8; 6]);

impl Mac {
    pub const BROADCAST: Mac = Mac([0xff; 6]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl std::fmt::Display for Mac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// A parsed Ethernet frame.
#[derive(Debug, Clone, Copy)]
pub struct EthernetFrame<'a> {
    pub dst: Mac,
    pub src: Mac,
    pub ethertype: u16,
    pub payload: &'a [u8],
}

impl<'a> EthernetFrame<'a> {
    pub fn parse(frame: &'a [u8]) -> Option<Self> {
        if frame.len() < 14 {
            return None;
        }
        Some(Self {
            dst: Mac(frame[0..6].try_into().ok()?),
            src: Mac(frame[6..12].try_into().ok()?),
            ethertype: u16::from_be_bytes([frame[12], frame[13]]),
            payload: &frame[14..],
        })
    }
}

/// Build an Ethernet frame around `payload`.
pub fn eth(dst: Mac, src: Mac, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(14 + payload.len());
    frame.extend_from_slice(&dst.0);
    frame.extend_from_slice(&src.0);
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// A parsed ARP packet (Ethernet/IPv4 only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub op: u16,
    pub sender_mac: Mac,
    pub sender_ip: Ipv4Addr,
    pub target_mac: Mac,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 28 {
            return None;
        }
        // Hardware type Ethernet, protocol IPv4, 6/4 address lengths.
        if payload[0..2] != [0, 1] || payload[2..4] != [8, 0] || payload[4] != 6 || payload[5] != 4
        {
            return None;
        }
        Some(Self {
            op: u16::from_be_bytes([payload[6], payload[7]]),
            sender_mac: Mac(payload[8..14].try_into().ok()?),
            sender_ip: Ipv4Addr::new(payload[14], payload[15], payload[16], payload[17]),
            target_mac: Mac(payload[18..24].try_into().ok()?),
            target_ip: Ipv4Addr::new(payload[24], payload[25], payload[26], payload[27]),
        })
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(28);
        out.extend_from_slice(&[0, 1, 8, 0, 6, 4]);
        out.extend_from_slice(&self.op.to_be_bytes());
        out.extend_from_slice(&self.sender_mac.0);
        out.extend_from_slice(&self.sender_ip.octets());
        out.extend_from_slice(&self.target_mac.0);
        out.extend_from_slice(&self.target_ip.octets());
        out
    }
}

/// A parsed IPv4 packet.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Packet<'a> {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
    pub payload: &'a [u8],
}

impl<'a> Ipv4Packet<'a> {
    pub fn parse(packet: &'a [u8]) -> Option<Self> {
        if packet.len() < 20 || packet[0] >> 4 != 4 {
            return None;
        }
        let ihl = ((packet[0] & 0x0f) as usize) * 4;
        let total = u16::from_be_bytes([packet[2], packet[3]]) as usize;
        if ihl < 20 || packet.len() < total || total < ihl {
            return None;
        }
        if checksum(&packet[..ihl]) != 0 {
            return None;
        }
        Some(Self {
            src: Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]),
            dst: Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]),
            proto: packet[9],
            payload: &packet[ihl..total],
        })
    }
}

/// Build an IPv4 packet (no options, DF set) around `payload`.
pub fn ipv4(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, payload: &[u8]) -> Vec<u8> {
    let total = 20 + payload.len();
    let mut out = Vec::with_capacity(total);
    out.push(0x45);
    out.push(0);
    out.extend_from_slice(&(total as u16).to_be_bytes());
    out.extend_from_slice(&[0, 0]); // identification
    out.extend_from_slice(&[0x40, 0]); // don't fragment
    out.push(64); // ttl
    out.push(proto);
    out.extend_from_slice(&[0, 0]); // checksum placeholder
    out.extend_from_slice(&src.octets());
    out.extend_from_slice(&dst.octets());
    let sum = checksum(&out[..20]);
    out[10..12].copy_from_slice(&sum.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// RFC 1071 ones-complement checksum.
pub fn checksum(data: &[u8]) -> u16 {
    finish_checksum(sum_words(data, 0))
}

/// Checksum with the IPv4 pseudo-header folded in, for UDP and TCP.
pub fn pseudo_checksum(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, payload: &[u8]) -> u16 {
    let mut sum = sum_words(&src.octets(), 0);
    sum = sum_words(&dst.octets(), sum);
    sum += proto as u32;
    sum += payload.len() as u32;
    finish_checksum(sum_words(payload, sum))
}

fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

fn finish_checksum(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// A parsed ICMP message.
#[derive(Debug, Clone, Copy)]
pub struct IcmpPacket<'a> {
    pub kind: u8,
    pub code: u8,
    /// Header rest plus payload, checksum already verified.
    pub rest: &'a [u8],
}

impl<'a> IcmpPacket<'a> {
    /// Parse and verify the checksum; corrupt messages are dropped.
    pub fn parse(payload: &'a [u8]) -> Option<Self> {
        if payload.len() < 8 || checksum(payload) != 0 {
            return None;
        }
        Some(Self {
            kind: payload[0],
            code: payload[1],
            rest: &payload[4..],
        })
    }
}

/// Build an ICMP message with its checksum.
pub fn icmp(kind: u8, code: u8, rest: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + rest.len());
    out.push(kind);
    out.push(code);
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(rest);
    let sum = checksum(&out);
    out[2..4].copy_from_slice(&sum.to_be_bytes());
    out
}

/// A parsed UDP datagram.
#[derive(Debug, Clone, Copy)]
pub struct UdpDatagram<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

impl<'a> UdpDatagram<'a> {
    /// Parse and verify the pseudo-header checksum. A checksum field of zero
    /// means the sender did not compute one (RFC 768) and is accepted.
    pub fn parse(src: Ipv4Addr, dst: Ipv4Addr, payload: &'a [u8]) -> Option<Self> {
        if payload.len() < 8 {
            return None;
        }
        let length = u16::from_be_bytes([payload[4], payload[5]]) as usize;
        if length < 8 || payload.len() < length {
            return None;
        }
        let sum = u16::from_be_bytes([payload[6], payload[7]]);
        if sum != 0 && pseudo_checksum(src, dst, PROTO_UDP, &payload[..length]) != 0 {
            return None;
        }
        Some(Self {
            src_port: u16::from_be_bytes([payload[0], payload[1]]),
            dst_port: u16::from_be_bytes([payload[2], payload[3]]),
            payload: &payload[8..length],
        })
    }
}

/// Build a UDP datagram with its pseudo-header checksum. A computed checksum
/// of zero transmits as 0xffff so receivers do not mistake it for "omitted".
pub fn udp(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let length = 8 + payload.len();
    let mut out = Vec::with_capacity(length);
    out.extend_from_slice(&src_port.to_be_bytes());
    out.extend_from_slice(&dst_port.to_be_bytes());
    out.extend_from_slice(&(length as u16).to_be_bytes());
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(payload);
    let sum = pseudo_checksum(src, dst, PROTO_UDP, &out);
    let sum = if sum == 0 { 0xffff } else { sum };
    out[6..8].copy_from_slice(&sum.to_be_bytes());
    out
}

/// A parsed TCP segment with the options this stack understands.
#[derive(Debug, Clone, Copy)]
pub struct TcpPacket<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    pub payload: &'a [u8],
}

impl<'a> TcpPacket<'a> {
    /// Parse and verify the pseudo-header checksum. Only the MSS and window
    /// scale options are interpreted; everything else is skipped.
    pub fn parse(src: Ipv4Addr, dst: Ipv4Addr, payload: &'a [u8]) -> Option<Self> {
        if payload.len() < 20 {
            return None;
        }
        if pseudo_checksum(src, dst, PROTO_TCP, payload) != 0 {
            return None;
        }
        let data_offset = ((payload[12] >> 4) as usize) * 4;
        if data_offset < 20 || payload.len() < data_offset {
            return None;
        }

        let mut mss = None;
        let mut window_scale = None;
        let mut options = &payload[20..data_offset];
        while let [kind, rest @ ..] = options {
            match kind {
                0 => break,
                1 => options = rest,
                2 => {
                    if let [4, hi, lo, rest @ ..] = rest {
                        mss = Some(u16::from_be_bytes([*hi, *lo]));
                        options = rest;
                    } else {
                        break;
                    }
                }
                3 => {
                    if let [3, shift, rest @ ..] = rest {
                        window_scale = Some(*shift);
                        options = rest;
                    } else {
                        break;
                    }
                }
                _ => {
                    // kind, length, data
                    let [length, rest @ ..] = rest else { break };
                    let skip = (*length as usize).saturating_sub(2);
                    if rest.len() < skip {
                        break;
                    }
                    options = &rest[skip..];
                }
            }
        }

        Some(Self {
            src_port: u16::from_be_bytes([payload[0], payload[1]]),
            dst_port: u16::from_be_bytes([payload[2], payload[3]]),
            seq: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
            ack: u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]),
            flags: payload[13],
            window: u16::from_be_bytes([payload[14], payload[15]]),
            mss,
            window_scale,
            payload: &payload[data_offset..],
        })
    }
}

/// Fields for building a TCP segment.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpBuild<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    /// MSS option, carried on SYN-ACK only.
    pub mss: Option<u16>,
    /// Window scale option, echoed only if the peer offered one.
    pub window_scale: Option<u8>,
    pub payload: &'a [u8],
}

/// Build a TCP segment with its pseudo-header checksum.
pub fn tcp(src: Ipv4Addr, dst: Ipv4Addr, build: TcpBuild<'_>) -> Vec<u8> {
    let mut options = Vec::new();
    if let Some(mss) = build.mss {
        options.extend_from_slice(&[2, 4]);
        options.extend_from_slice(&mss.to_be_bytes());
    }
    if let Some(shift) = build.window_scale {
        options.extend_from_slice(&[3, 3, shift, 1]);
    }
    while options.len() % 4 != 0 {
        options.push(0);
    }

    let data_offset = 20 + options.len();
    let mut out = Vec::with_capacity(data_offset + build.payload.len());
    out.extend_from_slice(&build.src_port.to_be_bytes());
    out.extend_from_slice(&build.dst_port.to_be_bytes());
    out.extend_from_slice(&build.seq.to_be_bytes());
    out.extend_from_slice(&build.ack.to_be_bytes());
    out.push(((data_offset / 4) as u8) << 4);
    out.push(build.flags);
    out.extend_from_slice(&build.window.to_be_bytes());
    out.extend_from_slice(&[0, 0, 0, 0]); // checksum, urgent pointer
    out.extend_from_slice(&options);
    out.extend_from_slice(build.payload);

    let sum = pseudo_checksum(src, dst, PROTO_TCP, &out);
    out[16..18].copy_from_slice(&sum.to_be_bytes());
    out
}
