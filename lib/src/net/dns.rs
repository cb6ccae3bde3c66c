//! DNS responder on the stack's UDP port 53.
//!
//! Answers A queries for the `*.internal` names with the stack's configured
//! addresses. Other names fall through to the host resolver when internet
//! access is allowed, and to NXDOMAIN otherwise. Non-A questions get a
//! response with no answer records.

use std::{
    net::{Ipv4Addr, SocketAddrV4, ToSocketAddrs},
    sync::{atomic::Ordering, Arc},
};

use tracing::{debug, trace, warn};

use super::{Netstack, StackShared};
use crate::error::NetError;

/// The names this responder owns.
pub const HOST_NAME: &str = "host.internal";
pub const GUEST_NAME: &str = "guest.internal";
pub const SERVICE_NAME: &str = "service.internal";

const QTYPE_A: u16 = 1;
const QCLASS_IN: u16 = 1;
const RCODE_NXDOMAIN: u8 = 3;

/// TTL on answers; guests re-resolve cheaply.
const ANSWER_TTL: u32 = 60;

/// Bind the responder on port 53 of `stack`.
pub fn serve(stack: &Netstack) -> Result<(), NetError> {
    let shared = Arc::downgrade(stack.shared());
    stack.bind_udp_callback(53, move |query, remote| {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        handle_query(shared, query, remote);
    })
}

fn handle_query(shared: Arc<StackShared>, query: &[u8], remote: SocketAddrV4) {
    let Some(question) = Question::parse(query) else {
        trace!("unparseable dns query");
        return;
    };

    // Non-A questions get a response carrying no answer.
    if question.qtype != QTYPE_A || question.qclass != QCLASS_IN {
        let response = question.respond(0, None);
        shared.send_udp_to_guest(53, remote, &response);
        return;
    }

    let (host_ip, guest_ip, service_ip) = {
        let config = shared.config();
        (config.host_ip, config.guest_ip, config.service_ip)
    };
    let known = match question.name.as_str() {
        HOST_NAME => Some(host_ip),
        GUEST_NAME => Some(guest_ip),
        SERVICE_NAME => Some(service_ip),
        _ => None,
    };
    let answer = match known {
        Some(ip) => Some(ip),
        None if shared.allow_internet().load(Ordering::Relaxed) => {
            // Host resolution can block; keep the delivery thread free.
            std::thread::spawn(move || {
                let answer = resolve_host(&question.name);
                let rcode = if answer.is_some() { 0 } else { RCODE_NXDOMAIN };
                let response = question.respond(rcode, answer);
                shared.send_udp_to_guest(53, remote, &response);
            });
            return;
        }
        None => None,
    };

    debug!(name = %question.name, ?answer, "dns query");
    let rcode = if answer.is_some() { 0 } else { RCODE_NXDOMAIN };
    let response = question.respond(rcode, answer);
    shared.send_udp_to_guest(53, remote, &response);
}

/// Resolve through the host's resolver, returning the first A record.
fn resolve_host(name: &str) -> Option<Ipv4Addr> {
    match (name, 0u16).to_socket_addrs() {
        Ok(addrs) => addrs.filter_map(|addr| match addr {
            std::net::SocketAddr::V4(v4) => Some(*v4.ip()),
            std::net::SocketAddr::V6(_) => None,
        })
        .next(),
        Err(err) => {
            warn!(%name, ?err, "host resolution failed");
            None
        }
    }
}

/// The first question of a query, plus what a response needs to echo.
struct Question {
    id: u16,
    /// Recursion-desired bit from the query, echoed back.
    rd: bool,
    /// Lowercased name with the trailing dot stripped.
    name: String,
    qtype: u16,
    qclass: u16,
    /// The raw question section, echoed verbatim.
    question_bytes: Vec<u8>,
}

impl Question {
    fn parse(query: &[u8]) -> Option<Self> {
        if query.len() < 12 {
            return None;
        }
        let id = u16::from_be_bytes([query[0], query[1]]);
        let flags = u16::from_be_bytes([query[2], query[3]]);
        // Responses are not questions.
        if flags & 0x8000 != 0 {
            return None;
        }
        let qdcount = u16::from_be_bytes([query[4], query[5]]);
        if qdcount == 0 {
            return None;
        }

        let mut labels = Vec::new();
        let mut pos = 12;
        loop {
            let len = *query.get(pos)? as usize;
            pos += 1;
            if len == 0 {
                break;
            }
            // Compression pointers never appear in a question name.
            if len & 0xc0 != 0 {
                return None;
            }
            let label = query.get(pos..pos + len)?;
            labels.push(String::from_utf8_lossy(label).to_string());
            pos += len;
        }
        let qtype = u16::from_be_bytes([*query.get(pos)?, *query.get(pos + 1)?]);
        let qclass = u16::from_be_bytes([*query.get(pos + 2)?, *query.get(pos + 3)?]);

        let name = labels
            .join(".")
            .to_ascii_lowercase()
            .trim_end_matches('.')
            .to_string();

        Some(Self {
            id,
            rd: flags & 0x0100 != 0,
            name,
            qtype,
            qclass,
            question_bytes: query[12..pos + 4].to_vec(),
        })
    }

    /// Build the response: echoed question, optional single A answer.
    fn respond(&self, rcode: u8, answer: Option<Ipv4Addr>) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.question_bytes.len() + 16);
        out.extend_from_slice(&self.id.to_be_bytes());

        // QR | (RD from query) | RA | rcode.
        let mut flags: u16 = 0x8080;
        if self.rd {
            flags |= 0x0100;
        }
        flags |= rcode as u16;
        out.extend_from_slice(&flags.to_be_bytes());

        out.extend_from_slice(&1u16.to_be_bytes()); // qdcount
        out.extend_from_slice(&(answer.is_some() as u16).to_be_bytes()); // ancount
        out.extend_from_slice(&0u16.to_be_bytes()); // nscount
        out.extend_from_slice(&0u16.to_be_bytes()); // arcount
        out.extend_from_slice(&self.question_bytes);

        if let Some(ip) = answer {
            // Pointer back to the name at offset 12.
            out.extend_from_slice(&[0xc0, 0x0c]);
            out.extend_from_slice(&QTYPE_A.to_be_bytes());
            out.extend_from_slice(&QCLASS_IN.to_be_bytes());
            out.extend_from_slice(&ANSWER_TTL.to_be_bytes());
            out.extend_from_slice(&4u16.to_be_bytes());
            out.extend_from_slice(&ip.octets());
        }
        out
    }
}

/// Build a query for tests and callers that drive the stack directly.
#[doc(hidden)]
pub fn build_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&0x0100u16.to_be_bytes()); // recursion desired
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&[0; 6]);
    for label in name.trim_end_matches('.').split('.') {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out.extend_from_slice(&qtype.to_be_bytes());
    out.extend_from_slice(&QCLASS_IN.to_be_bytes());
    out
}
