//! Bridges guest connections to host TCP sockets.
//!
//! Connections whose destination is the service IP dial the same port on
//! host loopback; when internet access is allowed, connections to other
//! addresses dial the real destination. The bridge is a pair of copy loops
//! joined on either side's EOF.

use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    time::Duration,
};

use tracing::{debug, warn};

use super::tcp::{OnEstablished, TcpSocket};

/// Dial timeout for the host-side connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the on-established callback bridging a guest connection to
/// `target`.
pub(crate) fn bridge(target: SocketAddr) -> OnEstablished {
    Box::new(move |socket: TcpSocket| {
        let stream = match TcpStream::connect_timeout(&target, CONNECT_TIMEOUT) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%target, ?err, "proxy dial failed");
                socket.close();
                return;
            }
        };
        debug!(%target, peer = %socket.peer(), "proxy established");
        run(socket, stream, target);
    })
}

fn run(socket: TcpSocket, stream: TcpStream, target: SocketAddr) {
    let guest_to_host = {
        let socket = socket.clone();
        let mut stream = match stream.try_clone() {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%target, ?err, "proxy clone failed");
                socket.close();
                return;
            }
        };
        std::thread::spawn(move || {
            loop {
                match socket.recv() {
                    Ok(data) if data.is_empty() => break, // EOF
                    Ok(data) => {
                        if stream.write_all(&data).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = stream.shutdown(std::net::Shutdown::Write);
        })
    };

    // Host to guest on this thread.
    let mut stream = stream;
    let mut buf = [0u8; 32 * 1024];
    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if socket.send(&buf[..n]).is_err() {
                    break;
                }
            }
        }
    }
    socket.close();

    let _ = guest_to_host.join();
    debug!(%target, "proxy finished");
}
