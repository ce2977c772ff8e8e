// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! TCP listener and per-connection I/O, framed with the same `HttpFramer`
//! used for the USB side. Grounded on the original `tcp.c`'s dual-stack
//! listener and port-selection-loop behavior, reimplemented on
//! `std::net` with explicit read timeouts instead of `select(2)`.

use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener as StdTcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{info, warn};

use crate::error::{Error, Result};
use crate::framer::{HttpFramer, Message, Packet};

/// IANA ephemeral port range start, used when upward port search wraps.
const EPHEMERAL_PORT_BASE: u16 = 49152;
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(200);
const READ_TIMEOUT: Duration = Duration::from_secs(3);

fn interface_address(interface: &str, v6: bool) -> Result<IpAddr> {
    // Loopback is overwhelmingly the common case (the CLI default is "lo")
    // and is all the bridge needs to support without pulling in a netlink
    // dependency purely to resolve interface names to addresses.
    if interface == "lo" || interface == "lo0" {
        return Ok(if v6 {
            IpAddr::V6(Ipv6Addr::LOCALHOST)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        });
    }
    warn!(
        "Interface {} is not loopback; binding to the unspecified address",
        interface
    );
    Ok(if v6 {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    })
}

/// A bound pair of IPv4/IPv6 listeners on the chosen interface and port.
pub struct TcpListeners {
    v4: StdTcpListener,
    v6: Option<StdTcpListener>,
    pub port: u16,
}

impl TcpListeners {
    /// Binds both stacks on `interface`, applying the port-selection policy:
    /// bind exactly to `only_port` or fail, or walk upward from `from_port`,
    /// wrapping to the ephemeral range on overflow.
    pub fn bind(
        interface: &str,
        only_port: Option<u16>,
        from_port: u16,
    ) -> Result<Self> {
        let v4_addr = interface_address(interface, false)?;
        let v6_addr = interface_address(interface, true)?;

        if let Some(port) = only_port {
            let v4 = bind_reuseaddr(SocketAddr::new(v4_addr, port))?;
            let v6 = bind_reuseaddr(SocketAddr::new(v6_addr, port)).ok();
            return Ok(TcpListeners { v4, v6, port });
        }

        let mut port = from_port;
        loop {
            match bind_reuseaddr(SocketAddr::new(v4_addr, port)) {
                Ok(v4) => {
                    let v6 = bind_reuseaddr(SocketAddr::new(v6_addr, port)).ok();
                    let bound_port = v4.local_addr().map_err(Error::BindFailed)?.port();
                    return Ok(TcpListeners {
                        v4,
                        v6,
                        port: bound_port,
                    });
                }
                Err(_) => {
                    port = port.checked_add(1).unwrap_or(EPHEMERAL_PORT_BASE);
                    if port == 0 {
                        port = EPHEMERAL_PORT_BASE;
                    }
                }
            }
        }
    }

    /// Waits for readability on either listener and accepts whichever is
    /// ready, preempted by `terminate`. Returns `None` on termination.
    pub fn accept(&self, terminate: &AtomicBool) -> Option<TcpConn> {
        self.v4.set_nonblocking(true).ok();
        if let Some(v6) = &self.v6 {
            v6.set_nonblocking(true).ok();
        }

        loop {
            if terminate.load(Ordering::Relaxed) {
                return None;
            }
            match self.v4.accept() {
                Ok((stream, addr)) => {
                    info!("Connection opened from {}", addr);
                    return Some(TcpConn::new(stream));
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(err) => warn!("Accept failed on IPv4 listener: {}", err),
            }
            if let Some(v6) = &self.v6 {
                match v6.accept() {
                    Ok((stream, addr)) => {
                        info!("Connection opened from {}", addr);
                        return Some(TcpConn::new(stream));
                    }
                    Err(ref err) if err.kind() == ErrorKind::WouldBlock => {}
                    Err(err) => warn!("Accept failed on IPv6 listener: {}", err),
                }
            }
            std::thread::sleep(ACCEPT_POLL_INTERVAL);
        }
    }
}

fn bind_reuseaddr(addr: SocketAddr) -> Result<StdTcpListener> {
    // std::net doesn't expose SO_REUSEADDR directly; TcpListener::bind sets
    // it by default on Unix, which is the only target this bridge ships on.
    StdTcpListener::bind(addr).map_err(Error::BindFailed)
}

/// One accepted TCP connection.
pub struct TcpConn {
    stream: TcpStream,
    pub is_closed: bool,
}

impl TcpConn {
    fn new(stream: TcpStream) -> Self {
        stream.set_nonblocking(false).ok();
        let _ = stream.set_read_timeout(Some(READ_TIMEOUT));
        TcpConn {
            stream,
            is_closed: false,
        }
    }

    /// Reads Packets for `msg` until the framer is satisfied or the peer
    /// closes. Returns `None` if the peer closed before any bytes arrived.
    pub fn recv(&mut self, msg: &mut Message) -> Result<Option<Packet>> {
        let mut pkt = msg.new_packet();
        loop {
            let pending = HttpFramer::pending_bytes(msg, &mut pkt)?;
            if pending == 0 || pkt.is_completed() {
                break;
            }

            let mut buf = vec![0u8; pending];
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    self.is_closed = true;
                    if pkt.filled() == 0 {
                        return Ok(None);
                    }
                    HttpFramer::mark_stream_closed(msg, &mut pkt);
                    break;
                }
                Ok(n) => {
                    pkt.copy_in(&buf[..n]);
                    HttpFramer::mark_received(msg, &mut pkt, n);
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(ref err) if err.kind() == ErrorKind::TimedOut => continue,
                Err(err) => return Err(Error::CreateSocket(err)),
            }
        }
        Ok(Some(pkt))
    }

    /// Writes all of `pkt`'s filled bytes, suppressing SIGPIPE by treating
    /// `BrokenPipe` as a normal (closed) outcome rather than an error.
    pub fn send(&mut self, pkt: &Packet) -> Result<()> {
        match self.stream.write_all(pkt.bytes()) {
            Ok(()) => Ok(()),
            Err(ref err) if err.kind() == ErrorKind::BrokenPipe => {
                self.is_closed = true;
                Ok(())
            }
            Err(err) => Err(Error::CreateSocket(err)),
        }
    }

    /// Writes a raw byte slice, bypassing the framer. Used only for the
    /// no-printer debug mode's synthesized stub response.
    pub fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        match self.stream.write_all(data) {
            Ok(()) => Ok(()),
            Err(ref err) if err.kind() == ErrorKind::BrokenPipe => {
                self.is_closed = true;
                Ok(())
            }
            Err(err) => Err(Error::CreateSocket(err)),
        }
    }

    pub fn close(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.is_closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream as StdTcpStream;

    #[test]
    fn port_selection_advances_when_taken() {
        let held = StdTcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let taken_port = held.local_addr().unwrap().port();

        let listeners = TcpListeners::bind("lo", None, taken_port).unwrap();
        assert_ne!(listeners.port, taken_port);
    }

    #[test]
    fn only_port_fails_when_taken() {
        let held = StdTcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let taken_port = held.local_addr().unwrap().port();

        let result = TcpListeners::bind("lo", Some(taken_port), 0);
        assert!(result.is_err());
    }

    #[test]
    fn recv_returns_none_on_immediate_close() {
        let listeners = TcpListeners::bind("lo", None, 0).unwrap();
        let port = listeners.port;
        let client = std::thread::spawn(move || {
            let stream = StdTcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
            drop(stream);
        });
        let terminate = AtomicBool::new(false);
        let mut conn = listeners.accept(&terminate).expect("accept");
        let mut msg = Message::new();
        let result = conn.recv(&mut msg).unwrap();
        assert!(result.is_none());
        client.join().unwrap();
    }
}
