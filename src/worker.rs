// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-connection half-duplex relay, one OS thread per accepted TCP
//! connection. Grounded on `ippusbxd.c`'s `service_connection()`: read a
//! full request from TCP while lazily holding a USB interface, forward it,
//! release, read the full response from USB, forward it to TCP, repeat.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info};

use crate::error::Error;
use crate::framer::Message;
use crate::tcp::TcpConn;
use crate::usb::{Priority, UsbPool};

const STUB_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 73\r\nConnection: close\r\n\r\n<html><body>ippusb_bridge: no printer attached (debug mode)</body></html>";

/// Runs one connection to completion. Intended to be the body of a
/// dedicated worker thread; returns when the TCP connection closes, an
/// unrecoverable error occurs, or `terminate` is observed.
pub fn run(mut conn: TcpConn, pool: Option<Arc<UsbPool>>, terminate: &'static AtomicBool) {
    let mut tcp_spare: Vec<u8> = Vec::new();
    let mut usb_spare: Vec<u8> = Vec::new();

    'connection: while !conn.is_closed && !terminate.load(Ordering::Relaxed) {
        let mut client_msg = Message::new_with_spare(std::mem::take(&mut tcp_spare));
        let mut usb_conn = None;

        loop {
            let pkt = match conn.recv(&mut client_msg) {
                Ok(Some(pkt)) => pkt,
                Ok(None) => break 'connection,
                Err(err) => {
                    error!("Reading request from TCP failed: {}", err);
                    break 'connection;
                }
            };

            if pkt.filled() == 0 && client_msg.is_completed {
                break;
            }

            if let Some(pool) = &pool {
                if usb_conn.is_none() {
                    usb_conn = match pool.acquire(Priority::High) {
                        Ok(c) => Some(c),
                        Err(err) => {
                            error!("Failed to acquire USB interface: {}", err);
                            break 'connection;
                        }
                    };
                }
                if let Err(err) = usb_conn.as_mut().unwrap().send(&pkt) {
                    error!("Forwarding request to USB failed: {}", err);
                    break 'connection;
                }
            }

            if client_msg.is_completed {
                break;
            }
        }
        tcp_spare = client_msg.take_spare();

        if pool.is_none() {
            if let Err(err) = conn.write_raw(STUB_RESPONSE) {
                error!("Writing stub response failed: {}", err);
            }
            conn.close();
            break 'connection;
        }

        let mut usb_conn = match usb_conn {
            Some(c) => c,
            None => continue 'connection,
        };

        let mut server_msg = Message::new_with_spare(std::mem::take(&mut usb_spare));
        loop {
            let pkt = match usb_conn.recv(&mut server_msg) {
                Ok(pkt) => pkt,
                Err(Error::NoDevice) => {
                    info!("USB device gone while relaying response; closing connection");
                    break 'connection;
                }
                Err(err) => {
                    error!("Reading response from USB failed: {}", err);
                    break 'connection;
                }
            };

            let empty = pkt.filled() == 0;
            if let Err(err) = conn.send(&pkt) {
                error!("Forwarding response to TCP failed: {}", err);
                break 'connection;
            }

            if server_msg.is_completed || empty {
                break;
            }
        }
        usb_spare = server_msg.take_spare();

        debug!("Request/response round complete; releasing USB interface");
        drop(usb_conn);
    }

    conn.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpStream};

    use crate::tcp::TcpListeners;

    static TERMINATE: AtomicBool = AtomicBool::new(false);

    #[test]
    fn no_printer_mode_serves_stub_response() {
        testing_logger::setup();

        let listeners = TcpListeners::bind("lo", None, 0).unwrap();
        let port = listeners.port;

        let client = std::thread::spawn(move || {
            let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
            stream
                .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
                .unwrap();
            let mut response = Vec::new();
            stream.read_to_end(&mut response).unwrap();
            response
        });

        let conn = listeners.accept(&TERMINATE).expect("accept");
        run(conn, None, &TERMINATE);

        let response = client.join().unwrap();
        assert_eq!(response, STUB_RESPONSE);

        testing_logger::validate(|logs| {
            assert!(logs.iter().all(|entry| entry.level != log::Level::Error));
        });
    }
}
