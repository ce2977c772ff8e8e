// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Byte-stream HTTP message framing.
//!
//! `HttpFramer` decides, from bytes accumulated so far in a `Packet`, how
//! many more bytes are pending for the current `Message`, without parsing
//! the request/response in full. This mirrors the original `http_message_t`
//! / `http_packet_t` split: a `Message` is the logical request or response,
//! a `Packet` is one contiguous buffer backing a single read/write round.

use crate::error::{Error, Result};

/// Initial and step size for packet buffer growth.
const BUFFER_STEP: usize = 1 << 13;
/// Hard cap on a single packet's buffer.
pub const BUFFER_CAP: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Unset,
    Unknown,
    ContentLength,
    Chunked,
    HeaderOnly,
}

/// Tracks chunk-decoding progress across the Packets of one Chunked Message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    /// Waiting for the next mini-header (`hex-size [;ext] CRLF`).
    AwaitingHeader,
    /// `remaining` body bytes left in the current chunk, not counting the
    /// trailing CRLF.
    InBody { remaining: usize },
    /// Zero-size chunk seen; only the terminating CRLF/trailer is left.
    Trailer,
}

/// A logical HTTP request or response assembled from a byte stream.
pub struct Message {
    pub kind: Kind,
    /// Total bytes expected once known (header + body); 0 if unknown.
    pub declared_size: usize,
    pub received_size: usize,
    pub is_completed: bool,
    /// Bytes read past the end of this message, owned here until the next
    /// Packet adopts them.
    spare_buffer: Vec<u8>,
    chunk_state: ChunkState,
}

impl Message {
    pub fn new() -> Self {
        Message {
            kind: Kind::Unset,
            declared_size: 0,
            received_size: 0,
            is_completed: false,
            spare_buffer: Vec::new(),
            chunk_state: ChunkState::AwaitingHeader,
        }
    }

    /// Starts a new Message on the same stream, seeded with bytes the
    /// previous Message on that stream read past its own end. The caller
    /// (BridgeWorker) is responsible for moving the previous Message's
    /// spare buffer here via `take_spare`.
    pub fn new_with_spare(spare: Vec<u8>) -> Self {
        Message {
            spare_buffer: spare,
            ..Self::new()
        }
    }

    /// Takes ownership of this Message's leftover bytes, leaving it empty.
    /// Used once the Message is complete, to seed the next Message on the
    /// same stream.
    pub fn take_spare(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.spare_buffer)
    }

    /// Allocates a new Packet for this Message, moving any spare bytes left
    /// over from the previous Packet into its initial buffer. This is the
    /// one place spare bytes change hands; there is no copy, so a byte can
    /// never be duplicated or dropped across the Packet boundary.
    pub fn new_packet(&mut self) -> Packet {
        let buffer = std::mem::take(&mut self.spare_buffer);
        let filled = buffer.len();
        Packet {
            buffer,
            filled,
            expected: 0,
            header_size: None,
            is_completed: false,
        }
    }

    pub fn has_spare(&self) -> bool {
        !self.spare_buffer.is_empty()
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

/// A contiguous buffer backing one read/write round toward a `Message`.
pub struct Packet {
    buffer: Vec<u8>,
    filled: usize,
    /// Total bytes this Packet should hold once known; 0 if not yet known.
    expected: usize,
    header_size: Option<usize>,
    is_completed: bool,
}

impl Packet {
    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer[..self.filled]
    }

    pub fn is_completed(&self) -> bool {
        self.is_completed
    }

    /// Copies `data` into the buffer at the current filled offset. Callers
    /// (TcpConn/UsbConn I/O) use this to land bytes they just read before
    /// calling `HttpFramer::mark_received` to advance the framer's state.
    /// The buffer must already have been grown far enough by a prior
    /// `pending_bytes` call.
    pub fn copy_in(&mut self, data: &[u8]) {
        let end = self.filled + data.len();
        if self.buffer.len() < end {
            self.buffer.resize(end, 0);
        }
        self.buffer[self.filled..end].copy_from_slice(data);
    }

    /// Grows the backing buffer (if needed) and returns the writable region
    /// the caller should read into.
    fn writable_region(&mut self, want: usize) -> &mut [u8] {
        let needed = self.filled + want;
        if self.buffer.len() < needed {
            self.buffer.resize(needed, 0);
        }
        &mut self.buffer[self.filled..needed]
    }
}

/// What `parse_headers` learned about a complete header section.
struct ParsedHeaders {
    header_end: usize,
    is_get: bool,
    content_length: Option<usize>,
    chunked: bool,
}

fn headers_from(parsed: &[httparse::Header]) -> (Option<usize>, bool) {
    let mut content_length = None;
    let mut chunked = false;
    for header in parsed {
        if header.name.eq_ignore_ascii_case("content-length") {
            content_length = std::str::from_utf8(header.value)
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok());
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            chunked |= std::str::from_utf8(header.value)
                .unwrap_or_default()
                .to_ascii_lowercase()
                .contains("chunked");
        }
    }
    (content_length, chunked)
}

/// Parses the header section with `httparse`, trying a response parse
/// first when the buffer looks like one (`HTTP/` status line) and a
/// request parse otherwise. Falls back to a lenient manual scan, tolerant
/// of a bare `\n\n` terminator, for peers that skip the `\r` half of
/// RFC 2616 §19.3's CRLF requirement, which httparse rejects outright.
fn parse_headers(buf: &[u8]) -> Option<ParsedHeaders> {
    let mut raw_headers = [httparse::EMPTY_HEADER; 64];

    if buf.starts_with(b"HTTP/") {
        let mut response = httparse::Response::new(&mut raw_headers);
        if let Ok(httparse::Status::Complete(header_end)) = response.parse(buf) {
            let (content_length, chunked) = headers_from(response.headers);
            return Some(ParsedHeaders {
                header_end,
                is_get: false,
                content_length,
                chunked,
            });
        }
    } else {
        let mut request = httparse::Request::new(&mut raw_headers);
        if let Ok(httparse::Status::Complete(header_end)) = request.parse(buf) {
            let is_get = request.method == Some("GET");
            let (content_length, chunked) = headers_from(request.headers);
            return Some(ParsedHeaders {
                header_end,
                is_get,
                content_length,
                chunked,
            });
        }
    }

    parse_headers_lenient(buf)
}

fn parse_headers_lenient(buf: &[u8]) -> Option<ParsedHeaders> {
    let header_end = if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
        pos + 4
    } else {
        buf.windows(2).position(|w| w == b"\n\n")? + 2
    };

    let text = String::from_utf8_lossy(&buf[..header_end]);
    let mut content_length = None;
    let mut chunked = false;
    for line in text.split("\r\n").flat_map(|l| l.split('\n')) {
        let lower = line.to_ascii_lowercase();
        if let Some(value) = lower.strip_prefix("content-length:") {
            content_length = value.trim().parse::<usize>().ok();
        } else if lower.starts_with("transfer-encoding:") && lower.contains("chunked") {
            chunked = true;
        }
    }
    let is_get = buf.starts_with(b"GET ") || buf.starts_with(b"GET\t");

    Some(ParsedHeaders {
        header_end,
        is_get,
        content_length,
        chunked,
    })
}

/// Pure state object: given bytes already accumulated in a Packet, decides
/// how many more bytes are pending and when the Message is complete. It
/// performs no I/O of its own.
pub struct HttpFramer;

impl HttpFramer {
    /// Classifies the message once the header boundary is known, setting
    /// the Packet's `expected` so the header ends the first Packet. Rule
    /// order matches the original: chunked transfer-encoding first, then
    /// Content-Length, then a bare `GET` request line, else Unknown (read
    /// until close).
    fn classify(message: &mut Message, packet: &mut Packet, parsed: ParsedHeaders) {
        let header_end = parsed.header_end;
        packet.header_size = Some(header_end);

        if parsed.chunked {
            message.kind = Kind::Chunked;
            message.declared_size = 0;
            packet.expected = header_end;
        } else if let Some(n) = parsed.content_length {
            message.kind = Kind::ContentLength;
            message.declared_size = header_end + n;
            packet.expected = message.declared_size;
        } else if parsed.is_get {
            message.kind = Kind::HeaderOnly;
            message.declared_size = header_end;
            packet.expected = header_end;
        } else {
            message.kind = Kind::Unknown;
            message.declared_size = 0;
            packet.expected = 0;
        }
    }

    /// Returns how many more bytes the caller should try to read before
    /// re-invoking the framer. Zero means the current Packet is complete.
    pub fn pending_bytes(message: &mut Message, packet: &mut Packet) -> Result<usize> {
        if message.kind == Kind::Unset {
            match parse_headers(packet.bytes()) {
                Some(parsed) => {
                    // A single read can carry the header, the full body,
                    // and bytes belonging to the next message all at once,
                    // so trim/complete right away rather than waiting for
                    // a `mark_received` call that may never come.
                    Self::classify(message, packet, parsed);
                    Self::trim_excess_and_complete(message, packet);
                }
                None => {
                    if packet.filled >= BUFFER_CAP {
                        return Err(Error::BufferExhausted);
                    }
                    let grown = (packet.filled + BUFFER_STEP).min(BUFFER_CAP);
                    let want = grown - packet.filled;
                    packet.writable_region(want);
                    return Ok(want);
                }
            }
        }

        match message.kind {
            Kind::Unset => unreachable!("classified above"),
            Kind::ContentLength | Kind::HeaderOnly => Ok(packet.expected.saturating_sub(packet.filled)),
            Kind::Unknown => {
                if packet.filled >= BUFFER_CAP {
                    return Err(Error::BufferExhausted);
                }
                let grown = (packet.filled + BUFFER_STEP).min(BUFFER_CAP);
                let want = grown - packet.filled;
                packet.writable_region(want);
                Ok(want)
            }
            Kind::Chunked => Self::chunked_pending(message, packet),
        }
    }

    /// Chunked bodies are decoded one Packet per chunk: the mini-header
    /// (`hex-size CRLF`), then `size` body bytes, then the trailing CRLF.
    fn chunked_pending(message: &mut Message, packet: &mut Packet) -> Result<usize> {
        loop {
            match message.chunk_state {
                ChunkState::AwaitingHeader => {
                    let start = packet.header_size.unwrap_or(0);
                    let scan = &packet.buffer[start..packet.filled];
                    let term = scan
                        .iter()
                        .position(|&b| b == b'\r' || b == b'\n')
                        .map(|p| p + start);
                    let term = match term {
                        Some(t) => t,
                        None => {
                            let want = BUFFER_STEP.min(BUFFER_CAP - packet.filled);
                            if want == 0 {
                                return Err(Error::BufferExhausted);
                            }
                            packet.writable_region(want);
                            return Ok(want);
                        }
                    };
                    let mini_header = &packet.buffer[start..term];
                    let size_str = std::str::from_utf8(mini_header)
                        .map_err(|_| Error::Malformed("non-utf8 chunk size".into()))?;
                    let size_str = size_str.split(';').next().unwrap_or(size_str).trim();
                    let size = usize::from_str_radix(size_str, 16)
                        .map_err(|_| Error::Malformed("bad chunk size".into()))?;

                    // Skip past the mini-header's terminator (CRLF or bare LF).
                    let mut after = term;
                    if packet.buffer.get(after) == Some(&b'\r') {
                        after += 1;
                    }
                    if packet.buffer.get(after) == Some(&b'\n') {
                        after += 1;
                    }
                    packet.header_size = Some(after);

                    if size == 0 {
                        message.chunk_state = ChunkState::Trailer;
                    } else {
                        message.chunk_state = ChunkState::InBody { remaining: size + 2 };
                    }
                }
                ChunkState::InBody { remaining } => {
                    let have = packet.filled.saturating_sub(packet.header_size.unwrap_or(0));
                    if have >= remaining {
                        packet.is_completed = true;
                        message.chunk_state = ChunkState::AwaitingHeader;
                        return Ok(0);
                    }
                    let want = remaining - have;
                    packet.writable_region(want);
                    return Ok(want);
                }
                ChunkState::Trailer => {
                    let start = packet.header_size.unwrap_or(0);
                    let have = &packet.buffer[start..packet.filled];
                    if have.starts_with(b"\r\n") || have.starts_with(b"\n") {
                        packet.is_completed = true;
                        message.is_completed = true;
                        return Ok(0);
                    }
                    if have.is_empty() {
                        packet.writable_region(2);
                        return Ok(2);
                    }
                    return Err(Error::Malformed("missing final chunk CRLF".into()));
                }
            }
        }
    }

    /// Moves any bytes past `packet.expected` into the Message's spare
    /// buffer and flags completion, for ContentLength/HeaderOnly framing.
    /// Shared between `mark_received` (bytes arrive after the header was
    /// already classified) and `pending_bytes` (header and body, including
    /// any trailing bytes of the next message, all land in the same read).
    fn trim_excess_and_complete(message: &mut Message, packet: &mut Packet) {
        if packet.expected > 0 && packet.filled > packet.expected {
            let excess_start = packet.expected;
            let excess = packet.buffer[excess_start..packet.filled].to_vec();
            message.spare_buffer = excess;
            packet.buffer.truncate(packet.expected);
            packet.filled = packet.expected;
        }

        if let Kind::ContentLength | Kind::HeaderOnly = message.kind {
            if message.declared_size > 0 && message.received_size >= message.declared_size {
                message.is_completed = true;
                packet.is_completed = true;
            }
        }
    }

    /// Declares that `n` bytes were appended by the caller; updates `filled`
    /// and the Message's `received_size`, moving any excess past `expected`
    /// into the Message's spare buffer.
    pub fn mark_received(message: &mut Message, packet: &mut Packet, n: usize) {
        packet.filled += n;
        message.received_size += n;
        Self::trim_excess_and_complete(message, packet);
    }

    /// Classifies the current message from its header bytes, if enough have
    /// arrived yet to find the header boundary.
    pub fn find_type(packet: &Packet) -> Kind {
        match parse_headers(packet.bytes()) {
            None => Kind::Unset,
            Some(parsed) if parsed.chunked => Kind::Chunked,
            Some(parsed) if parsed.content_length.is_some() => Kind::ContentLength,
            Some(parsed) if parsed.is_get => Kind::HeaderOnly,
            Some(_) => Kind::Unknown,
        }
    }

    /// Marks the message complete because the peer closed the stream
    /// (applicable to `Unknown` framing, which has no other terminator).
    pub fn mark_stream_closed(message: &mut Message, packet: &mut Packet) {
        message.is_completed = true;
        packet.is_completed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drives the framer the way `TcpConn`/`UsbConn` do: keep re-invoking
    /// `pending_bytes` until the Packet or Message reports completion,
    /// rather than stopping once the fixture bytes are exhausted. A single
    /// `pending_bytes` call can ask for more bytes than a small fixture
    /// holds (the initial unclassified read wants a full `BUFFER_STEP`), so
    /// stopping at `offset == data.len()` would return before the framer
    /// ever re-examines the buffer it just received.
    fn feed(message: &mut Message, packet: &mut Packet, data: &[u8]) {
        let mut offset = 0;
        loop {
            if packet.is_completed() || message.is_completed {
                break;
            }
            let want = HttpFramer::pending_bytes(message, packet).expect("pending_bytes");
            if want == 0 {
                break;
            }
            let n = want.min(data.len() - offset);
            if n == 0 {
                break;
            }
            packet.buffer[packet.filled..packet.filled + n]
                .copy_from_slice(&data[offset..offset + n]);
            HttpFramer::mark_received(message, packet, n);
            offset += n;
        }
    }

    #[test]
    fn content_length_request() {
        let mut message = Message::new();
        let mut packet = message.new_packet();
        feed(
            &mut message,
            &mut packet,
            b"POST /ipp/print HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello",
        );
        assert_eq!(message.kind, Kind::ContentLength);
        assert!(message.is_completed);
        assert_eq!(packet.filled(), 46);
    }

    #[test]
    fn header_only_get() {
        let mut message = Message::new();
        let mut packet = message.new_packet();
        feed(
            &mut message,
            &mut packet,
            b"GET /favicon.ico HTTP/1.1\r\nHost: x\r\n\r\n",
        );
        assert_eq!(message.kind, Kind::HeaderOnly);
        assert!(message.is_completed);
    }

    #[test]
    fn chunked_response_completes_on_zero_chunk() {
        // Chunked bodies are decoded one Packet per chunk (see
        // `HttpFramer::chunked_pending`), so this drives the framer across
        // three Packets the way `UsbConn::recv` would: one for the header,
        // one for the first chunk, one for the terminating zero chunk.
        let mut message = Message::new();
        let mut packet = message.new_packet();
        feed(
            &mut message,
            &mut packet,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        assert_eq!(message.kind, Kind::Chunked);
        assert!(packet.is_completed());

        let mut chunk_packet = message.new_packet();
        feed(&mut message, &mut chunk_packet, b"5\r\nhello\r\n");
        assert!(chunk_packet.is_completed());
        assert!(!message.is_completed);

        let mut trailer_packet = message.new_packet();
        feed(&mut message, &mut trailer_packet, b"0\r\n\r\n");
        assert!(trailer_packet.is_completed());
        assert!(message.is_completed);
    }

    #[test]
    fn lf_lf_header_terminator() {
        let mut message = Message::new();
        let mut packet = message.new_packet();
        feed(&mut message, &mut packet, b"GET / HTTP/1.1\nHost: x\n\n");
        assert_eq!(message.kind, Kind::HeaderOnly);
        assert!(message.is_completed);
    }

    #[test]
    fn unchunked_no_length_is_unknown() {
        let mut message = Message::new();
        let mut packet = message.new_packet();
        feed(&mut message, &mut packet, b"POST /x HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(message.kind, Kind::Unknown);
        assert!(!message.is_completed);
        HttpFramer::mark_stream_closed(&mut message, &mut packet);
        assert!(message.is_completed);
    }

    #[test]
    fn header_spanning_two_reads() {
        let mut message = Message::new();
        let mut packet = message.new_packet();
        feed(&mut message, &mut packet, b"POST /x HTTP/1.1\r\nContent-Le");
        assert_eq!(message.kind, Kind::Unset);
        feed(&mut message, &mut packet, b"ngth: 3\r\n\r\nabc");
        assert_eq!(message.kind, Kind::ContentLength);
        assert!(message.is_completed);
    }

    #[test]
    fn spare_bytes_move_to_next_packet() {
        let mut message = Message::new();
        let mut packet = message.new_packet();
        // One byte more than the declared Content-Length belongs to the
        // next message on the same stream.
        feed(
            &mut message,
            &mut packet,
            b"POST /x HTTP/1.1\r\nContent-Length: 2\r\n\r\nabX",
        );
        assert!(message.is_completed);
        assert!(message.has_spare());

        let leftover = message.take_spare();
        let mut next = Message::new_with_spare(leftover);
        let next_packet = next.new_packet();
        assert_eq!(next_packet.bytes(), b"X");
    }
}
