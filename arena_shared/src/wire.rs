//! Wire codec: fixed-endianness serialization over byte buffers.
//!
//! Integers travel big-endian, booleans as one byte, strings null-terminated.
//! `f32` values are written in *host* byte order: the protocol has always
//! shipped floats unconverted and existing peers depend on it, so the codec
//! preserves that layout rather than normalizing. All current peers are
//! little-endian, which is what keeps this interoperable in practice.
//!
//! A datagram is `f32 network-time || (tag || body)*`; a TCP packet payload
//! is `(tag || body)*`. Readers are position-indexed and track the current
//! message tag, advancing it once a message body has been consumed. Tag `0`
//! terminates a message stream.

/// Identifier for the server's session member.
pub const SERVER_ID: u16 = 0;

/// Size of the network-time header at the front of every datagram.
pub const UDP_HEADER_SIZE: usize = 4;

/// Wire size of an ack-request or ack-response message (tag + u16).
pub const ACK_MESSAGE_SIZE: usize = 3;

/// IP + UDP header plus slack for additional encapsulation, charged against
/// the per-period byte budget once per dispatched datagram.
pub const MIN_DATAGRAM_OVERHEAD: u16 = 28;

/// Largest datagram (header inclusive) that is safe from fragmentation:
/// 576 B minimum reassembly size minus IP/UDP headers minus slack.
pub const MAX_DATAGRAM_SIZE: usize = 576 - MIN_DATAGRAM_OVERHEAD as usize - 48;

/// Upper bound for an assembled TCP packet payload.
pub const TCP_MAX_PACKET_SIZE: usize = 10_000;

/// Built-in UDP message tags. Anything at or above [`udp_tag::MIN_USER`] is
/// opaque application payload.
pub mod udp_tag {
    pub const NO_MESSAGE: u8 = 0;
    pub const LAN_SERVER_DISCOVERY: u8 = 1;
    pub const LAN_SERVER_RESPONSE: u8 = 2;
    pub const TIME_INITIAL_REQUEST: u8 = 3;
    pub const TIME_UPDATE_REQUEST: u8 = 4;
    pub const TIME_RESPONSE: u8 = 5;
    pub const ACK_REQUEST: u8 = 6;
    pub const ACK_RESPONSE: u8 = 7;
    pub const MIN_USER: u8 = 8;
}

/// Built-in TCP message tags. Anything at or above [`tcp_tag::MIN_USER`] is
/// opaque application payload.
pub mod tcp_tag {
    pub const NO_MESSAGE: u8 = 0;
    pub const SESSION_REQUEST: u8 = 1;
    pub const SESSION_POSITIVE_RESPONSE: u8 = 2;
    pub const SESSION_IS_FULL: u8 = 3;
    pub const SESSION_WRONG_PASSWORD: u8 = 4;
    pub const SESSION_NEW_MEMBER: u8 = 5;
    pub const SESSION_REMOVE_MEMBER: u8 = 6;
    pub const MIN_USER: u8 = 7;
}

/// A record that can be carried as a message body.
pub trait Wire {
    /// Exact number of bytes [`Wire::encode`] will append.
    fn wire_size(&self) -> usize;

    fn encode(&self, w: &mut WireWriter);

    /// Returns `None` when the buffer is truncated or malformed.
    fn decode(r: &mut WireReader<'_>) -> Option<Self>
    where
        Self: Sized;
}

/// Append-only serializer with a hard size limit.
///
/// Callers are expected to check [`WireWriter::remaining`] (or the message's
/// [`Wire::wire_size`]) before writing; the write methods only debug-assert
/// the limit.
#[derive(Debug)]
pub struct WireWriter {
    buf: Vec<u8>,
    limit: usize,
}

impl WireWriter {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit.min(4096)),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.buf.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn write_u8(&mut self, v: u8) {
        debug_assert!(self.remaining() >= 1);
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(v as u8);
    }

    pub fn write_u16(&mut self, v: u16) {
        debug_assert!(self.remaining() >= 2);
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i16(&mut self, v: i16) {
        debug_assert!(self.remaining() >= 2);
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        debug_assert!(self.remaining() >= 4);
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        debug_assert!(self.remaining() >= 4);
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Host byte order, see the module docs.
    pub fn write_f32(&mut self, v: f32) {
        debug_assert!(self.remaining() >= 4);
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    /// Null-terminated string. The text itself must not contain `\0`.
    pub fn write_cstr(&mut self, s: &str) {
        debug_assert!(self.remaining() >= s.len() + 1);
        debug_assert!(!s.as_bytes().contains(&0));
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(self.remaining() >= bytes.len());
        self.buf.extend_from_slice(bytes);
    }

    /// Inserts `bytes` at `at`, shifting later content back. Used to place
    /// ack and time messages at the front of a datagram under assembly.
    pub fn insert(&mut self, at: usize, bytes: &[u8]) {
        debug_assert!(self.remaining() >= bytes.len());
        debug_assert!(at <= self.buf.len());
        self.buf.splice(at..at, bytes.iter().copied());
    }
}

/// Number of bytes [`WireWriter::write_cstr`] consumes for `s`.
pub fn cstr_size(s: &str) -> usize {
    s.len() + 1
}

/// Position-indexed reader over a message stream.
///
/// [`WireReader::current_tag`] holds the tag of the message under
/// consumption; call [`WireReader::advance_tag`] after reading a complete
/// body. At end of buffer the tag becomes `0` (no message).
#[derive(Debug)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
    current_tag: u8,
}

impl<'a> WireReader<'a> {
    /// Begins reading; consumes the first tag byte.
    pub fn new(data: &'a [u8]) -> Self {
        let mut reader = Self {
            data,
            pos: 0,
            current_tag: 0,
        };
        reader.advance_tag();
        reader
    }

    pub fn current_tag(&self) -> u8 {
        self.current_tag
    }

    /// Byte offset of the current tag (one before the read position when a
    /// tag has been consumed).
    pub fn message_start(&self) -> usize {
        self.pos.saturating_sub(1)
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Everything from the current message's tag byte to the end of the
    /// buffer. Used to chop transport messages off the front of a packet and
    /// hand the rest to the application.
    pub fn tail(&self) -> &'a [u8] {
        &self.data[self.message_start()..]
    }

    /// Reads the next message tag, or `0` at end of buffer.
    pub fn advance_tag(&mut self) {
        if self.pos >= self.data.len() {
            self.current_tag = 0;
            return;
        }
        self.current_tag = self.data[self.pos];
        self.pos += 1;
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    pub fn read_bool(&mut self) -> Option<bool> {
        self.read_u8().map(|b| b != 0)
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        let bytes = self.data.get(self.pos..self.pos + 2)?;
        self.pos += 2;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_i16(&mut self) -> Option<i16> {
        self.read_u16().map(|v| v as i16)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        let bytes = self.data.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_i32(&mut self) -> Option<i32> {
        self.read_u32().map(|v| v as i32)
    }

    /// Host byte order, see the module docs.
    pub fn read_f32(&mut self) -> Option<f32> {
        let bytes = self.data.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_cstr(&mut self) -> Option<String> {
        let rest = self.data.get(self.pos..)?;
        let end = rest.iter().position(|&b| b == 0)?;
        let text = String::from_utf8(rest[..end].to_vec()).ok()?;
        self.pos += end + 1;
        Some(text)
    }
}

/// Assembly buffer for the datagram under construction.
///
/// Owns the 4-byte network-time header and the placement rules for the
/// transport's own messages: at most one ack-request per datagram, time
/// requests and responses at the head of the payload so the receiving side
/// can answer them with minimum latency, ack messages in front of any user
/// data already appended.
#[derive(Debug)]
pub struct DatagramWriter {
    writer: WireWriter,
    ack_request: Option<u16>,
    has_time_request: bool,
    has_user_data: bool,
}

impl DatagramWriter {
    pub fn new(max_size: usize) -> Self {
        debug_assert!(max_size > UDP_HEADER_SIZE);
        let mut writer = WireWriter::new(max_size);
        writer.write_bytes(&[0u8; UDP_HEADER_SIZE]);
        Self {
            writer,
            ack_request: None,
            has_time_request: false,
            has_user_data: false,
        }
    }

    /// Total assembled size, header inclusive.
    pub fn len(&self) -> usize {
        self.writer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writer.len() == UDP_HEADER_SIZE
    }

    pub fn free(&self) -> usize {
        self.writer.remaining()
    }

    pub fn has_ack_request(&self) -> bool {
        self.ack_request.is_some()
    }

    pub fn ack_request_number(&self) -> Option<u16> {
        self.ack_request
    }

    pub fn has_time_request(&self) -> bool {
        self.has_time_request
    }

    /// Stamps the network-time header. Host byte order like any other float.
    pub fn set_network_time(&mut self, time: f32) {
        let bytes = time.to_ne_bytes();
        // Header space is reserved in new()/clear(), overwrite in place.
        self.writer.buf[..UDP_HEADER_SIZE].copy_from_slice(&bytes);
    }

    /// Adds the datagram's single ack-request message. Placed in front of
    /// any user data so it is parsed before the payload it covers.
    pub fn add_ack_request(&mut self, ack: u16) {
        debug_assert!(self.ack_request.is_none());
        debug_assert!(self.free() >= ACK_MESSAGE_SIZE);
        self.ack_request = Some(ack);
        self.insert_ack(udp_tag::ACK_REQUEST, ack);
    }

    /// Queues an ack-response. Returns the bytes consumed, or 0 when the
    /// datagram has no room for it.
    pub fn add_ack_response(&mut self, ack: u16) -> usize {
        if self.free() < ACK_MESSAGE_SIZE {
            return 0;
        }
        self.insert_ack(udp_tag::ACK_RESPONSE, ack);
        ACK_MESSAGE_SIZE
    }

    fn insert_ack(&mut self, tag: u8, ack: u16) {
        if !self.has_user_data {
            self.writer.write_u8(tag);
            self.writer.write_u16(ack);
            return;
        }
        let mut msg = [0u8; ACK_MESSAGE_SIZE];
        msg[0] = tag;
        msg[1..3].copy_from_slice(&ack.to_be_bytes());
        self.writer.insert(UDP_HEADER_SIZE, &msg);
    }

    /// Adds a time request at the head of the payload, shifting anything
    /// already assembled behind it. Returns the bytes consumed, or 0 when
    /// the datagram has no room.
    pub fn add_time_request(&mut self, client_time: f32, initial: bool) -> usize {
        debug_assert!(!self.has_time_request);
        let size = 1 + 4;
        if self.free() < size {
            return 0;
        }
        let tag = if initial {
            udp_tag::TIME_INITIAL_REQUEST
        } else {
            udp_tag::TIME_UPDATE_REQUEST
        };
        let mut msg = [0u8; 5];
        msg[0] = tag;
        msg[1..5].copy_from_slice(&client_time.to_ne_bytes());
        self.writer.insert(UDP_HEADER_SIZE, &msg);
        self.has_time_request = true;
        size
    }

    /// Writes a time response into an empty datagram.
    pub fn add_time_response(&mut self, client_time: f32, server_time: f32) {
        debug_assert!(self.is_empty());
        self.writer.write_u8(udp_tag::TIME_RESPONSE);
        self.writer.write_f32(client_time);
        self.writer.write_f32(server_time);
    }

    pub fn add_lan_discovery(&mut self) {
        self.writer.write_u8(udp_tag::LAN_SERVER_DISCOVERY);
    }

    pub fn add_lan_response(&mut self, ip: u32, tcp_port: u16) {
        self.writer.write_u8(udp_tag::LAN_SERVER_RESPONSE);
        self.writer.write_u32(ip);
        self.writer.write_u16(tcp_port);
    }

    /// Appends a tagged user message. The caller must have verified the fit.
    /// Returns the byte range the message occupies, for reliable capture.
    pub fn append_message(&mut self, tag: u8, msg: &dyn Wire) -> (usize, usize) {
        debug_assert!(tag >= udp_tag::MIN_USER);
        debug_assert!(self.free() >= 1 + msg.wire_size());
        let start = self.writer.len();
        self.writer.write_u8(tag);
        msg.encode(&mut self.writer);
        self.has_user_data = true;
        (start, self.writer.len())
    }

    /// Appends already-formatted `tag || body` data (reliable resend path).
    pub fn append_raw(&mut self, data: &[u8]) {
        debug_assert!(self.free() >= data.len());
        self.writer.write_bytes(data);
        self.has_user_data = true;
    }

    pub fn slice(&self, start: usize, end: usize) -> &[u8] {
        &self.writer.as_slice()[start..end]
    }

    /// The datagram bytes, or `None` when only the header has been written.
    pub fn payload(&self) -> Option<&[u8]> {
        if self.is_empty() {
            None
        } else {
            Some(self.writer.as_slice())
        }
    }

    /// Resets for the next datagram, keeping the header space reserved.
    pub fn clear(&mut self) {
        self.writer.clear();
        self.writer.write_bytes(&[0u8; UDP_HEADER_SIZE]);
        self.ack_request = None;
        self.has_time_request = false;
        self.has_user_data = false;
    }
}
