//! Packet types: length-prefixed TCP packets and time-stamped UDP packets.
//!
//! Packets are owned values that move between queues; payload bytes are
//! reference-counted [`Bytes`] so fan-out to many receivers never copies.

use bytes::Bytes;

use crate::wire::{Wire, WireWriter, TCP_MAX_PACKET_SIZE, UDP_HEADER_SIZE};

/// A framed TCP packet: `u16 length_be || payload`.
///
/// `sender` is the session id of the peer the packet arrived from (or is
/// attributed to when assembled locally); it never travels on the wire.
#[derive(Debug, Clone)]
pub struct TcpPacket {
    framed: Bytes,
    sender: u16,
}

impl TcpPacket {
    /// Frames a payload for transmission.
    pub fn from_payload(payload: &[u8], sender: u16) -> Self {
        debug_assert!(payload.len() <= u16::MAX as usize);
        let mut framed = Vec::with_capacity(2 + payload.len());
        framed.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        framed.extend_from_slice(payload);
        Self {
            framed: Bytes::from(framed),
            sender,
        }
    }

    /// Wraps a fully reassembled payload received from the stream.
    pub fn from_received(payload: Vec<u8>, sender: u16) -> Self {
        Self::from_payload_bytes(Bytes::from(payload), sender)
    }

    fn from_payload_bytes(payload: Bytes, sender: u16) -> Self {
        let mut framed = Vec::with_capacity(2 + payload.len());
        framed.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        framed.extend_from_slice(&payload);
        Self {
            framed: Bytes::from(framed),
            sender,
        }
    }

    /// Builds a packet holding one tagged message.
    pub fn single(tag: u8, msg: &dyn Wire, sender: u16) -> Self {
        let mut w = WireWriter::new(TCP_MAX_PACKET_SIZE);
        w.write_u8(tag);
        msg.encode(&mut w);
        Self::from_payload(w.as_slice(), sender)
    }

    /// The message stream carried by this packet.
    pub fn payload(&self) -> &[u8] {
        &self.framed[2..]
    }

    /// Length header plus payload, ready for the stream.
    pub fn framed(&self) -> &Bytes {
        &self.framed
    }

    pub fn sender(&self) -> u16 {
        self.sender
    }

    /// Replaces the payload with its suffix starting at `at`, dropping
    /// transport messages that were already consumed.
    pub fn chop_front(&mut self, at: usize) {
        debug_assert!(at < self.payload().len());
        let rest = self.framed.slice(2 + at..);
        *self = Self::from_payload_bytes(rest, self.sender);
    }
}

/// A received UDP datagram: network-time header plus message stream.
#[derive(Debug, Clone)]
pub struct UdpPacket {
    payload: Bytes,
    network_time: f32,
    sender: u16,
}

impl UdpPacket {
    /// Parses a raw datagram. `local_estimate` is the receiver's current
    /// network time; the embedded send time is clamped to it so that small
    /// clock drift between hosts can never produce a packet from the future.
    pub fn parse(datagram: &[u8], sender: u16, local_estimate: f32) -> Option<Self> {
        if datagram.len() < UDP_HEADER_SIZE {
            return None;
        }
        let mut header = [0u8; UDP_HEADER_SIZE];
        header.copy_from_slice(&datagram[..UDP_HEADER_SIZE]);
        let sent_at = f32::from_ne_bytes(header);
        let network_time = if sent_at > local_estimate {
            local_estimate
        } else {
            sent_at
        };
        Some(Self {
            payload: Bytes::copy_from_slice(&datagram[UDP_HEADER_SIZE..]),
            network_time,
            sender,
        })
    }

    /// The message stream after the time header.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Network time at which the sender assembled this datagram.
    pub fn network_time(&self) -> f32 {
        self.network_time
    }

    pub fn sender(&self) -> u16 {
        self.sender
    }

    /// Drops everything before `at`, keeping the application's share.
    pub fn chop_front(&mut self, at: usize) {
        debug_assert!(at < self.payload.len());
        self.payload = self.payload.slice(at..);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{WireReader, WireWriter};

    struct Marker(u16);

    impl Wire for Marker {
        fn wire_size(&self) -> usize {
            2
        }
        fn encode(&self, w: &mut WireWriter) {
            w.write_u16(self.0);
        }
        fn decode(r: &mut WireReader<'_>) -> Option<Self> {
            r.read_u16().map(Marker)
        }
    }

    #[test]
    fn tcp_packet_framing_carries_length_prefix() {
        let packet = TcpPacket::single(40, &Marker(515), 3);
        let framed = packet.framed();
        assert_eq!(&framed[..2], &3u16.to_be_bytes());
        assert_eq!(framed[2], 40);
        assert_eq!(packet.payload().len(), 3);
        assert_eq!(packet.sender(), 3);
    }

    #[test]
    fn tcp_packet_chop_front_keeps_tail_and_reframes() {
        let mut w = WireWriter::new(64);
        w.write_u8(40);
        w.write_u16(1);
        w.write_u8(41);
        w.write_u16(2);
        let mut packet = TcpPacket::from_payload(w.as_slice(), 1);

        packet.chop_front(3);
        assert_eq!(packet.payload()[0], 41);
        assert_eq!(&packet.framed()[..2], &3u16.to_be_bytes());
    }

    #[test]
    fn udp_packet_clamps_future_timestamps() {
        let mut datagram = Vec::new();
        datagram.extend_from_slice(&9.5f32.to_ne_bytes());
        datagram.push(42);
        let packet = UdpPacket::parse(&datagram, 1, 4.0).unwrap();
        assert_eq!(packet.network_time(), 4.0);

        let packet = UdpPacket::parse(&datagram, 1, 20.0).unwrap();
        assert_eq!(packet.network_time(), 9.5);
    }

    #[test]
    fn udp_packet_rejects_short_datagrams() {
        assert!(UdpPacket::parse(&[1, 2], 0, 0.0).is_none());
    }
}
