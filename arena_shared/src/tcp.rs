//! Nonblocking TCP endpoint: stream reassembly and framed send queue.
//!
//! Endpoints never block and never rate-limit. Receiving reassembles
//! `u16 length_be || payload` frames across arbitrary segment boundaries;
//! sending completes a partially written packet before the next one is
//! attempted, so a frame is never interleaved. `would_block` outcomes leave
//! the endpoint armed for the next cycle; a read of zero bytes means the
//! remote side closed.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;

use anyhow::Context;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::packet::TcpPacket;

/// One end of a TCP connection, client- or server-side.
#[derive(Debug)]
pub struct TcpEndpoint {
    stream: TcpStream,
    /// Session id of the remote peer; 0 while the connection is pending.
    id: u16,
    header: [u8; 2],
    header_read: usize,
    partial: Option<Vec<u8>>,
    partial_read: usize,
    received: VecDeque<TcpPacket>,
    send_queue: VecDeque<Bytes>,
    sent_bytes: usize,
    stopped_sending: bool,
    shutdown_done: bool,
}

impl TcpEndpoint {
    /// Wraps an established stream. Nagle's algorithm is disabled; the
    /// transport does its own batching.
    pub fn new(stream: TcpStream) -> anyhow::Result<Self> {
        stream.set_nodelay(true).context("disable nagle")?;
        Ok(Self {
            stream,
            id: 0,
            header: [0; 2],
            header_read: 0,
            partial: None,
            partial_read: 0,
            received: VecDeque::new(),
            send_queue: VecDeque::new(),
            sent_bytes: 0,
            stopped_sending: false,
            shutdown_done: false,
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn set_id(&mut self, id: u16) {
        self.id = id;
    }

    /// A pending peer has not completed session negotiation yet.
    pub fn is_pending(&self) -> bool {
        self.id == 0
    }

    pub fn peer_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    /// Drains the socket up to `would_block`, reassembling frames.
    ///
    /// Returns `Ok(false)` when the remote side closed the connection.
    pub fn try_receive(&mut self) -> anyhow::Result<bool> {
        loop {
            if self.partial.is_none() {
                // Collect the two header bytes; they may arrive split.
                match self.stream.try_read(&mut self.header[self.header_read..2]) {
                    Ok(0) => return Ok(false),
                    Ok(n) => {
                        self.header_read += n;
                        if self.header_read < 2 {
                            continue;
                        }
                        self.header_read = 0;
                        let len = u16::from_be_bytes(self.header) as usize;
                        if len == 0 {
                            self.received.push_back(TcpPacket::from_received(Vec::new(), self.id));
                            continue;
                        }
                        self.partial = Some(vec![0u8; len]);
                        self.partial_read = 0;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e).context("tcp read header"),
                }
                continue;
            }

            let buf = self.partial.as_mut().unwrap();
            match self.stream.try_read(&mut buf[self.partial_read..]) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.partial_read += n;
                    if self.partial_read == buf.len() {
                        let payload = self.partial.take().unwrap();
                        self.received.push_back(TcpPacket::from_received(payload, self.id));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("tcp read payload"),
            }
        }
    }

    pub fn has_packet(&self) -> bool {
        !self.received.is_empty()
    }

    pub fn pop_packet(&mut self) -> Option<TcpPacket> {
        self.received.pop_front()
    }

    /// Queues a framed packet for transmission. Packets enqueued after
    /// [`TcpEndpoint::stop_sending`] are dropped.
    pub fn enqueue(&mut self, packet: &TcpPacket) {
        if self.stopped_sending {
            return;
        }
        self.send_queue.push_back(packet.framed().clone());
    }

    /// Pushes a packet in front of everything queued; used for the session
    /// request which must precede any buffered user data.
    pub fn enqueue_front(&mut self, packet: &TcpPacket) {
        if self.stopped_sending {
            return;
        }
        debug_assert_eq!(self.sent_bytes, 0);
        self.send_queue.push_front(packet.framed().clone());
    }

    /// Writes queued packets until the socket would block. A partially
    /// written packet is completed before the next is attempted. Once a
    /// requested half-close has drained the queue, the FIN goes out.
    pub async fn try_send(&mut self) -> anyhow::Result<()> {
        while let Some(front) = self.send_queue.front() {
            match self.stream.try_write(&front[self.sent_bytes..]) {
                Ok(n) => {
                    self.sent_bytes += n;
                    if self.sent_bytes == front.len() {
                        self.send_queue.pop_front();
                        self.sent_bytes = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("tcp write"),
            }
        }
        if self.stopped_sending && !self.shutdown_done {
            self.shutdown_done = true;
            // The peer may already be gone; the close still stands.
            let _ = self.stream.shutdown().await;
        }
        Ok(())
    }

    /// Bytes still waiting in the send queue.
    pub fn pending_bytes(&self) -> usize {
        self.send_queue.iter().map(|b| b.len()).sum::<usize>() - self.sent_bytes
    }

    /// Requests a half-close: no further packets are accepted, and the FIN
    /// follows as soon as [`TcpEndpoint::try_send`] drains what is queued.
    pub fn stop_sending(&mut self) {
        self.stopped_sending = true;
    }

    pub fn has_stopped_sending(&self) -> bool {
        self.stopped_sending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{tcp_tag, WireReader, WireWriter};
    use crate::wire::Wire;
    use tokio::net::TcpListener;

    struct Note(String);

    impl Wire for Note {
        fn wire_size(&self) -> usize {
            self.0.len() + 1
        }
        fn encode(&self, w: &mut WireWriter) {
            w.write_cstr(&self.0);
        }
        fn decode(r: &mut WireReader<'_>) -> Option<Self> {
            r.read_cstr().map(Note)
        }
    }

    async fn pair() -> (TcpEndpoint, TcpEndpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (TcpEndpoint::new(client).unwrap(), TcpEndpoint::new(server).unwrap())
    }

    /// Keeps flushing `from` and draining `to` until a packet arrives.
    async fn drive_until_packet(from: &mut TcpEndpoint, to: &mut TcpEndpoint) -> TcpPacket {
        for _ in 0..200 {
            from.try_send().await.unwrap();
            assert!(to.try_receive().unwrap());
            if let Some(packet) = to.pop_packet() {
                return packet;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        panic!("no packet arrived");
    }

    #[tokio::test]
    async fn framed_packet_roundtrip() {
        let (mut a, mut b) = pair().await;

        let packet = TcpPacket::single(tcp_tag::MIN_USER, &Note("hello".into()), 1);
        a.enqueue(&packet);

        let received = drive_until_packet(&mut a, &mut b).await;
        let mut r = WireReader::new(received.payload());
        assert_eq!(r.current_tag(), tcp_tag::MIN_USER);
        assert_eq!(Note::decode(&mut r).unwrap().0, "hello");
    }

    #[tokio::test]
    async fn packets_arrive_in_send_order() {
        let (mut a, mut b) = pair().await;

        for i in 0..5u16 {
            let packet = TcpPacket::single(tcp_tag::MIN_USER, &Note(format!("m{i}")), 0);
            a.enqueue(&packet);
        }

        for i in 0..5u16 {
            let received = drive_until_packet(&mut a, &mut b).await;
            let mut r = WireReader::new(received.payload());
            assert_eq!(Note::decode(&mut r).unwrap().0, format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn remote_close_is_observed_as_false() {
        let (a, mut b) = pair().await;
        drop(a);
        for _ in 0..200 {
            if !b.try_receive().unwrap() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        panic!("close was not observed");
    }

    #[tokio::test]
    async fn stop_sending_flushes_then_half_closes() {
        let (mut a, mut b) = pair().await;

        // A queued packet survives the half-close request and precedes
        // the FIN on the wire.
        let packet = TcpPacket::single(tcp_tag::MIN_USER, &Note("bye".into()), 0);
        a.enqueue(&packet);
        a.stop_sending();

        let mut closed = false;
        let mut got_packet = false;
        for _ in 0..200 {
            a.try_send().await.unwrap();
            if !b.try_receive().unwrap() {
                closed = true;
            }
            if b.pop_packet().is_some() {
                got_packet = true;
            }
            if closed {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        assert!(got_packet, "queued packet was lost in the half-close");
        assert!(closed, "FIN was not observed");

        // Further sends on A are discarded.
        let late = TcpPacket::single(tcp_tag::MIN_USER, &Note("late".into()), 0);
        a.enqueue(&late);
        assert_eq!(a.pending_bytes(), 0);
    }
}
