//! Reliable delivery over a lossy link.
//!
//! A sender-side [`UdpPeerSender`] talks to a bare receiver socket through
//! a relay that drops datagrams; acknowledgements travel back directly.
//! This isolates the resend machinery: lost payloads reappear after the
//! resend deadline, acknowledged payloads stop being retransmitted.

use std::net::SocketAddr;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;

use arena_shared::clock::GameClock;
use arena_shared::sender::{Delivery, UdpPeerSender};
use arena_shared::wire::{
    udp_tag, DatagramWriter, Wire, WireReader, WireWriter, MAX_DATAGRAM_SIZE, UDP_HEADER_SIZE,
};

/// A sequence-numbered test message.
struct Seq(u16);

impl Wire for Seq {
    fn wire_size(&self) -> usize {
        2
    }
    fn encode(&self, w: &mut WireWriter) {
        w.write_u16(self.0);
    }
    fn decode(r: &mut WireReader<'_>) -> Option<Self> {
        r.read_u16().map(Seq)
    }
}

const SEQ_TAG: u8 = udp_tag::MIN_USER;

/// Receiver half: records sequence numbers and acks every ack-request.
struct Receiver {
    socket: UdpSocket,
    ack_to: SocketAddr,
    received: Vec<u16>,
}

impl Receiver {
    fn pump(&mut self) -> anyhow::Result<()> {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, _) = match self.socket.try_recv_from(&mut buf) {
                Ok(pair) => pair,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            if len < UDP_HEADER_SIZE {
                continue;
            }
            let mut reader = WireReader::new(&buf[UDP_HEADER_SIZE..len]);
            loop {
                match reader.current_tag() {
                    udp_tag::NO_MESSAGE => break,
                    udp_tag::ACK_REQUEST => {
                        let ack = reader.read_u16().unwrap();
                        let mut response = DatagramWriter::new(MAX_DATAGRAM_SIZE);
                        assert!(response.add_ack_response(ack) > 0);
                        self.socket
                            .try_send_to(response.payload().unwrap(), self.ack_to)?;
                        reader.advance_tag();
                    }
                    SEQ_TAG => {
                        let seq = Seq::decode(&mut reader).unwrap();
                        self.received.push(seq.0);
                        reader.advance_tag();
                    }
                    other => panic!("unexpected tag {other}"),
                }
            }
        }
    }
}

/// Sender half: drains acks into the peer sender and dispatches datagrams.
struct SenderHarness {
    socket: UdpSocket,
    sender: UdpPeerSender,
    data_to: SocketAddr,
    timeout: f32,
    datagrams_sent: usize,
}

impl SenderHarness {
    fn pump(&mut self, now: f32) -> anyhow::Result<()> {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, _) = match self.socket.try_recv_from(&mut buf) {
                Ok(pair) => pair,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            };
            if len < UDP_HEADER_SIZE {
                continue;
            }
            let mut reader = WireReader::new(&buf[UDP_HEADER_SIZE..len]);
            while reader.current_tag() == udp_tag::ACK_RESPONSE {
                let ack = reader.read_u16().unwrap();
                self.sender.on_ack_response(ack);
                reader.advance_tag();
            }
        }

        self.sender.process_resends(self.timeout, now);
        if let Some(payload) = self.sender.payload() {
            match self.socket.try_send_to(payload, self.data_to) {
                Ok(_) => {
                    self.sender.mark_sent();
                    self.datagrams_sent += 1;
                }
                // Busy socket: the datagram stays armed for the next pump.
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Relay forwarding sender datagrams to the receiver, with a drop policy.
struct Relay {
    socket: UdpSocket,
    forward_to: SocketAddr,
    drop: Box<dyn FnMut() -> bool + Send>,
    forwarded: usize,
}

impl Relay {
    fn pump(&mut self) -> anyhow::Result<()> {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, _) = match self.socket.try_recv_from(&mut buf) {
                Ok(pair) => pair,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            if (self.drop)() {
                continue;
            }
            self.socket.try_send_to(&buf[..len], self.forward_to)?;
            self.forwarded += 1;
        }
    }
}

async fn harness(
    timeout: f32,
    drop: Box<dyn FnMut() -> bool + Send>,
) -> anyhow::Result<(SenderHarness, Relay, Receiver)> {
    let sender_socket = UdpSocket::bind("127.0.0.1:0").await?;
    let relay_socket = UdpSocket::bind("127.0.0.1:0").await?;
    let receiver_socket = UdpSocket::bind("127.0.0.1:0").await?;

    let sender_addr = sender_socket.local_addr()?;
    let relay_addr = relay_socket.local_addr()?;
    let receiver_addr = receiver_socket.local_addr()?;

    Ok((
        SenderHarness {
            socket: sender_socket,
            sender: UdpPeerSender::new(3000, MAX_DATAGRAM_SIZE),
            data_to: relay_addr,
            timeout,
            datagrams_sent: 0,
        },
        Relay {
            socket: relay_socket,
            forward_to: receiver_addr,
            drop,
            forwarded: 0,
        },
        Receiver {
            socket: receiver_socket,
            ack_to: sender_addr,
            received: Vec::new(),
        },
    ))
}

/// The first transmission is dropped; the resend gets through and is
/// acknowledged. The receiver sees the payload exactly once and the sender
/// retires the record: exactly two datagrams ever leave the sender.
#[tokio::test]
async fn lost_reliable_payload_is_resent_then_retired() -> anyhow::Result<()> {
    // bad round trip 100 ms, resend factor 1.5
    let timeout = 0.15;
    let mut drops = 0u32;
    let (mut sender, mut relay, mut receiver) = harness(
        timeout,
        Box::new(move || {
            drops += 1;
            drops == 1 // exactly the first transmission is lost
        }),
    )
    .await?;

    let clock = GameClock::new();
    assert!(sender.sender.append(
        SEQ_TAG,
        &Seq(7),
        Delivery::Reliable,
        None,
        timeout,
        clock.now(),
    ));

    let mut received_at = None;
    while clock.now() < 1.2 {
        let now = clock.now();
        sender.pump(now)?;
        relay.pump()?;
        receiver.pump()?;
        if received_at.is_none() && !receiver.received.is_empty() {
            received_at = Some(now);
        }
        // Watch for two resend intervals past the delivery before judging.
        if let Some(at) = received_at {
            if now > at + 2.0 * timeout {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(receiver.received, vec![7], "payload must arrive exactly once");
    assert_eq!(
        sender.datagrams_sent, 2,
        "one loss, one resend, then the ack retired the record"
    );
    Ok(())
}

/// Random 50% loss on the data path: every message still arrives, and the
/// sender queue drains once the acknowledgements come back.
#[tokio::test]
async fn all_messages_survive_random_loss() -> anyhow::Result<()> {
    let timeout = 0.1;
    let mut rng = StdRng::seed_from_u64(7);
    let (mut sender, mut relay, mut receiver) =
        harness(timeout, Box::new(move || rng.gen_bool(0.5))).await?;

    let clock = GameClock::new();
    let total = 8u16;
    let mut next_seq = 0u16;

    while clock.now() < 10.0 {
        let now = clock.now();
        // Feed the next message once the previous one has been seen.
        if next_seq < total && receiver.received.len() == next_seq as usize {
            assert!(sender.sender.append(
                SEQ_TAG,
                &Seq(next_seq),
                Delivery::Reliable,
                None,
                timeout,
                now,
            ));
            next_seq += 1;
        }
        sender.pump(now)?;
        relay.pump()?;
        receiver.pump()?;
        if receiver.received.len() as u16 == total {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut seen = receiver.received.clone();
    seen.dedup();
    assert_eq!(
        seen,
        (0..total).collect::<Vec<u16>>(),
        "every sequence number must arrive, in order of submission"
    );
    Ok(())
}
