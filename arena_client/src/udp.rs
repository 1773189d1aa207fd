//! Client UDP socket: one peer sender toward the server, the datagram
//! source filter, and the built-in message fast paths.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::Context;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use arena_shared::clock::TimePeriod;
use arena_shared::config::NetConfig;
use arena_shared::packet::UdpPacket;
use arena_shared::sender::{Delivery, LossToken, UdpPeerSender};
use arena_shared::session::Session;
use arena_shared::timesync::ClientClock;
use arena_shared::wire::{udp_tag, Wire, WireReader, MAX_DATAGRAM_SIZE};

/// Client-side UDP endpoint. The only peer is the server.
pub struct ClientUdpSocket {
    socket: UdpSocket,
    sender: UdpPeerSender,
    server_addr: Option<SocketAddr>,
    send_period: TimePeriod,
    packets: VecDeque<UdpPacket>,
    /// Ack requests from the server waiting for response space.
    pending_ack_requests: VecDeque<u16>,
    resend_factor: f32,
    multicast: bool,
}

impl ClientUdpSocket {
    /// Binds the client socket on `local_ip` and probes multicast
    /// capability, unless the config overrides the flag. A capable client
    /// is bound to the well-known multicast port so group traffic reaches
    /// it.
    pub async fn bind(cfg: &NetConfig, local_ip: Ipv4Addr, now: f32) -> anyhow::Result<Self> {
        let (socket, multicast) = match cfg.multicast {
            Some(false) => {
                let socket = UdpSocket::bind(SocketAddrV4::new(local_ip, 0))
                    .await
                    .context("udp bind")?;
                (socket, false)
            }
            Some(true) => {
                let socket = UdpSocket::bind(SocketAddrV4::new(local_ip, cfg.multicast_port))
                    .await
                    .context("udp bind multicast port")?;
                socket
                    .join_multicast_v4(cfg.multicast_group, local_ip)
                    .context("join multicast group")?;
                (socket, true)
            }
            None => match UdpSocket::bind(SocketAddrV4::new(local_ip, cfg.multicast_port)).await {
                Ok(socket) => match socket.join_multicast_v4(cfg.multicast_group, local_ip) {
                    Ok(()) => (socket, true),
                    Err(e) => {
                        debug!(error = %e, "multicast probe failed, falling back to unicast");
                        drop(socket);
                        let socket = UdpSocket::bind(SocketAddrV4::new(local_ip, 0))
                            .await
                            .context("udp bind")?;
                        (socket, false)
                    }
                },
                Err(e) => {
                    // Port already taken (another client on this host).
                    debug!(error = %e, "multicast port unavailable, falling back to unicast");
                    let socket = UdpSocket::bind(SocketAddrV4::new(local_ip, 0))
                        .await
                        .context("udp bind")?;
                    (socket, false)
                }
            },
        };

        Ok(Self {
            socket,
            sender: UdpPeerSender::new(cfg.bytes_per_period_to_server, MAX_DATAGRAM_SIZE),
            server_addr: None,
            send_period: TimePeriod::new(cfg.send_period, now),
            packets: VecDeque::new(),
            pending_ack_requests: VecDeque::new(),
            resend_factor: cfg.resend_factor,
            multicast,
        })
    }

    pub fn port(&self) -> anyhow::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    pub fn multicast_capable(&self) -> bool {
        self.multicast
    }

    pub fn set_server_addr(&mut self, addr: SocketAddr) {
        self.server_addr = Some(addr);
    }

    /// Appends a user message toward the server.
    pub fn append(
        &mut self,
        tag: u8,
        msg: &dyn Wire,
        delivery: Delivery,
        token: Option<LossToken>,
        clock: &ClientClock,
        now: f32,
    ) -> bool {
        let timeout = self.resend_factor * clock.bad_rtt();
        self.sender.append(tag, msg, delivery, token, timeout, now)
    }

    /// Drains the socket up to `would_block`. Datagrams whose source does
    /// not resolve to a session member are dropped silently.
    pub fn try_receive(
        &mut self,
        session: &Session,
        clock: &mut ClientClock,
        system_now: f32,
    ) -> anyhow::Result<()> {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, from) = match self.socket.try_recv_from(&mut buf) {
                Ok(pair) => pair,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e).context("udp recv")?,
            };
            let SocketAddr::V4(from) = from else { continue };
            let Some(sender_id) =
                session.member_by_addr(u32::from(*from.ip()), from.port())
            else {
                continue;
            };
            let estimate = clock.network_time(system_now);
            let Some(packet) = UdpPacket::parse(&buf[..len], sender_id, estimate) else {
                continue;
            };
            self.process_packet(packet, clock, system_now);
        }

        // Answer collected ack requests while the datagram has room;
        // the remainder waits for the next cycle.
        while let Some(&ack) = self.pending_ack_requests.front() {
            if !self.sender.add_ack_response(ack) {
                break;
            }
            self.pending_ack_requests.pop_front();
        }
        Ok(())
    }

    fn process_packet(&mut self, mut packet: UdpPacket, clock: &mut ClientClock, system_now: f32) {
        let payload = packet.payload().to_vec();
        let mut reader = WireReader::new(&payload);
        loop {
            let tag = reader.current_tag();
            if tag >= udp_tag::MIN_USER {
                packet.chop_front(reader.message_start());
                self.packets.push_back(packet);
                return;
            }
            match tag {
                udp_tag::NO_MESSAGE => return,
                udp_tag::TIME_RESPONSE => {
                    let Some(client_time) = reader.read_f32() else { return };
                    let Some(server_time) = reader.read_f32() else { return };
                    clock.on_time_response(client_time, server_time, system_now);
                    reader.advance_tag();
                }
                udp_tag::ACK_REQUEST => {
                    let Some(ack) = reader.read_u16() else { return };
                    self.pending_ack_requests.push_back(ack);
                    reader.advance_tag();
                }
                udp_tag::ACK_RESPONSE => {
                    let Some(ack) = reader.read_u16() else { return };
                    self.sender.on_ack_response(ack);
                    reader.advance_tag();
                }
                other => {
                    // A tag the client never consumes; the datagram does
                    // not follow the protocol, drop the rest of it.
                    warn!(tag = other, "unexpected transport message, dropping datagram");
                    return;
                }
            }
        }
    }

    /// Flushes the assembled datagram, running resends and the time-request
    /// cadence first.
    pub fn send(&mut self, clock: &mut ClientClock, system_now: f32) -> anyhow::Result<()> {
        let timeout = self.resend_factor * clock.bad_rtt();
        self.sender.process_resends(timeout, system_now);

        if clock.needs_request(system_now) && !self.sender.has_time_request() {
            let network_now = clock.network_time(system_now);
            if self
                .sender
                .add_time_request(network_now, clock.is_initial_request())
            {
                clock.mark_requested(system_now);
            }
        }

        let Some(server) = self.server_addr else {
            return Ok(());
        };
        let Some(payload) = self.sender.payload() else {
            return Ok(());
        };
        match self.socket.try_send_to(payload, server) {
            Ok(_) => self.sender.mark_sent(),
            // Busy UDP layer: the datagram stays armed for the next cycle.
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e).context("udp send")?,
        }
        Ok(())
    }

    /// Per-tick bookkeeping: loss notification deadlines and the send
    /// period boundary.
    pub fn update(&mut self, clock: &mut ClientClock, system_now: f32) {
        self.sender.collect_losses(system_now);
        if !self.send_period.has_expired(system_now) {
            return;
        }
        self.send_period.reset(system_now);
        self.sender.start_new_period();
        let network_now = clock.network_time(system_now);
        self.sender.set_network_time(network_now);
    }

    pub fn pop_packet(&mut self) -> Option<UdpPacket> {
        self.packets.pop_front()
    }

    /// Loss-info tokens whose ack deadline lapsed since the last drain.
    pub fn drain_lost(&mut self) -> Vec<LossToken> {
        self.sender.drain_lost()
    }
}
