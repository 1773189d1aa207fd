//! Server UDP socket: one peer sender per session client plus the
//! multicast fan-out path.
//!
//! Time requests are answered inside the receive loop, before anything
//! else sees the datagram, so the clock-sync round trip measures the
//! network and not the server's frame time.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::Context;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use arena_shared::clock::TimePeriod;
use arena_shared::config::NetConfig;
use arena_shared::packet::UdpPacket;
use arena_shared::sender::{Delivery, LossToken, UdpPeerSender};
use arena_shared::session::{Member, Session};
use arena_shared::timesync::ServerTimeSync;
use arena_shared::wire::{udp_tag, DatagramWriter, Wire, WireReader, MAX_DATAGRAM_SIZE, SERVER_ID};

use crate::multicast::MulticastSender;

/// Unicast sender state for one session client.
struct PeerEntry {
    id: u16,
    addr: SocketAddrV4,
    sender: UdpPeerSender,
}

/// The server's datagram endpoint.
pub struct ServerUdpSocket {
    socket: UdpSocket,
    peers: Vec<PeerEntry>,
    multicast: MulticastSender,
    multicast_support: bool,
    /// Round-robin resume point: the first receiver whose dispatch hit
    /// `would_block` starts the next cycle, so rear receivers are not
    /// starved by a busy UDP layer.
    next_peer: usize,
    send_period: TimePeriod,
    packets: VecDeque<UdpPacket>,
    pending_ack_requests: VecDeque<(u16, u16)>,
    resend_factor: f32,
    bytes_per_period_to_client: u16,
}

impl ServerUdpSocket {
    /// Binds on `server_ip` and probes multicast capability (or takes the
    /// configured override). Group traffic is not looped back to this
    /// socket.
    pub async fn bind(cfg: &NetConfig, server_ip: Ipv4Addr, now: f32) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(server_ip, 0))
            .await
            .context("udp bind")?;
        let multicast_support = match cfg.multicast {
            Some(flag) => {
                if flag {
                    socket
                        .join_multicast_v4(cfg.multicast_group, server_ip)
                        .context("join multicast group")?;
                }
                flag
            }
            None => match socket.join_multicast_v4(cfg.multicast_group, server_ip) {
                Ok(()) => true,
                Err(e) => {
                    debug!(error = %e, "multicast probe failed, fan-out uses unicast copies");
                    false
                }
            },
        };
        if multicast_support {
            socket
                .set_multicast_loop_v4(false)
                .context("disable multicast loopback")?;
        }

        Ok(Self {
            socket,
            peers: Vec::new(),
            multicast: MulticastSender::new(cfg),
            multicast_support,
            next_peer: 0,
            send_period: TimePeriod::new(cfg.send_period, now),
            packets: VecDeque::new(),
            pending_ack_requests: VecDeque::new(),
            resend_factor: cfg.resend_factor,
            bytes_per_period_to_client: cfg.bytes_per_period_to_client,
        })
    }

    pub fn port(&self) -> anyhow::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    pub fn multicast_support(&self) -> bool {
        self.multicast_support
    }

    pub fn on_member_added(&mut self, member: &Member) {
        if member.id == SERVER_ID {
            return;
        }
        self.peers.push(PeerEntry {
            id: member.id,
            addr: SocketAddrV4::new(Ipv4Addr::from(member.ip), member.udp_port),
            sender: UdpPeerSender::new(self.bytes_per_period_to_client, MAX_DATAGRAM_SIZE),
        });
        if member.multicast {
            self.multicast.add_receiver(member.id);
        }
    }

    /// Pending reliable records and loss listeners for the leaver are
    /// discarded, not notified.
    pub fn on_member_removed(&mut self, id: u16) {
        self.peers.retain(|p| p.id != id);
        self.multicast.remove_receiver(id);
        if self.next_peer >= self.peers.len() {
            self.next_peer = 0;
        }
    }

    fn peer_mut(&mut self, id: u16) -> Option<&mut PeerEntry> {
        self.peers.iter_mut().find(|p| p.id == id)
    }

    /// Appends a user message toward one client.
    pub fn append_to(
        &mut self,
        id: u16,
        tag: u8,
        msg: &dyn Wire,
        delivery: Delivery,
        token: Option<LossToken>,
        timesync: &ServerTimeSync,
        now: f32,
    ) -> bool {
        let timeout = self.resend_factor * timesync.bad_rtt(id);
        match self.peer_mut(id) {
            Some(peer) => peer.sender.append(tag, msg, delivery, token, timeout, now),
            None => false,
        }
    }

    /// Appends a user message for every client, routing each receiver over
    /// multicast or its unicast sender by capability. Returns the ids whose
    /// datagram had no room; the caller may retry those next cycle.
    pub fn broadcast(
        &mut self,
        tag: u8,
        msg: &dyn Wire,
        delivery: Delivery,
        token: Option<LossToken>,
        session: &Session,
        timesync: &ServerTimeSync,
        now: f32,
    ) -> Vec<u16> {
        let mut failed = Vec::new();

        if !self.multicast_support {
            // No group path: every client gets its own copy.
            let timeouts: Vec<(u16, f32)> = self
                .peers
                .iter()
                .map(|p| (p.id, self.resend_factor * timesync.bad_rtt(p.id)))
                .collect();
            for (id, timeout) in timeouts {
                let peer = self.peer_mut(id).expect("peer listed above");
                if !peer.sender.append(tag, msg, delivery, token, timeout, now) {
                    failed.push(id);
                }
            }
            return failed;
        }

        let timeout = self.resend_factor * timesync.mean_bad_rtt();
        let multicast_ok = self.multicast.append(tag, msg, delivery, token, timeout, now);
        for member in session.members() {
            if member.id == SERVER_ID {
                continue;
            }
            if member.multicast {
                if !multicast_ok {
                    failed.push(member.id);
                }
            } else if !self.append_to(member.id, tag, msg, delivery, token, timesync, now) {
                failed.push(member.id);
            }
        }
        failed
    }

    /// Drains the socket up to `would_block`: session-member filter,
    /// transport message consumption, user payload hand-off.
    pub fn try_receive(
        &mut self,
        session: &Session,
        timesync: &mut ServerTimeSync,
        now: f32,
    ) -> anyhow::Result<()> {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, from) = match self.socket.try_recv_from(&mut buf) {
                Ok(pair) => pair,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e).context("udp recv")?,
            };
            let SocketAddr::V4(from) = from else { continue };
            let Some(sender_id) = session.member_by_addr(u32::from(*from.ip()), from.port())
            else {
                // Not a session member; drop silently.
                continue;
            };
            let Some(packet) = UdpPacket::parse(&buf[..len], sender_id, now) else {
                continue;
            };
            self.process_packet(packet, from, timesync, now);
        }

        // Answer queued ack requests; a full datagram defers the rest.
        let mut deferred = VecDeque::new();
        while let Some((id, ack)) = self.pending_ack_requests.pop_front() {
            match self.peer_mut(id) {
                Some(peer) => {
                    if !peer.sender.add_ack_response(ack) {
                        deferred.push_back((id, ack));
                    }
                }
                None => {} // left the session meanwhile
            }
        }
        self.pending_ack_requests = deferred;
        Ok(())
    }

    fn process_packet(
        &mut self,
        mut packet: UdpPacket,
        from: SocketAddrV4,
        timesync: &mut ServerTimeSync,
        now: f32,
    ) {
        let sender_id = packet.sender();
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
                udp_tag::TIME_INITIAL_REQUEST | udp_tag::TIME_UPDATE_REQUEST => {
                    let Some(client_time) = reader.read_f32() else { return };
                    self.answer_time_request(client_time, from, now);
                    if tag == udp_tag::TIME_UPDATE_REQUEST {
                        // Drifted clocks can put the request in the future;
                        // round trips beyond a second are noise.
                        let rtt = (2.0 * (now - client_time)).max(0.0);
                        if rtt < 1.0 {
                            timesync.add_sample(sender_id, rtt);
                        }
                    }
                    reader.advance_tag();
                }
                udp_tag::ACK_REQUEST => {
                    let Some(ack) = reader.read_u16() else { return };
                    self.pending_ack_requests.push_back((sender_id, ack));
                    reader.advance_tag();
                }
                udp_tag::ACK_RESPONSE => {
                    let Some(ack) = reader.read_u16() else { return };
                    self.multicast.process_ack_response(sender_id, ack);
                    if let Some(peer) = self.peer_mut(sender_id) {
                        peer.sender.on_ack_response(ack);
                    }
                    reader.advance_tag();
                }
                other => {
                    warn!(tag = other, sender = sender_id, "unexpected transport message");
                    return;
                }
            }
        }
    }

    /// The fast path: the response leaves within the same receive cycle.
    fn answer_time_request(&self, client_time: f32, to: SocketAddrV4, now: f32) {
        let mut writer = DatagramWriter::new(MAX_DATAGRAM_SIZE);
        writer.set_network_time(now);
        writer.add_time_response(client_time, now);
        let payload = writer.payload().expect("time response present");
        // A blocked send loses one sample; the client just asks again.
        let _ = self.socket.try_send_to(payload, SocketAddr::V4(to));
    }

    /// Dispatches the multicast datagram and then every unicast datagram,
    /// resuming the rotation at the first receiver that blocked last time.
    pub fn send(&mut self, timesync: &ServerTimeSync, now: f32) -> anyhow::Result<()> {
        self.run_multicast_resends(timesync, now);
        self.multicast.try_send(&self.socket)?;

        let count = self.peers.len();
        if count == 0 {
            return Ok(());
        }
        let start = self.next_peer.min(count - 1);
        for offset in 0..count {
            let i = (start + offset) % count;
            let timeout = self.resend_factor * timesync.bad_rtt(self.peers[i].id);
            self.peers[i].sender.process_resends(timeout, now);
            let Some(payload) = self.peers[i].sender.payload() else {
                continue;
            };
            match self.socket.try_send_to(payload, SocketAddr::V4(self.peers[i].addr)) {
                Ok(_) => self.peers[i].sender.mark_sent(),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.next_peer = i;
                    return Ok(());
                }
                Err(e) => return Err(e).context("udp send")?,
            }
        }
        self.next_peer = 0;
        Ok(())
    }

    fn run_multicast_resends(&mut self, timesync: &ServerTimeSync, now: f32) {
        let Self {
            multicast,
            peers,
            resend_factor,
            ..
        } = self;
        multicast.process_resends(now, |id, data| {
            let Some(peer) = peers.iter_mut().find(|p| p.id == id) else {
                // Already gone; nothing left to deliver.
                return true;
            };
            let timeout = *resend_factor * timesync.bad_rtt(id);
            peer.sender.append_stored(data, timeout, now)
        });
    }

    /// Per-tick bookkeeping: loss deadlines, network-time stamps and the
    /// send-period boundary.
    pub fn update(&mut self, now: f32) {
        self.multicast.set_network_time(now);
        self.multicast.collect_losses(now);
        for peer in &mut self.peers {
            peer.sender.set_network_time(now);
            peer.sender.collect_losses(now);
        }
        if !self.send_period.has_expired(now) {
            return;
        }
        self.send_period.reset(now);
        self.multicast.start_new_period();
        for peer in &mut self.peers {
            peer.sender.start_new_period();
        }
    }

    pub fn pop_packet(&mut self) -> Option<UdpPacket> {
        self.packets.pop_front()
    }

    /// Loss-info tokens that timed out, across multicast and unicast paths.
    pub fn drain_lost(&mut self) -> Vec<LossToken> {
        let mut lost = self.multicast.drain_lost();
        for peer in &mut self.peers {
            lost.extend(peer.sender.drain_lost());
        }
        lost
    }
}
