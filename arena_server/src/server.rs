//! Server session management.
//!
//! Accepts TCP connections as *pending* peers, validates their session
//! request, assigns the smallest free member id, distributes the roster
//! and propagates join/leave events to every remaining client. User
//! messages ride the same connections once a peer is a member.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use arena_shared::clock::GameClock;
use arena_shared::config::NetConfig;
use arena_shared::packet::{TcpPacket, UdpPacket};
use arena_shared::sender::{Delivery, LossToken};
use arena_shared::session::{Member, Session, SessionEvent};
use arena_shared::tcp::TcpEndpoint;
use arena_shared::timesync::ServerTimeSync;
use arena_shared::wire::{tcp_tag, Wire, WireReader, WireWriter, SERVER_ID, TCP_MAX_PACKET_SIZE};

use crate::udp::ServerUdpSocket;

/// Roster changes surfaced to the hosting application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    MemberJoined(Member),
    MemberLeft(u16),
}

/// One game server instance.
pub struct Server {
    cfg: NetConfig,
    clock: GameClock,
    listener: TcpListener,
    peers: Vec<TcpEndpoint>,
    udp: ServerUdpSocket,
    session: Session,
    timesync: ServerTimeSync,
    tcp_packets: VecDeque<TcpPacket>,
    events: VecDeque<ServerEvent>,
}

impl Server {
    /// Binds the listener and the datagram socket and opens the session.
    /// Port 0 in the configured address picks an ephemeral port; the
    /// address is published via LAN discovery or out of band.
    pub async fn bind(cfg: NetConfig) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let SocketAddr::V4(addr) = addr else {
            anyhow::bail!("ipv6 endpoints are not supported");
        };
        let clock = GameClock::new();
        let now = clock.now();

        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        let udp = ServerUdpSocket::bind(&cfg, *addr.ip(), now).await?;

        let mut session = Session::new(SERVER_ID, cfg.max_clients, now, cfg.password.clone());
        session.add_member(Member {
            ip: u32::from(*addr.ip()),
            udp_port: udp.port()?,
            id: SERVER_ID,
            multicast: udp.multicast_support(),
        });

        let mut server = Self {
            timesync: ServerTimeSync::new(&cfg),
            cfg,
            clock,
            listener,
            peers: Vec::new(),
            udp,
            session,
            tcp_packets: VecDeque::new(),
            events: VecDeque::new(),
        };
        server.sync_membership();

        let local = server.listener.local_addr()?;
        info!(%local, multicast = server.udp.multicast_support(), "server session open");
        Ok(server)
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &NetConfig {
        &self.cfg
    }

    /// Server network time is its own system time.
    pub fn network_time(&self) -> f32 {
        self.clock.now()
    }

    /// Connections including pending peers still negotiating.
    pub fn connection_count(&self) -> usize {
        self.peers.len()
    }

    /// One cooperative tick: accept, receive, dispatch, deadline upkeep.
    pub async fn update(&mut self) -> anyhow::Result<()> {
        let now = self.clock.now();

        self.accept_pending().await;
        self.udp
            .try_receive(&self.session, &mut self.timesync, now)?;
        self.receive_tcp().await?;
        self.udp.update(now);
        self.sync_membership();
        Ok(())
    }

    /// Flushes every send buffer up to `would_block`.
    pub async fn send(&mut self) -> anyhow::Result<()> {
        let now = self.clock.now();
        for peer in &mut self.peers {
            // A dead peer surfaces as a closed connection next update.
            let _ = peer.try_send().await;
        }
        self.udp.send(&self.timesync, now)
    }

    async fn accept_pending(&mut self) {
        loop {
            match tokio::time::timeout(Duration::ZERO, self.listener.accept()).await {
                Ok(Ok((stream, addr))) => match TcpEndpoint::new(stream) {
                    Ok(endpoint) => {
                        debug!(%addr, "connection accepted, awaiting session request");
                        self.peers.push(endpoint);
                    }
                    Err(e) => warn!(%addr, error = %e, "failed to adopt connection"),
                },
                Ok(Err(e)) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
                Err(_) => break, // nothing pending
            }
        }
    }

    async fn receive_tcp(&mut self) -> anyhow::Result<()> {
        let mut i = 0;
        while i < self.peers.len() {
            let open = match self.peers[i].try_receive() {
                Ok(open) => open,
                Err(e) => {
                    warn!(peer = self.peers[i].id(), error = %e, "connection failed");
                    false
                }
            };
            if !open {
                self.close_peer(i);
                continue; // the index now holds the next peer
            }

            let mut hostile = false;
            while let Some(packet) = self.peers[i].pop_packet() {
                if !self.process_tcp_packet(i, packet).await {
                    hostile = true;
                    break;
                }
            }
            if hostile {
                self.close_peer(i);
                continue;
            }
            i += 1;
        }
        Ok(())
    }

    /// Returns `false` when the peer violated the protocol and must go.
    async fn process_tcp_packet(&mut self, peer_idx: usize, mut packet: TcpPacket) -> bool {
        let payload = packet.payload().to_vec();
        let mut reader = WireReader::new(&payload);
        loop {
            let tag = reader.current_tag();
            if tag >= tcp_tag::MIN_USER {
                if self.peers[peer_idx].is_pending() {
                    // Game data before a session request: hostile.
                    return false;
                }
                let at = reader.message_start();
                if at > 0 {
                    packet.chop_front(at);
                }
                self.tcp_packets.push_back(packet);
                return true;
            }
            match tag {
                tcp_tag::NO_MESSAGE => return true,
                tcp_tag::SESSION_REQUEST => {
                    if !self.peers[peer_idx].is_pending() {
                        return false;
                    }
                    let Some(request) = read_session_request(&mut reader) else {
                        return false;
                    };
                    // A peer already being rejected cannot retry on the
                    // same connection.
                    if !self.peers[peer_idx].has_stopped_sending() {
                        self.process_session_request(peer_idx, request).await;
                    }
                    reader.advance_tag();
                }
                tcp_tag::SESSION_REMOVE_MEMBER => {
                    if self.peers[peer_idx].is_pending() {
                        return false;
                    }
                    let Some(id) = reader.read_u16() else { return false };
                    self.process_kick_request(id);
                    reader.advance_tag();
                }
                other => {
                    warn!(tag = other, "illegal session message from peer");
                    return false;
                }
            }
        }
    }

    /// Full / wrong password / welcome, per the negotiation rules.
    async fn process_session_request(&mut self, peer_idx: usize, request: SessionRequest) {
        if self.session.is_full() {
            debug!("rejecting session request, session is full");
            let packet = empty_message_packet(tcp_tag::SESSION_IS_FULL);
            self.peers[peer_idx].enqueue(&packet);
            self.peers[peer_idx].stop_sending();
            let _ = self.peers[peer_idx].try_send().await;
            return;
        }
        if !self.session.verify_password(&request.password) {
            debug!("rejecting session request, wrong password");
            let packet = empty_message_packet(tcp_tag::SESSION_WRONG_PASSWORD);
            self.peers[peer_idx].enqueue(&packet);
            self.peers[peer_idx].stop_sending();
            let _ = self.peers[peer_idx].try_send().await;
            return;
        }

        let id = self.session.next_free_id();
        let member = Member {
            ip: request.ip,
            udp_port: request.udp_port,
            id,
            multicast: request.multicast,
        };
        self.peers[peer_idx].set_id(id);
        self.session.add_member(member);
        self.sync_membership();
        info!(member = id, multicast = member.multicast, "client joined the session");

        let response = session_response_packet(&self.session, id);
        self.peers[peer_idx].enqueue(&response);

        let announcement = new_member_packet(&member);
        self.broadcast_packet(&announcement, id);
    }

    /// A member asked to remove `id`: half-close the target; the roster
    /// update follows once the peer's FIN comes back around.
    fn process_kick_request(&mut self, id: u16) {
        if id == SERVER_ID {
            return;
        }
        let Some(peer) = self.peers.iter_mut().find(|p| p.id() == id) else {
            return;
        };
        info!(member = id, "removal requested, closing the member's connection");
        peer.stop_sending();
    }

    /// Removes the peer at `idx`; members leave the roster and everyone
    /// remaining hears about it.
    fn close_peer(&mut self, idx: usize) {
        let peer = self.peers.remove(idx);
        let id = peer.id();
        if peer.is_pending() {
            debug!("pending connection closed");
            return;
        }
        info!(member = id, "client left the session");
        self.session.remove_member(id);
        self.sync_membership();
        let packet = remove_member_packet(id);
        self.broadcast_packet(&packet, SERVER_ID);
    }

    /// Pushes roster changes into every membership-tracking component.
    fn sync_membership(&mut self) {
        for event in self.session.drain_events() {
            match event {
                SessionEvent::MemberAdded(member) => {
                    self.udp.on_member_added(&member);
                    self.timesync.on_member_added(&member);
                    self.events.push_back(ServerEvent::MemberJoined(member));
                }
                SessionEvent::MemberRemoved(id) => {
                    self.udp.on_member_removed(id);
                    self.timesync.on_member_removed(id);
                    self.events.push_back(ServerEvent::MemberLeft(id));
                }
            }
        }
    }

    /// Enqueues one packet to every member connection except `except_id`.
    fn broadcast_packet(&mut self, packet: &TcpPacket, except_id: u16) {
        for peer in &mut self.peers {
            if !peer.is_pending() && peer.id() != except_id {
                peer.enqueue(packet);
            }
        }
    }

    /// Queues a user message for every session client.
    pub fn add_tcp_message(&mut self, tag: u8, msg: &dyn Wire) {
        self.add_tcp_message_except(tag, msg, SERVER_ID);
    }

    /// Queues a user message for every session client but `except_id`.
    pub fn add_tcp_message_except(&mut self, tag: u8, msg: &dyn Wire, except_id: u16) {
        debug_assert!(tag >= tcp_tag::MIN_USER);
        let packet = TcpPacket::single(tag, msg, SERVER_ID);
        self.broadcast_packet(&packet, except_id);
    }

    /// Appends a user message for every client over the multicast or
    /// unicast path. Returns the receiver ids that had no datagram room.
    pub fn add_udp_message(
        &mut self,
        tag: u8,
        msg: &dyn Wire,
        delivery: Delivery,
        token: Option<LossToken>,
    ) -> Vec<u16> {
        let now = self.clock.now();
        self.udp
            .broadcast(tag, msg, delivery, token, &self.session, &self.timesync, now)
    }

    /// Appends a user message toward a single client.
    pub fn add_udp_message_to(
        &mut self,
        id: u16,
        tag: u8,
        msg: &dyn Wire,
        delivery: Delivery,
        token: Option<LossToken>,
    ) -> bool {
        let now = self.clock.now();
        self.udp
            .append_to(id, tag, msg, delivery, token, &self.timesync, now)
    }

    pub fn next_tcp_message(&mut self) -> Option<TcpPacket> {
        self.tcp_packets.pop_front()
    }

    pub fn next_udp_message(&mut self) -> Option<UdpPacket> {
        self.udp.pop_packet()
    }

    /// Loss-info tokens that timed out without acknowledgement.
    pub fn drain_lost(&mut self) -> Vec<LossToken> {
        self.udp.drain_lost()
    }

    /// Roster changes since the last drain.
    pub fn drain_events(&mut self) -> Vec<ServerEvent> {
        self.events.drain(..).collect()
    }
}

struct SessionRequest {
    ip: u32,
    udp_port: u16,
    password: String,
    multicast: bool,
}

fn read_session_request(reader: &mut WireReader<'_>) -> Option<SessionRequest> {
    Some(SessionRequest {
        ip: reader.read_u32()?,
        udp_port: reader.read_u16()?,
        password: reader.read_cstr()?,
        multicast: reader.read_bool()?,
    })
}

fn empty_message_packet(tag: u8) -> TcpPacket {
    let mut w = WireWriter::new(TCP_MAX_PACKET_SIZE);
    w.write_u8(tag);
    TcpPacket::from_payload(w.as_slice(), SERVER_ID)
}

/// `assignedId, maxClients, password, startTime, memberCount, members[]`.
fn session_response_packet(session: &Session, assigned_id: u16) -> TcpPacket {
    let mut w = WireWriter::new(TCP_MAX_PACKET_SIZE);
    w.write_u8(tcp_tag::SESSION_POSITIVE_RESPONSE);
    w.write_u16(assigned_id);
    w.write_u16(session.max_clients());
    w.write_cstr(session.password());
    w.write_f32(session.start_time());
    w.write_u16(session.members().len() as u16);
    for member in session.members() {
        write_member(&mut w, member);
    }
    TcpPacket::from_payload(w.as_slice(), SERVER_ID)
}

fn new_member_packet(member: &Member) -> TcpPacket {
    let mut w = WireWriter::new(TCP_MAX_PACKET_SIZE);
    w.write_u8(tcp_tag::SESSION_NEW_MEMBER);
    write_member(&mut w, member);
    TcpPacket::from_payload(w.as_slice(), SERVER_ID)
}

fn remove_member_packet(id: u16) -> TcpPacket {
    let mut w = WireWriter::new(TCP_MAX_PACKET_SIZE);
    w.write_u8(tcp_tag::SESSION_REMOVE_MEMBER);
    w.write_u16(id);
    TcpPacket::from_payload(w.as_slice(), SERVER_ID)
}

fn write_member(w: &mut WireWriter, member: &Member) {
    w.write_u32(member.ip);
    w.write_u16(member.udp_port);
    w.write_u16(member.id);
    w.write_bool(member.multicast);
}

/// Binds a loopback server on an ephemeral port; used by the integration
/// tests and the workbench binaries.
pub async fn bind_ephemeral(password: &str, max_clients: u16) -> anyhow::Result<Server> {
    let cfg = NetConfig {
        server_addr: format!("{}:0", Ipv4Addr::LOCALHOST),
        password: password.to_string(),
        max_clients,
        multicast: Some(false),
        ..NetConfig::default()
    };
    Server::bind(cfg).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_response_packet_lists_sorted_roster() {
        let mut session = Session::new(SERVER_ID, 4, 1.5, "pw");
        session.add_member(Member {
            ip: 1,
            udp_port: 10,
            id: 0,
            multicast: false,
        });
        session.add_member(Member {
            ip: 2,
            udp_port: 20,
            id: 2,
            multicast: true,
        });

        let packet = session_response_packet(&session, 2);
        let mut r = WireReader::new(packet.payload());
        assert_eq!(r.current_tag(), tcp_tag::SESSION_POSITIVE_RESPONSE);
        assert_eq!(r.read_u16(), Some(2)); // assigned id
        assert_eq!(r.read_u16(), Some(4)); // max clients
        assert_eq!(r.read_cstr().as_deref(), Some("pw"));
        assert_eq!(r.read_f32(), Some(1.5));
        assert_eq!(r.read_u16(), Some(2)); // member count
        assert_eq!(r.read_u32(), Some(1)); // server first
    }

    #[tokio::test]
    async fn bind_ephemeral_opens_session_with_server_member() {
        let server = bind_ephemeral("", 0).await.unwrap();
        assert_eq!(server.session().members().len(), 1);
        assert_eq!(server.session().members()[0].id, SERVER_ID);
        assert_eq!(server.connection_count(), 0);
    }
}
