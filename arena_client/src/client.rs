//! Client connection state machine.
//!
//! `Disconnected → Connecting → Connected → ReadyToUse → Disconnecting`,
//! with every transition driven by network events the client cannot
//! control. Each state owns its sockets exclusively; a transition moves
//! them into the next state's variant. Connection outcomes and roster
//! changes are delivered to the application through one ordered event
//! queue; user messages ride on separate TCP/UDP message queues once the
//! session is joined.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::pin::Pin;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use arena_shared::clock::{GameClock, TimePeriod};
use arena_shared::config::NetConfig;
use arena_shared::packet::{TcpPacket, UdpPacket};
use arena_shared::sender::{Delivery, LossToken};
use arena_shared::session::{Member, Session, SessionEvent};
use arena_shared::tcp::TcpEndpoint;
use arena_shared::timesync::ClientClock;
use arena_shared::wire::{tcp_tag, Wire, WireReader, WireWriter, TCP_MAX_PACKET_SIZE};

use crate::udp::ClientUdpSocket;

/// Observable state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStateKind {
    Disconnected,
    Connecting,
    Connected,
    ReadyToUse,
    Disconnecting,
}

/// Why a connection attempt did not reach the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    TimedOut {
        addr: SocketAddr,
    },
    Socket {
        addr: SocketAddr,
        message: String,
    },
    SessionFull {
        addr: SocketAddr,
    },
    WrongPassword {
        addr: SocketAddr,
        password: String,
    },
}

/// Why an established connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The application asked for the disconnect.
    Local,
    /// The server removed this client from the session.
    Removed,
    /// The peer closed or reset the connection.
    RemoteClosed,
}

/// Connection outcomes and roster changes, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// TCP connection established; session negotiation started.
    Connected,
    /// Accepted into the session.
    JoinedSession { own_id: u16 },
    ConnectFailed(ConnectFailure),
    MemberJoined(Member),
    MemberLeft(u16),
    Disconnected(DisconnectReason),
}

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

struct ConnectingState {
    connect: ConnectFuture,
    timeout: TimePeriod,
    server: SocketAddr,
    password: String,
}

struct ConnectedState {
    tcp: TcpEndpoint,
    udp: ClientUdpSocket,
    server: SocketAddr,
    password: String,
}

struct ReadyState {
    tcp: TcpEndpoint,
    udp: ClientUdpSocket,
    session: Session,
    clock_sync: ClientClock,
    tcp_messages: VecDeque<TcpPacket>,
    disconnecting: Option<DisconnectReason>,
}

struct DisconnectingState {
    tcp: TcpEndpoint,
    reason: DisconnectReason,
    /// Waiting for the peer's FIN is bounded by one bad round trip; after
    /// that the socket is force-closed.
    deadline: TimePeriod,
}

enum ConnectionState {
    Disconnected,
    Connecting(ConnectingState),
    Connected(ConnectedState),
    ReadyToUse(Box<ReadyState>),
    Disconnecting(DisconnectingState),
}

/// High-level network client.
pub struct Client {
    cfg: NetConfig,
    clock: GameClock,
    state: ConnectionState,
    events: VecDeque<ClientEvent>,
}

impl Client {
    pub fn new(cfg: NetConfig) -> Self {
        Self {
            cfg,
            clock: GameClock::new(),
            state: ConnectionState::Disconnected,
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ClientStateKind {
        match &self.state {
            ConnectionState::Disconnected => ClientStateKind::Disconnected,
            ConnectionState::Connecting(_) => ClientStateKind::Connecting,
            ConnectionState::Connected(_) => ClientStateKind::Connected,
            ConnectionState::ReadyToUse(_) => ClientStateKind::ReadyToUse,
            ConnectionState::Disconnecting(_) => ClientStateKind::Disconnecting,
        }
    }

    /// The session, once this client has been accepted into one.
    pub fn session(&self) -> Option<&Session> {
        match &self.state {
            ConnectionState::ReadyToUse(ready) => Some(&ready.session),
            _ => None,
        }
    }

    /// Synchronized network time; falls back to local time before a
    /// session exists.
    pub fn network_time(&mut self) -> f32 {
        let now = self.clock.now();
        match &mut self.state {
            ConnectionState::ReadyToUse(ready) => ready.clock_sync.network_time(now),
            _ => now,
        }
    }

    /// Starts a connection attempt. Only valid while disconnected.
    pub fn connect(&mut self, server: SocketAddr, password: &str) -> anyhow::Result<()> {
        anyhow::ensure!(
            matches!(self.state, ConnectionState::Disconnected),
            "connect requires the disconnected state"
        );
        info!(%server, "connecting");
        self.state = ConnectionState::Connecting(ConnectingState {
            connect: Box::pin(TcpStream::connect(server)),
            timeout: TimePeriod::new(self.cfg.connect_timeout, self.clock.now()),
            server,
            password: password.to_string(),
        });
        Ok(())
    }

    /// Asks for an orderly shutdown of the connection.
    pub async fn disconnect(&mut self) {
        match std::mem::replace(&mut self.state, ConnectionState::Disconnected) {
            ConnectionState::Connected(mut state) => {
                state.tcp.stop_sending();
                self.state = ConnectionState::Disconnecting(DisconnectingState {
                    tcp: state.tcp,
                    reason: DisconnectReason::Local,
                    deadline: TimePeriod::new(self.cfg.initial_bad_rtt, self.clock.now()),
                });
            }
            ConnectionState::ReadyToUse(mut ready) => {
                ready.tcp.stop_sending();
                let budget = ready.clock_sync.bad_rtt();
                self.state = ConnectionState::Disconnecting(DisconnectingState {
                    tcp: ready.tcp,
                    reason: DisconnectReason::Local,
                    deadline: TimePeriod::new(budget, self.clock.now()),
                });
            }
            ConnectionState::Connecting(_) | ConnectionState::Disconnected => {
                self.events
                    .push_back(ClientEvent::Disconnected(DisconnectReason::Local));
                self.state = ConnectionState::Disconnected;
            }
            other @ ConnectionState::Disconnecting(_) => self.state = other,
        }
    }

    /// Drives one tick of the state machine: socket readiness, received
    /// messages, transitions.
    pub async fn update(&mut self) -> anyhow::Result<()> {
        let state = std::mem::replace(&mut self.state, ConnectionState::Disconnected);
        self.state = match state {
            ConnectionState::Disconnected => ConnectionState::Disconnected,
            ConnectionState::Connecting(state) => self.update_connecting(state).await?,
            ConnectionState::Connected(state) => self.update_connected(state).await?,
            ConnectionState::ReadyToUse(state) => self.update_ready(state).await?,
            ConnectionState::Disconnecting(state) => self.update_disconnecting(state).await?,
        };
        Ok(())
    }

    /// Flushes send buffers up to `would_block`.
    pub async fn send(&mut self) -> anyhow::Result<()> {
        let now = self.clock.now();
        match &mut self.state {
            ConnectionState::Connected(state) => state.tcp.try_send().await,
            ConnectionState::ReadyToUse(ready) => {
                ready.tcp.try_send().await?;
                ready.udp.send(&mut ready.clock_sync, now)
            }
            ConnectionState::Disconnecting(state) => state.tcp.try_send().await,
            _ => Ok(()),
        }
    }

    async fn update_connecting(
        &mut self,
        mut state: ConnectingState,
    ) -> anyhow::Result<ConnectionState> {
        // Poll the in-flight connect without waiting on it.
        match tokio::time::timeout(Duration::ZERO, state.connect.as_mut()).await {
            Ok(Ok(stream)) => {
                self.events.push_back(ClientEvent::Connected);
                match self.enter_connected(stream, state.server, state.password).await {
                    Ok(connected) => Ok(ConnectionState::Connected(connected)),
                    Err(e) => {
                        warn!(error = %e, "connection setup failed");
                        self.events
                            .push_back(ClientEvent::ConnectFailed(ConnectFailure::Socket {
                                addr: state.server,
                                message: e.to_string(),
                            }));
                        Ok(ConnectionState::Disconnected)
                    }
                }
            }
            Ok(Err(e)) => {
                self.events
                    .push_back(ClientEvent::ConnectFailed(ConnectFailure::Socket {
                        addr: state.server,
                        message: e.to_string(),
                    }));
                Ok(ConnectionState::Disconnected)
            }
            Err(_) => {
                if state.timeout.has_expired(self.clock.now()) {
                    info!(server = %state.server, "connection attempt timed out");
                    self.events
                        .push_back(ClientEvent::ConnectFailed(ConnectFailure::TimedOut {
                            addr: state.server,
                        }));
                    Ok(ConnectionState::Disconnected)
                } else {
                    Ok(ConnectionState::Connecting(state))
                }
            }
        }
    }

    /// Builds the Connected state: UDP socket, then the session request.
    async fn enter_connected(
        &mut self,
        stream: TcpStream,
        server: SocketAddr,
        password: String,
    ) -> anyhow::Result<ConnectedState> {
        let mut tcp = TcpEndpoint::new(stream)?;
        let local_ip = match tcp.local_addr()? {
            SocketAddr::V4(addr) => *addr.ip(),
            SocketAddr::V6(_) => anyhow::bail!("ipv6 endpoints are not supported"),
        };
        let udp = ClientUdpSocket::bind(&self.cfg, local_ip, self.clock.now()).await?;

        let request = session_request_packet(local_ip, udp.port()?, &password, udp.multicast_capable());
        tcp.enqueue_front(&request);
        tcp.try_send().await?;
        debug!(%server, "session request sent");

        Ok(ConnectedState {
            tcp,
            udp,
            server,
            password,
        })
    }

    async fn update_connected(
        &mut self,
        mut state: ConnectedState,
    ) -> anyhow::Result<ConnectionState> {
        state.tcp.try_send().await?;
        // Packets that rode in with a FIN still carry the server's verdict;
        // act on the close only after the queue is drained.
        let open = state.tcp.try_receive()?;

        while let Some(packet) = state.tcp.pop_packet() {
            let mut reader = WireReader::new(packet.payload());
            match reader.current_tag() {
                tcp_tag::SESSION_POSITIVE_RESPONSE => {
                    let Some(session) = read_session_response(&mut reader) else {
                        // Unusable response; wait for the server to retry
                        // or close.
                        continue;
                    };
                    return self.enter_ready(state, session);
                }
                tcp_tag::SESSION_IS_FULL => {
                    state.tcp.stop_sending();
                    self.events
                        .push_back(ClientEvent::ConnectFailed(ConnectFailure::SessionFull {
                            addr: state.server,
                        }));
                    return Ok(ConnectionState::Disconnecting(DisconnectingState {
                        tcp: state.tcp,
                        reason: DisconnectReason::Local,
                        deadline: TimePeriod::new(self.cfg.initial_bad_rtt, self.clock.now()),
                    }));
                }
                tcp_tag::SESSION_WRONG_PASSWORD => {
                    state.tcp.stop_sending();
                    self.events
                        .push_back(ClientEvent::ConnectFailed(ConnectFailure::WrongPassword {
                            addr: state.server,
                            password: state.password.clone(),
                        }));
                    return Ok(ConnectionState::Disconnecting(DisconnectingState {
                        tcp: state.tcp,
                        reason: DisconnectReason::Local,
                        deadline: TimePeriod::new(self.cfg.initial_bad_rtt, self.clock.now()),
                    }));
                }
                other => {
                    // Nothing else is legal before the session response.
                    warn!(tag = other, "unexpected message while negotiating, dropped");
                }
            }
        }
        if !open {
            self.events
                .push_back(ClientEvent::Disconnected(DisconnectReason::RemoteClosed));
            return Ok(ConnectionState::Disconnected);
        }
        Ok(ConnectionState::Connected(state))
    }

    fn enter_ready(
        &mut self,
        state: ConnectedState,
        session: Session,
    ) -> anyhow::Result<ConnectionState> {
        let mut ready = Box::new(ReadyState {
            tcp: state.tcp,
            udp: state.udp,
            clock_sync: ClientClock::new(&self.cfg, self.clock.now()),
            session,
            tcp_messages: VecDeque::new(),
            disconnecting: None,
        });

        ready.tcp.set_id(ready.session.own_id());
        let server = ready
            .session
            .member(arena_shared::wire::SERVER_ID)
            .context("session response lacks the server member")?;
        ready.udp.set_server_addr(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::from(server.ip),
            server.udp_port,
        )));

        info!(own_id = ready.session.own_id(), "joined session");
        self.events.push_back(ClientEvent::JoinedSession {
            own_id: ready.session.own_id(),
        });
        // Registration delivers a synthetic join for every existing member.
        for event in ready.session.drain_events() {
            self.push_session_event(event);
        }
        Ok(ConnectionState::ReadyToUse(ready))
    }

    async fn update_ready(
        &mut self,
        mut ready: Box<ReadyState>,
    ) -> anyhow::Result<ConnectionState> {
        let now = self.clock.now();
        ready.udp.update(&mut ready.clock_sync, now);
        ready
            .udp
            .try_receive(&ready.session, &mut ready.clock_sync, now)?;

        // Process everything that arrived even when a close rode in with
        // it; roster updates must not be lost.
        let open = ready.tcp.try_receive()?;

        while let Some(mut packet) = ready.tcp.pop_packet() {
            let mut reader = WireReader::new(packet.payload());
            loop {
                let tag = reader.current_tag();
                if tag >= tcp_tag::MIN_USER {
                    let at = reader.message_start();
                    if at > 0 {
                        packet.chop_front(at);
                    }
                    ready.tcp_messages.push_back(packet);
                    break;
                }
                match tag {
                    tcp_tag::NO_MESSAGE => break,
                    tcp_tag::SESSION_NEW_MEMBER => {
                        let Some(member) = read_member(&mut reader) else { break };
                        ready.session.add_member(member);
                        reader.advance_tag();
                    }
                    tcp_tag::SESSION_REMOVE_MEMBER => {
                        let Some(id) = reader.read_u16() else { break };
                        ready.session.remove_member(id);
                        if id == ready.session.own_id() {
                            ready.disconnecting = Some(DisconnectReason::Removed);
                        }
                        reader.advance_tag();
                    }
                    other => {
                        warn!(tag = other, "illegal session message, dropping packet");
                        break;
                    }
                }
            }
        }

        for event in ready.session.drain_events() {
            self.push_session_event(event);
        }

        if let Some(reason) = ready.disconnecting {
            ready.tcp.stop_sending();
            let budget = ready.clock_sync.bad_rtt();
            return Ok(ConnectionState::Disconnecting(DisconnectingState {
                tcp: ready.tcp,
                reason,
                deadline: TimePeriod::new(budget, self.clock.now()),
            }));
        }
        if !open {
            self.events
                .push_back(ClientEvent::Disconnected(DisconnectReason::RemoteClosed));
            return Ok(ConnectionState::Disconnected);
        }
        Ok(ConnectionState::ReadyToUse(ready))
    }

    async fn update_disconnecting(
        &mut self,
        mut state: DisconnectingState,
    ) -> anyhow::Result<ConnectionState> {
        // Drain what is queued so the FIN can follow, then wait for the
        // peer's FIN; received data is discarded.
        let _ = state.tcp.try_send().await;
        match state.tcp.try_receive() {
            Ok(true) => {
                while state.tcp.pop_packet().is_some() {}
                if state.deadline.has_expired(self.clock.now()) {
                    info!("peer did not close in time, force-closing");
                    self.events.push_back(ClientEvent::Disconnected(state.reason));
                    return Ok(ConnectionState::Disconnected);
                }
                Ok(ConnectionState::Disconnecting(state))
            }
            Ok(false) => {
                info!("connection closed");
                self.events.push_back(ClientEvent::Disconnected(state.reason));
                Ok(ConnectionState::Disconnected)
            }
            Err(_) => {
                // Reset while closing still counts as closed.
                self.events.push_back(ClientEvent::Disconnected(state.reason));
                Ok(ConnectionState::Disconnected)
            }
        }
    }

    fn push_session_event(&mut self, event: SessionEvent) {
        self.events.push_back(match event {
            SessionEvent::MemberAdded(member) => ClientEvent::MemberJoined(member),
            SessionEvent::MemberRemoved(id) => ClientEvent::MemberLeft(id),
        });
    }

    /// Queues a user message on the reliable TCP stream.
    pub fn add_tcp_message(&mut self, tag: u8, msg: &dyn Wire) -> anyhow::Result<()> {
        debug_assert!(tag >= tcp_tag::MIN_USER);
        let ConnectionState::ReadyToUse(ready) = &mut self.state else {
            anyhow::bail!("tcp messages require a joined session");
        };
        let packet = TcpPacket::single(tag, msg, ready.session.own_id());
        ready.tcp.enqueue(&packet);
        Ok(())
    }

    /// Appends a user message to the datagram toward the server. Returns
    /// `false` when the byte budget or the MTU denies it this period.
    pub fn add_udp_message(
        &mut self,
        tag: u8,
        msg: &dyn Wire,
        delivery: Delivery,
        token: Option<LossToken>,
    ) -> anyhow::Result<bool> {
        let now = self.clock.now();
        let ConnectionState::ReadyToUse(ready) = &mut self.state else {
            anyhow::bail!("udp messages require a joined session");
        };
        Ok(ready
            .udp
            .append(tag, msg, delivery, token, &ready.clock_sync, now))
    }

    /// Asks the server to remove another member from the session.
    pub fn kick(&mut self, id: u16) -> anyhow::Result<()> {
        anyhow::ensure!(id != arena_shared::wire::SERVER_ID, "cannot kick the server");
        let ConnectionState::ReadyToUse(ready) = &mut self.state else {
            anyhow::bail!("kick requires a joined session");
        };
        let mut w = WireWriter::new(TCP_MAX_PACKET_SIZE);
        w.write_u8(tcp_tag::SESSION_REMOVE_MEMBER);
        w.write_u16(id);
        let packet = TcpPacket::from_payload(w.as_slice(), ready.session.own_id());
        ready.tcp.enqueue(&packet);
        Ok(())
    }

    /// Next buffered application message from the TCP stream.
    pub fn next_tcp_message(&mut self) -> Option<TcpPacket> {
        match &mut self.state {
            ConnectionState::ReadyToUse(ready) => ready.tcp_messages.pop_front(),
            _ => None,
        }
    }

    /// Next buffered application message from the datagram socket.
    pub fn next_udp_message(&mut self) -> Option<UdpPacket> {
        match &mut self.state {
            ConnectionState::ReadyToUse(ready) => ready.udp.pop_packet(),
            _ => None,
        }
    }

    /// Loss-info tokens that timed out without an acknowledgement.
    pub fn drain_lost(&mut self) -> Vec<LossToken> {
        match &mut self.state {
            ConnectionState::ReadyToUse(ready) => ready.udp.drain_lost(),
            _ => Vec::new(),
        }
    }

    /// Connection outcomes and roster changes since the last drain.
    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        self.events.drain(..).collect()
    }
}

/// Builds the session request sent on entering the Connected state.
fn session_request_packet(ip: Ipv4Addr, udp_port: u16, password: &str, multicast: bool) -> TcpPacket {
    let mut w = WireWriter::new(TCP_MAX_PACKET_SIZE);
    w.write_u8(tcp_tag::SESSION_REQUEST);
    w.write_u32(u32::from(ip));
    w.write_u16(udp_port);
    w.write_cstr(password);
    w.write_bool(multicast);
    TcpPacket::from_payload(w.as_slice(), 0)
}

fn read_member(reader: &mut WireReader<'_>) -> Option<Member> {
    Some(Member {
        ip: reader.read_u32()?,
        udp_port: reader.read_u16()?,
        id: reader.read_u16()?,
        multicast: reader.read_bool()?,
    })
}

/// Parses a positive session response into a live [`Session`].
fn read_session_response(reader: &mut WireReader<'_>) -> Option<Session> {
    let own_id = reader.read_u16()?;
    let max_clients = reader.read_u16()?;
    let password = reader.read_cstr()?;
    let start_time = reader.read_f32()?;
    let member_count = reader.read_u16()?;
    let mut session = Session::new(own_id, max_clients, start_time, password);
    for _ in 0..member_count {
        session.add_member(read_member(reader)?);
    }
    Some(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_response_roundtrip_builds_roster() {
        let mut w = WireWriter::new(256);
        w.write_u8(tcp_tag::SESSION_POSITIVE_RESPONSE);
        w.write_u16(2); // own id
        w.write_u16(3); // max clients
        w.write_cstr("pw");
        w.write_f32(12.5);
        w.write_u16(2); // member count
        for (id, port) in [(0u16, 9000u16), (2, 9002)] {
            w.write_u32(0x7F00_0001);
            w.write_u16(port);
            w.write_u16(id);
            w.write_bool(false);
        }

        let mut r = WireReader::new(w.as_slice());
        assert_eq!(r.current_tag(), tcp_tag::SESSION_POSITIVE_RESPONSE);
        let session = read_session_response(&mut r).unwrap();
        assert_eq!(session.own_id(), 2);
        assert_eq!(session.max_clients(), 3);
        assert_eq!(session.password(), "pw");
        assert_eq!(session.start_time(), 12.5);
        assert_eq!(session.members().len(), 2);
        assert_eq!(session.member(0).unwrap().udp_port, 9000);
    }

    #[test]
    fn truncated_session_response_is_rejected() {
        let mut w = WireWriter::new(64);
        w.write_u8(tcp_tag::SESSION_POSITIVE_RESPONSE);
        w.write_u16(2);
        let mut r = WireReader::new(w.as_slice());
        assert!(read_session_response(&mut r).is_none());
    }
}
