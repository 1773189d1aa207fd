//! LAN server discovery, client side.
//!
//! Broadcasts a discovery message to each configured LAN's directed
//! broadcast address on demand and deduplicates the responses into a list
//! of `(ip, tcp_port)` server addresses.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::Context;
use tokio::net::UdpSocket;
use tracing::{debug, info};

use arena_shared::config::{LanInterface, NetConfig};
use arena_shared::wire::{udp_tag, DatagramWriter, WireReader, MAX_DATAGRAM_SIZE, UDP_HEADER_SIZE};

/// Discovered server application address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredServer {
    pub ip: Ipv4Addr,
    pub tcp_port: u16,
}

/// Finds LAN servers via broadcast.
pub struct LanFinder {
    socket: UdpSocket,
    lans: Vec<LanInterface>,
    advertiser_port: u16,
    discovered: Vec<DiscoveredServer>,
}

impl LanFinder {
    pub async fn bind(cfg: &NetConfig) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
            .await
            .context("bind discovery socket")?;
        socket.set_broadcast(true).context("enable broadcast")?;
        Ok(Self {
            socket,
            lans: cfg.lan_interfaces.clone(),
            advertiser_port: cfg.discovery_port,
            discovered: Vec::new(),
        })
    }

    /// Sends one discovery datagram to every connected LAN. Called on user
    /// request, never periodically, so the send may await writability.
    pub async fn send_discovery(&mut self) -> anyhow::Result<()> {
        let mut writer = DatagramWriter::new(MAX_DATAGRAM_SIZE);
        writer.add_lan_discovery();
        let payload = writer.payload().expect("discovery message present");

        for lan in &self.lans {
            let target = SocketAddrV4::new(lan.broadcast(), self.advertiser_port);
            self.socket
                .send_to(payload, SocketAddr::V4(target))
                .await
                .context("send discovery broadcast")?;
            debug!(%target, "discovery broadcast sent");
        }
        Ok(())
    }

    /// Collects advertiser responses. Malformed datagrams are ignored.
    pub fn update(&mut self) -> anyhow::Result<()> {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, _from) = match self.socket.try_recv_from(&mut buf) {
                Ok(pair) => pair,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e).context("recv discovery response")?,
            };
            if len < UDP_HEADER_SIZE {
                continue;
            }
            let mut reader = WireReader::new(&buf[UDP_HEADER_SIZE..len]);
            if reader.current_tag() != udp_tag::LAN_SERVER_RESPONSE {
                continue;
            }
            let Some(ip) = reader.read_u32() else { continue };
            let Some(tcp_port) = reader.read_u16() else { continue };
            reader.advance_tag();
            if reader.current_tag() != udp_tag::NO_MESSAGE {
                continue;
            }
            self.add_server(DiscoveredServer {
                ip: Ipv4Addr::from(ip),
                tcp_port,
            });
        }
    }

    fn add_server(&mut self, server: DiscoveredServer) {
        if self.discovered.contains(&server) {
            return;
        }
        info!(ip = %server.ip, port = server.tcp_port, "found a server application");
        self.discovered.push(server);
    }

    /// Deduplicated list of discovered servers.
    pub fn servers(&self) -> &[DiscoveredServer] {
        &self.discovered
    }
}
