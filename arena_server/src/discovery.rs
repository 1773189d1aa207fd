//! LAN server discovery, server side.
//!
//! Listens on the well-known discovery port for broadcast requests and
//! answers each one with the server's TCP application address. Requests
//! from outside the connected LANs are ignored.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::Context;
use tokio::net::UdpSocket;
use tracing::{debug, info};

use arena_shared::config::{LanInterface, NetConfig};
use arena_shared::wire::{udp_tag, DatagramWriter, WireReader, MAX_DATAGRAM_SIZE, UDP_HEADER_SIZE};

/// Answers LAN discovery broadcasts with the server's address.
pub struct LanAdvertiser {
    socket: UdpSocket,
    lans: Vec<LanInterface>,
    /// Prebuilt response datagram; the address never changes.
    response: Vec<u8>,
    receivers: VecDeque<SocketAddrV4>,
}

impl LanAdvertiser {
    /// Binds the advertiser and prepares the response for
    /// `(server_ip, server_tcp_port)`.
    pub async fn bind(
        cfg: &NetConfig,
        server_ip: Ipv4Addr,
        server_tcp_port: u16,
    ) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            cfg.discovery_port,
        ))
        .await
        .context("bind advertiser socket")?;

        let mut writer = DatagramWriter::new(MAX_DATAGRAM_SIZE);
        writer.add_lan_response(u32::from(server_ip), server_tcp_port);
        let response = writer.payload().expect("response present").to_vec();

        info!(port = cfg.discovery_port, %server_ip, server_tcp_port, "advertising on the LAN");
        Ok(Self {
            socket,
            lans: cfg.lan_interfaces.clone(),
            response,
            receivers: VecDeque::new(),
        })
    }

    /// Collects discovery requests; each valid one queues a response.
    pub fn update(&mut self) -> anyhow::Result<()> {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, from) = match self.socket.try_recv_from(&mut buf) {
                Ok(pair) => pair,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e).context("recv discovery request")?,
            };
            let SocketAddr::V4(from) = from else { continue };
            if !self.lans.iter().any(|lan| lan.contains(*from.ip())) {
                debug!(%from, "discovery request from outside the LAN, ignored");
                continue;
            }
            if len < UDP_HEADER_SIZE {
                continue;
            }
            let mut reader = WireReader::new(&buf[UDP_HEADER_SIZE..len]);
            if reader.current_tag() != udp_tag::LAN_SERVER_DISCOVERY {
                continue;
            }
            reader.advance_tag();
            if reader.current_tag() != udp_tag::NO_MESSAGE {
                continue;
            }
            self.receivers.push_back(from);
        }
    }

    /// Sends queued responses until the socket would block.
    pub fn send_responses(&mut self) -> anyhow::Result<()> {
        while let Some(&to) = self.receivers.front() {
            match self.socket.try_send_to(&self.response, SocketAddr::V4(to)) {
                Ok(_) => {
                    debug!(%to, "discovery response sent");
                    self.receivers.pop_front();
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e).context("send discovery response")?,
            }
        }
        Ok(())
    }
}
