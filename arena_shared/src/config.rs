//! Configuration system.
//!
//! Every protocol constant with a tunable default lives here so that client
//! and server can be reconfigured without recompiling. Loading is from JSON
//! strings/files (file IO left to the app).

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// A LAN the machine is connected to, described by the local interface
/// address and the subnet mask. Drives directed broadcasts on the finder
/// side and the source filter on the advertiser side.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LanInterface {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl LanInterface {
    /// Directed broadcast address of this LAN.
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.ip) | !u32::from(self.netmask))
    }

    /// Whether `addr` belongs to this LAN's subnet.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        u32::from(self.ip) & mask == u32::from(addr) & mask
    }
}

fn default_lan_interfaces() -> Vec<LanInterface> {
    vec![LanInterface {
        ip: Ipv4Addr::LOCALHOST,
        netmask: Ipv4Addr::new(255, 0, 0, 0),
    }]
}

/// Root configuration shared by client and server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    /// Server bind/connect address, e.g. `127.0.0.1:0` (server port 0 means
    /// ephemeral; the address is published through LAN discovery).
    pub server_addr: String,
    /// Session password; empty accepts any offered password.
    #[serde(default)]
    pub password: String,
    /// Client cap for a session; 0 means unlimited.
    #[serde(default)]
    pub max_clients: u16,

    /// Seconds to wait for the TCP connection before giving up.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: f32,
    /// Length of one bandwidth accounting period in seconds.
    #[serde(default = "default_send_period")]
    pub send_period: f32,
    /// UDP byte budget per period toward the server.
    #[serde(default = "default_bytes_to_server")]
    pub bytes_per_period_to_server: u16,
    /// UDP byte budget per period toward each client.
    #[serde(default = "default_bytes_to_client")]
    pub bytes_per_period_to_client: u16,

    /// Seconds between clock-sync requests.
    #[serde(default = "default_time_request_period")]
    pub time_request_period: f32,
    /// Round-trip estimate used until a sample ring fills.
    #[serde(default = "default_initial_bad_rtt")]
    pub initial_bad_rtt: f32,
    /// Reliable resend deadline as a multiple of the bad round-trip time.
    #[serde(default = "default_resend_factor")]
    pub resend_factor: f32,
    /// Number of recent round-trip samples kept per peer.
    #[serde(default = "default_rtt_ring_size")]
    pub rtt_ring_size: usize,
    /// Clock corrections smaller than this (seconds) are ignored.
    #[serde(default = "default_sync_dead_band")]
    pub sync_dead_band: f32,

    /// Group joined for explicit multicast fan-out.
    #[serde(default = "default_multicast_group")]
    pub multicast_group: Ipv4Addr,
    #[serde(default = "default_multicast_port")]
    pub multicast_port: u16,
    /// Multicast capability override: `None` probes by joining the group,
    /// `Some(x)` trusts the operator.
    #[serde(default)]
    pub multicast: Option<bool>,

    /// Well-known port the LAN advertiser listens on.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// LANs used for discovery broadcasts and source filtering.
    #[serde(default = "default_lan_interfaces")]
    pub lan_interfaces: Vec<LanInterface>,
}

fn default_connect_timeout() -> f32 {
    1.0
}

fn default_send_period() -> f32 {
    0.050
}

fn default_bytes_to_server() -> u16 {
    500
}

fn default_bytes_to_client() -> u16 {
    3000
}

fn default_time_request_period() -> f32 {
    3.0
}

fn default_initial_bad_rtt() -> f32 {
    1.0
}

fn default_resend_factor() -> f32 {
    1.5
}

fn default_rtt_ring_size() -> usize {
    32
}

fn default_sync_dead_band() -> f32 {
    0.007
}

fn default_multicast_group() -> Ipv4Addr {
    Ipv4Addr::new(230, 201, 147, 201)
}

fn default_multicast_port() -> u16 {
    35917
}

fn default_discovery_port() -> u16 {
    3722
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:0".to_string(),
            password: String::new(),
            max_clients: 0,
            connect_timeout: default_connect_timeout(),
            send_period: default_send_period(),
            bytes_per_period_to_server: default_bytes_to_server(),
            bytes_per_period_to_client: default_bytes_to_client(),
            time_request_period: default_time_request_period(),
            initial_bad_rtt: default_initial_bad_rtt(),
            resend_factor: default_resend_factor(),
            rtt_ring_size: default_rtt_ring_size(),
            sync_dead_band: default_sync_dead_band(),
            multicast_group: default_multicast_group(),
            multicast_port: default_multicast_port(),
            multicast: None,
            discovery_port: default_discovery_port(),
            lan_interfaces: default_lan_interfaces(),
        }
    }
}

impl NetConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let cfg = NetConfig::default();
        assert_eq!(cfg.connect_timeout, 1.0);
        assert_eq!(cfg.send_period, 0.050);
        assert_eq!(cfg.bytes_per_period_to_server, 500);
        assert_eq!(cfg.bytes_per_period_to_client, 3000);
        assert_eq!(cfg.rtt_ring_size, 32);
        assert_eq!(cfg.resend_factor, 1.5);
        assert_eq!(cfg.multicast_group, Ipv4Addr::new(230, 201, 147, 201));
        assert_eq!(cfg.multicast_port, 35917);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg = NetConfig::from_json_str(r#"{"server_addr":"10.0.0.1:7777","password":"abc"}"#)
            .unwrap();
        assert_eq!(cfg.server_addr, "10.0.0.1:7777");
        assert_eq!(cfg.password, "abc");
        assert_eq!(cfg.bytes_per_period_to_client, 3000);
        assert!(cfg.multicast.is_none());
    }

    #[test]
    fn lan_interface_broadcast_and_membership() {
        let lan = LanInterface {
            ip: Ipv4Addr::new(192, 168, 1, 17),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
        };
        assert_eq!(lan.broadcast(), Ipv4Addr::new(192, 168, 1, 255));
        assert!(lan.contains(Ipv4Addr::new(192, 168, 1, 200)));
        assert!(!lan.contains(Ipv4Addr::new(192, 168, 2, 1)));
    }
}
