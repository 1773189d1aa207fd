//! `arena_client`
//!
//! Client-side systems:
//! - Connection state machine (TCP control plane + session negotiation)
//! - Client UDP socket with reliable/loss-info delivery toward the server
//! - LAN server discovery
//! - Dead-reckoning replication (local entity, remote view, smoother)

pub mod client;
pub mod discovery;
pub mod replicate;
pub mod udp;

pub use client::{Client, ClientEvent, ClientStateKind, ConnectFailure, DisconnectReason};
