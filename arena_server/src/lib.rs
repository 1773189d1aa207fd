//! `arena_server`
//!
//! Server-side systems:
//! - Session management over TCP (accept, negotiate, roster distribution)
//! - Per-client UDP senders with reliable/loss-info delivery
//! - Explicit multicast fan-out with unicast fallback
//! - LAN advertisement

pub mod discovery;
pub mod multicast;
pub mod server;
pub mod udp;

pub use server::{Server, ServerEvent};
