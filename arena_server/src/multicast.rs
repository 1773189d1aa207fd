//! Multicast fan-out: one datagram, many session clients.
//!
//! The multicast sender mirrors a peer sender, but its reliable and
//! loss-info records track the set of receivers that still owe an
//! acknowledgement. When a reliable record's deadline lapses, the payload
//! is re-appended to each still-pending receiver's *unicast* sender — the
//! group datagram is never repeated, so delivery semantics are preserved
//! without punishing receivers that already answered.

use std::net::{SocketAddr, SocketAddrV4};

use anyhow::Context;
use tokio::net::UdpSocket;
use tracing::trace;

use arena_shared::clock::TimePeriod;
use arena_shared::config::NetConfig;
use arena_shared::sender::{Delivery, LossToken};
use arena_shared::wire::{DatagramWriter, Wire, ACK_MESSAGE_SIZE, MAX_DATAGRAM_SIZE, MIN_DATAGRAM_OVERHEAD};

/// Reliable payload with the receivers that have not acked it yet.
#[derive(Debug)]
struct ReliableFanout {
    data: Vec<u8>,
    pending: Vec<u16>,
    deadline: TimePeriod,
    ack: u16,
}

/// Loss listeners with the receivers that have not acked yet.
#[derive(Debug)]
struct LossFanout {
    tokens: Vec<LossToken>,
    pending: Vec<u16>,
    deadline: TimePeriod,
    ack: u16,
}

/// Group sender for every multicast-capable session client.
pub struct MulticastSender {
    writer: DatagramWriter,
    reliable: Vec<ReliableFanout>,
    loss: Vec<LossFanout>,
    lost_events: Vec<LossToken>,
    receivers: Vec<u16>,
    group: SocketAddrV4,
    next_ack: u16,
    residual_period_bytes: u16,
    max_bytes_per_period: u16,
}

impl MulticastSender {
    pub fn new(cfg: &NetConfig) -> Self {
        Self {
            writer: DatagramWriter::new(MAX_DATAGRAM_SIZE),
            reliable: Vec::new(),
            loss: Vec::new(),
            lost_events: Vec::new(),
            receivers: Vec::new(),
            group: SocketAddrV4::new(cfg.multicast_group, cfg.multicast_port),
            next_ack: 0,
            residual_period_bytes: cfg
                .bytes_per_period_to_client
                .saturating_sub(MIN_DATAGRAM_OVERHEAD),
            max_bytes_per_period: cfg.bytes_per_period_to_client,
        }
    }

    pub fn add_receiver(&mut self, id: u16) {
        self.receivers.push(id);
    }

    /// Removes a leaving receiver from the group and from every pending
    /// set. Records whose set empties are retired silently; loss listeners
    /// fire on timeout only, never on peer removal.
    pub fn remove_receiver(&mut self, id: u16) {
        self.receivers.retain(|&r| r != id);
        for record in &mut self.reliable {
            record.pending.retain(|&r| r != id);
        }
        self.reliable.retain(|r| !r.pending.is_empty());
        for record in &mut self.loss {
            record.pending.retain(|&r| r != id);
        }
        self.loss.retain(|r| !r.pending.is_empty());
    }

    pub fn has_receivers(&self) -> bool {
        !self.receivers.is_empty()
    }

    /// Appends one tagged message to the group datagram. With no receivers
    /// the message is trivially delivered. The MTU and period budget are
    /// charged once, not per receiver.
    pub fn append(
        &mut self,
        tag: u8,
        msg: &dyn Wire,
        delivery: Delivery,
        token: Option<LossToken>,
        timeout: f32,
        now: f32,
    ) -> bool {
        if self.receivers.is_empty() {
            return true;
        }
        let mut required = 1 + msg.wire_size();
        if delivery != Delivery::Unreliable && !self.writer.has_ack_request() {
            required += ACK_MESSAGE_SIZE;
        }
        if self.writer.free() < required || (self.residual_period_bytes as usize) < required {
            return false;
        }

        if delivery != Delivery::Unreliable && !self.writer.has_ack_request() {
            self.writer.add_ack_request(self.next_ack);
            self.next_ack = self.next_ack.wrapping_add(1);
        }
        let (start, end) = self.writer.append_message(tag, msg);
        self.residual_period_bytes -= required as u16;

        match delivery {
            Delivery::Unreliable => {}
            Delivery::Reliable => {
                let ack = self.writer.ack_request_number().unwrap();
                let data = self.writer.slice(start, end).to_vec();
                match self.reliable.last_mut() {
                    Some(last) if last.ack == ack => last.data.extend_from_slice(&data),
                    _ => self.reliable.push(ReliableFanout {
                        data,
                        pending: self.receivers.clone(),
                        deadline: TimePeriod::new(timeout, now),
                        ack,
                    }),
                }
            }
            Delivery::LossInfo => {
                let ack = self.writer.ack_request_number().unwrap();
                let token = token.expect("loss-info delivery requires a token");
                match self.loss.last_mut() {
                    Some(last) if last.ack == ack => last.tokens.push(token),
                    _ => self.loss.push(LossFanout {
                        tokens: vec![token],
                        pending: self.receivers.clone(),
                        deadline: TimePeriod::new(timeout, now),
                        ack,
                    }),
                }
            }
        }
        true
    }

    /// Handles an ack-response from receiver `id`: removes it from the
    /// pending set; a record whose set empties is done.
    pub fn process_ack_response(&mut self, id: u16, ack: u16) {
        if let Some(i) = self.reliable.iter().position(|r| r.ack == ack) {
            self.reliable[i].pending.retain(|&r| r != id);
            if self.reliable[i].pending.is_empty() {
                self.reliable.swap_remove(i);
            }
        }
        if let Some(i) = self.loss.iter().position(|r| r.ack == ack) {
            self.loss[i].pending.retain(|&r| r != id);
            if self.loss[i].pending.is_empty() {
                self.loss.swap_remove(i);
            }
        }
    }

    /// Re-routes expired reliable records to the still-pending receivers'
    /// unicast senders. `resend` appends the formatted payload to one
    /// receiver and reports whether it fit; receivers it fails for are
    /// retried next cycle.
    pub fn process_resends(&mut self, now: f32, mut resend: impl FnMut(u16, &[u8]) -> bool) {
        let mut i = 0;
        while i < self.reliable.len() {
            if !self.reliable[i].deadline.has_expired(now) {
                i += 1;
                continue;
            }
            let record = &mut self.reliable[i];
            let mut failed = Vec::new();
            for &id in &record.pending {
                if !resend(id, &record.data) {
                    failed.push(id);
                }
            }
            if failed.is_empty() {
                trace!(ack = record.ack, "reliable fan-out handed to unicast senders");
                self.reliable.swap_remove(i);
                continue;
            }
            record.pending = failed;
            i += 1;
        }
    }

    /// Fires loss listeners whose deadline lapsed with responses missing.
    pub fn collect_losses(&mut self, now: f32) {
        let mut i = 0;
        while i < self.loss.len() {
            if !self.loss[i].deadline.has_expired(now) {
                i += 1;
                continue;
            }
            let record = self.loss.swap_remove(i);
            self.lost_events.extend(record.tokens);
        }
    }

    pub fn drain_lost(&mut self) -> Vec<LossToken> {
        std::mem::take(&mut self.lost_events)
    }

    pub fn set_network_time(&mut self, time: f32) {
        self.writer.set_network_time(time);
    }

    /// Dispatches the group datagram. `would_block` leaves it armed.
    pub fn try_send(&mut self, socket: &UdpSocket) -> anyhow::Result<()> {
        if self.receivers.is_empty() {
            return Ok(());
        }
        let Some(payload) = self.writer.payload() else {
            return Ok(());
        };
        match socket.try_send_to(payload, SocketAddr::V4(self.group)) {
            Ok(_) => {
                self.writer.clear();
                self.residual_period_bytes = self
                    .residual_period_bytes
                    .saturating_sub(MIN_DATAGRAM_OVERHEAD);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e).context("multicast send")?,
        }
        Ok(())
    }

    pub fn start_new_period(&mut self) {
        self.residual_period_bytes = self
            .max_bytes_per_period
            .saturating_sub(MIN_DATAGRAM_OVERHEAD);
    }
}
