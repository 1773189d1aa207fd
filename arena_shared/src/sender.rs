//! Per-peer outgoing UDP state: ack numbering, reliable resend queue, loss
//! listeners and the per-period byte budget.
//!
//! One [`UdpPeerSender`] exists per (local endpoint, remote peer) direction.
//! It owns the datagram under assembly; appending a message is atomic at
//! message granularity and fails — without partial writes — when either the
//! MTU-safe buffer or the residual period budget cannot take the message
//! plus its share of the ack header.
//!
//! A datagram carries at most one ack-request; every reliable or loss-info
//! message appended while it is under assembly shares that ack number.

use crate::clock::TimePeriod;
use crate::wire::{DatagramWriter, Wire, ACK_MESSAGE_SIZE, MIN_DATAGRAM_OVERHEAD};

/// How a message's delivery is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Fire and forget.
    Unreliable,
    /// Payload is stored and resent until the peer acknowledges it.
    Reliable,
    /// Payload is never resent; the caller is told when the ack deadline
    /// lapses without a response.
    LossInfo,
}

/// Caller-chosen handle identifying a loss-info message. Reported back
/// exactly once if no ack arrives before the deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LossToken(pub u32);

/// Reliable payload waiting for its acknowledgement.
#[derive(Debug)]
struct ReliableRecord {
    /// Formatted `tag || body` data, possibly several messages sharing one
    /// ack number.
    data: Vec<u8>,
    deadline: TimePeriod,
    /// First time this payload entered a datagram; used to abandon records
    /// that outlive the 16-bit ack window.
    born: f32,
    ack: u16,
}

/// Loss listeners attached to one ack number.
#[derive(Debug)]
struct LossRecord {
    tokens: Vec<LossToken>,
    deadline: TimePeriod,
    ack: u16,
}

/// Outgoing side of one UDP peer.
#[derive(Debug)]
pub struct UdpPeerSender {
    writer: DatagramWriter,
    reliable: Vec<ReliableRecord>,
    loss: Vec<LossRecord>,
    lost_events: Vec<LossToken>,
    next_ack: u16,
    residual_period_bytes: u16,
    max_bytes_per_period: u16,
}

impl UdpPeerSender {
    /// `max_bytes_per_period` is the raw per-period ceiling; the datagram
    /// overhead charge is deducted from the usable budget up front.
    pub fn new(max_bytes_per_period: u16, max_datagram_size: usize) -> Self {
        Self {
            writer: DatagramWriter::new(max_datagram_size),
            reliable: Vec::new(),
            loss: Vec::new(),
            lost_events: Vec::new(),
            next_ack: 0,
            residual_period_bytes: max_bytes_per_period.saturating_sub(MIN_DATAGRAM_OVERHEAD),
            max_bytes_per_period,
        }
    }

    pub fn residual_period_bytes(&self) -> u16 {
        self.residual_period_bytes
    }

    /// Appends one tagged message to the datagram under assembly.
    ///
    /// `timeout` is the ack deadline for reliable and loss-info delivery
    /// (resend factor times the peer's bad round-trip time); `token` must be
    /// given for loss-info delivery. Returns `false` when the message does
    /// not fit the MTU budget or the period budget.
    pub fn append(
        &mut self,
        tag: u8,
        msg: &dyn Wire,
        delivery: Delivery,
        token: Option<LossToken>,
        timeout: f32,
        now: f32,
    ) -> bool {
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
                // One outstanding record per ack number: messages sharing
                // the datagram's ack group are merged.
                match self.reliable.last_mut() {
                    Some(last) if last.ack == ack => last.data.extend_from_slice(&data),
                    _ => self.reliable.push(ReliableRecord {
                        data,
                        deadline: TimePeriod::new(timeout, now),
                        born: now,
                        ack,
                    }),
                }
            }
            Delivery::LossInfo => {
                let ack = self.writer.ack_request_number().unwrap();
                let token = token.expect("loss-info delivery requires a token");
                match self.loss.last_mut() {
                    Some(last) if last.ack == ack => last.tokens.push(token),
                    _ => self.loss.push(LossRecord {
                        tokens: vec![token],
                        deadline: TimePeriod::new(timeout, now),
                        ack,
                    }),
                }
            }
        }
        true
    }

    /// Appends already-formatted reliable data (multicast retry path).
    /// The bytes re-enter this sender's reliable queue under a fresh ack.
    pub fn append_stored(&mut self, data: &[u8], timeout: f32, now: f32) -> bool {
        let mut required = data.len();
        if !self.writer.has_ack_request() {
            required += ACK_MESSAGE_SIZE;
        }
        if self.writer.free() < required || (self.residual_period_bytes as usize) < required {
            return false;
        }

        if !self.writer.has_ack_request() {
            self.writer.add_ack_request(self.next_ack);
            self.next_ack = self.next_ack.wrapping_add(1);
        }
        self.writer.append_raw(data);
        self.residual_period_bytes -= required as u16;

        let ack = self.writer.ack_request_number().unwrap();
        match self.reliable.last_mut() {
            Some(last) if last.ack == ack => last.data.extend_from_slice(data),
            _ => self.reliable.push(ReliableRecord {
                data: data.to_vec(),
                deadline: TimePeriod::new(timeout, now),
                born: now,
                ack,
            }),
        }
        true
    }

    /// Re-appends reliable records whose deadline has passed, subject to the
    /// same MTU and budget checks as a fresh append. Called before each
    /// dispatch attempt.
    pub fn process_resends(&mut self, timeout: f32, now: f32) {
        let mut i = 0;
        while i < self.reliable.len() {
            if !self.reliable[i].deadline.has_expired(now) {
                i += 1;
                continue;
            }
            // Records that outlived the ack comparison window cannot be
            // matched to a response anymore.
            if now - self.reliable[i].born > 32.0 * timeout.max(f32::EPSILON) {
                self.reliable.swap_remove(i);
                continue;
            }

            let mut required = self.reliable[i].data.len();
            if !self.writer.has_ack_request() {
                required += ACK_MESSAGE_SIZE;
            }
            if self.writer.free() < required || (self.residual_period_bytes as usize) < required {
                i += 1;
                continue;
            }

            if !self.writer.has_ack_request() {
                self.writer.add_ack_request(self.next_ack);
                self.next_ack = self.next_ack.wrapping_add(1);
            }
            let record = &mut self.reliable[i];
            self.writer.append_raw(&record.data);
            self.residual_period_bytes -= required as u16;

            let ack = self.writer.ack_request_number().unwrap();
            record.ack = ack;
            record.deadline.reset_with(timeout, now);

            // Merge with a record already covering this datagram's ack.
            if let Some(j) = self
                .reliable
                .iter()
                .enumerate()
                .position(|(j, r)| j != i && r.ack == ack)
            {
                let data = self.reliable[i].data.clone();
                self.reliable[j].data.extend_from_slice(&data);
                self.reliable.swap_remove(i);
                continue;
            }
            i += 1;
        }
    }

    /// Moves expired loss records into the notification queue. Each token
    /// fires exactly once.
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

    /// Tokens whose messages timed out since the last drain.
    pub fn drain_lost(&mut self) -> Vec<LossToken> {
        std::mem::take(&mut self.lost_events)
    }

    /// Processes an ack-response from the peer: retires the matching
    /// reliable record and discards the matching loss listeners. Responses
    /// with no match are late duplicates and ignored.
    pub fn on_ack_response(&mut self, ack: u16) {
        if let Some(i) = self.reliable.iter().position(|r| r.ack == ack) {
            self.reliable.swap_remove(i);
        }
        if let Some(i) = self.loss.iter().position(|r| r.ack == ack) {
            self.loss.swap_remove(i);
        }
    }

    /// Queues an ack-response toward the peer. Returns `false` when the
    /// datagram has no more room; the caller keeps the request for the next
    /// cycle.
    pub fn add_ack_response(&mut self, ack: u16) -> bool {
        let added = self.writer.add_ack_response(ack);
        if added == 0 {
            return false;
        }
        self.residual_period_bytes = self
            .residual_period_bytes
            .saturating_sub(added as u16);
        true
    }

    /// Whether the current datagram carries a time request.
    pub fn has_time_request(&self) -> bool {
        self.writer.has_time_request()
    }

    /// Places a time request at the head of the datagram, charging the
    /// period budget. Returns `false` when it does not fit.
    pub fn add_time_request(&mut self, client_time: f32, initial: bool) -> bool {
        let added = self.writer.add_time_request(client_time, initial);
        if added == 0 {
            return false;
        }
        self.residual_period_bytes = self
            .residual_period_bytes
            .saturating_sub(added as u16);
        true
    }

    pub fn set_network_time(&mut self, time: f32) {
        self.writer.set_network_time(time);
    }

    /// The assembled datagram, or `None` when only the header exists.
    pub fn payload(&self) -> Option<&[u8]> {
        self.writer.payload()
    }

    /// Called after the datagram was handed to the socket: clears the
    /// assembly buffer and charges the per-datagram overhead.
    pub fn mark_sent(&mut self) {
        self.writer.clear();
        self.residual_period_bytes = self
            .residual_period_bytes
            .saturating_sub(MIN_DATAGRAM_OVERHEAD);
    }

    /// Resets the byte budget at the start of a send period.
    pub fn start_new_period(&mut self) {
        self.residual_period_bytes = self
            .max_bytes_per_period
            .saturating_sub(MIN_DATAGRAM_OVERHEAD);
    }

    /// Drops all delivery bookkeeping; used when the peer leaves. Loss
    /// listeners are not notified.
    pub fn clear_pending(&mut self) {
        self.reliable.clear();
        self.loss.clear();
        self.lost_events.clear();
    }

    #[cfg(test)]
    fn reliable_len(&self) -> usize {
        self.reliable.len()
    }
}
