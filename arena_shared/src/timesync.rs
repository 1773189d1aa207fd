//! Clock synchronization.
//!
//! The client keeps an anchor pair `(system_at_sync, network_at_sync)` so
//! that `network_now = system_now - system_at_sync + network_at_sync`, and
//! refines it from time-response round trips. Both sides maintain rings of
//! recent round-trip samples whose 80th percentile — the *bad* round-trip
//! time — sizes every resend and loss-notification deadline.

use tracing::debug;

use crate::clock::TimePeriod;
use crate::config::NetConfig;
use crate::session::Member;
use crate::wire::SERVER_ID;

/// Rank of the sample treated as the bad round-trip time in a sorted ring.
fn worst_rank(ring_size: usize) -> usize {
    (((ring_size as f32) * 0.8) as usize + 1).min(ring_size - 1)
}

/// Last rank still considered good enough to drive a clock correction.
fn best_rank(ring_size: usize) -> usize {
    ((ring_size as f32) * 0.2) as usize
}

/// Client-side network-time estimator.
pub struct ClientClock {
    request_period: TimePeriod,
    rtts_ms: Vec<u32>,
    next_slot: usize,
    system_at_sync: f32,
    network_at_sync: f32,
    bad_rtt: f32,
    initial_bad_rtt: f32,
    sync_dead_band: f32,
    /// Highest network time handed out; re-syncs may pull the anchor back
    /// slightly, and the shared clock must never run backwards.
    watermark: f32,
    initial_request: bool,
    ready: bool,
}

impl ClientClock {
    pub fn new(cfg: &NetConfig, system_now: f32) -> Self {
        Self {
            request_period: TimePeriod::new(cfg.time_request_period, system_now),
            rtts_ms: vec![0; cfg.rtt_ring_size],
            next_slot: 0,
            system_at_sync: system_now,
            network_at_sync: 0.0,
            bad_rtt: cfg.initial_bad_rtt,
            initial_bad_rtt: cfg.initial_bad_rtt,
            sync_dead_band: cfg.sync_dead_band,
            watermark: 0.0,
            initial_request: true,
            ready: false,
        }
    }

    /// Current network time estimate. Monotone non-decreasing.
    pub fn network_time(&mut self, system_now: f32) -> f32 {
        let estimate = system_now - self.system_at_sync + self.network_at_sync;
        if estimate > self.watermark {
            self.watermark = estimate;
        }
        self.watermark
    }

    /// Round-trip time of a slow packet, in seconds.
    pub fn bad_rtt(&self) -> f32 {
        if self.ready {
            self.bad_rtt
        } else {
            self.initial_bad_rtt
        }
    }

    /// Whether the next outgoing datagram should carry a time request.
    /// Until the sample ring has filled once, every datagram does.
    pub fn needs_request(&self, system_now: f32) -> bool {
        if !self.ready {
            return true;
        }
        self.request_period.has_expired(system_now)
    }

    /// Whether the next request uses the initial-request tag.
    pub fn is_initial_request(&self) -> bool {
        self.initial_request
    }

    /// Called after a time request was placed into a datagram.
    pub fn mark_requested(&mut self, system_now: f32) {
        self.request_period.reset(system_now);
    }

    /// Processes a `(client_request_time, server_time)` response.
    pub fn on_time_response(
        &mut self,
        client_request_time: f32,
        server_time: f32,
        system_now: f32,
    ) {
        let receipt = self.network_time(system_now);
        let rtt_ms = (0.5 + 1000.0 * (receipt - client_request_time)).max(0.0) as u32;
        if rtt_ms as f32 >= 1000.0 * self.request_period.length() {
            // Delayed far beyond the request cadence, useless for sync.
            return;
        }
        self.rtts_ms[self.next_slot] = rtt_ms;
        self.next_slot += 1;

        if self.initial_request {
            self.synchronize(server_time, receipt, client_request_time, system_now);
            self.initial_request = false;
        }

        if self.next_slot == self.rtts_ms.len() {
            self.next_slot = 0;
            self.ready = true;
        }
        if !self.ready {
            return;
        }

        let mut ordered = self.rtts_ms.clone();
        ordered.sort_unstable();
        self.bad_rtt = 0.001 * ordered[worst_rank(ordered.len())] as f32;

        // Only fast responses carry time data accurate enough to correct
        // the clock; anything slower would just add jitter.
        if ordered[best_rank(ordered.len())] < rtt_ms {
            return;
        }
        self.synchronize(server_time, receipt, client_request_time, system_now);
    }

    fn synchronize(&mut self, server_time: f32, receipt: f32, request: f32, system_now: f32) {
        let desired = server_time + (receipt - request) * 0.5;
        let deviation = (desired - receipt).abs();
        if deviation > self.sync_dead_band {
            debug!(deviation, desired, "synchronizing network clock");
            self.network_at_sync = desired;
            self.system_at_sync = system_now;
        }
    }
}

/// Ring of round-trip samples for one session client.
struct PeerRttTracker {
    id: u16,
    rtts: Vec<f32>,
    next_slot: usize,
    bad_rtt: f32,
    ready: bool,
}

impl PeerRttTracker {
    fn new(id: u16, ring_size: usize, initial_bad_rtt: f32) -> Self {
        Self {
            id,
            rtts: vec![0.0; ring_size],
            next_slot: 0,
            bad_rtt: initial_bad_rtt,
            ready: false,
        }
    }

    fn add_sample(&mut self, rtt: f32) {
        self.rtts[self.next_slot] = rtt;
        self.next_slot += 1;
        if self.next_slot == self.rtts.len() {
            self.next_slot = 0;
            self.ready = true;
        }
        let mut ordered = self.rtts.clone();
        ordered.sort_unstable_by(f32::total_cmp);
        self.bad_rtt = ordered[worst_rank(ordered.len())];
    }
}

/// Server-side per-client round-trip bookkeeping.
pub struct ServerTimeSync {
    trackers: Vec<PeerRttTracker>,
    ring_size: usize,
    initial_bad_rtt: f32,
}

impl ServerTimeSync {
    pub fn new(cfg: &NetConfig) -> Self {
        Self {
            trackers: Vec::new(),
            ring_size: cfg.rtt_ring_size,
            initial_bad_rtt: cfg.initial_bad_rtt,
        }
    }

    pub fn on_member_added(&mut self, member: &Member) {
        if member.id == SERVER_ID {
            return;
        }
        self.trackers
            .push(PeerRttTracker::new(member.id, self.ring_size, self.initial_bad_rtt));
    }

    pub fn on_member_removed(&mut self, id: u16) {
        self.trackers.retain(|t| t.id != id);
    }

    /// Feeds one sample for a client; unknown ids are dropped.
    pub fn add_sample(&mut self, id: u16, rtt: f32) {
        if let Some(tracker) = self.trackers.iter_mut().find(|t| t.id == id) {
            tracker.add_sample(rtt);
        }
    }

    /// Bad round-trip time for one client.
    pub fn bad_rtt(&self, id: u16) -> f32 {
        match self.trackers.iter().find(|t| t.id == id) {
            Some(t) if t.ready => t.bad_rtt,
            _ => self.initial_bad_rtt,
        }
    }

    /// Arithmetic mean of the per-client bad round-trip times; drives the
    /// multicast sender's deadlines.
    pub fn mean_bad_rtt(&self) -> f32 {
        if self.trackers.is_empty() {
            return self.initial_bad_rtt;
        }
        let sum: f32 = self.trackers.iter().map(|t| self.bad_rtt(t.id)).sum();
        sum / self.trackers.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> NetConfig {
        NetConfig::default()
    }

    fn member(id: u16) -> Member {
        Member {
            ip: 0x7F00_0001,
            udp_port: 40_000 + id,
            id,
            multicast: false,
        }
    }

    #[test]
    fn ranks_match_ring_of_32() {
        assert_eq!(worst_rank(32), 26);
        assert_eq!(best_rank(32), 6);
    }

    #[test]
    fn network_time_is_monotone_across_backward_sync() {
        let mut clock = ClientClock::new(&cfg(), 0.0);
        let t0 = clock.network_time(5.0);
        assert!((t0 - 5.0).abs() < 1e-3);
        // The server clock turns out to be behind: the correction pulls the
        // anchor back, but reported time must not run backwards.
        clock.on_time_response(4.9, 1.0, 5.0);
        let t1 = clock.network_time(5.1);
        assert!(t1 >= t0);
    }

    #[test]
    fn initial_response_synchronizes_clock() {
        let mut clock = ClientClock::new(&cfg(), 10.0);
        assert!(clock.is_initial_request());
        // Request went out at network time ~0, server clock reads 500.
        clock.on_time_response(0.0, 500.0, 10.1);
        assert!(!clock.is_initial_request());
        let now = clock.network_time(10.1);
        assert!((now - 500.05).abs() < 0.1, "got {now}");
    }

    #[test]
    fn stale_response_is_discarded() {
        let mut clock = ClientClock::new(&cfg(), 0.0);
        clock.on_time_response(0.0, 77.0, 0.05);
        let anchored = clock.network_time(0.05);
        // A response whose round trip exceeds the request period must not
        // touch the ring or the anchors.
        clock.on_time_response(-10.0, 400.0, 0.1);
        let after = clock.network_time(0.1);
        assert!((after - (anchored + 0.05)).abs() < 0.01);
    }

    #[test]
    fn bad_rtt_defaults_until_ring_fills() {
        let mut clock = ClientClock::new(&cfg(), 0.0);
        assert_eq!(clock.bad_rtt(), 1.0);
        let mut now = 0.0;
        for _ in 0..32 {
            now += 0.1;
            // Every response observes a 100 ms round trip.
            let request = clock.network_time(now) - 0.1;
            clock.on_time_response(request, now, now);
        }
        assert!((clock.bad_rtt() - 0.1).abs() < 0.01);
    }

    #[test]
    fn requests_ride_every_datagram_until_ready() {
        let clock = ClientClock::new(&cfg(), 0.0);
        assert!(clock.needs_request(0.0));
        assert!(clock.needs_request(0.001));
    }

    #[test]
    fn server_tracker_percentile_and_mean() {
        let mut sync = ServerTimeSync::new(&cfg());
        sync.on_member_added(&member(0)); // server itself, ignored
        sync.on_member_added(&member(1));
        sync.on_member_added(&member(2));

        assert_eq!(sync.bad_rtt(1), 1.0);

        // Fill client 1's ring: samples 0.001..=0.032.
        for i in 1..=32 {
            sync.add_sample(1, i as f32 * 0.001);
        }
        // 80th percentile rank 26 of the sorted ring.
        assert!((sync.bad_rtt(1) - 0.027).abs() < 1e-4);

        // Client 2 never filled its ring, so the mean uses its default.
        let mean = sync.mean_bad_rtt();
        assert!((mean - (0.027 + 1.0) / 2.0).abs() < 1e-4);

        sync.on_member_removed(1);
        assert_eq!(sync.bad_rtt(1), 1.0);
    }
}
