//! Dead-reckoning replication.
//!
//! The owning host pairs its entity with a *remote view*: a second
//! simulation of the same entity advanced with the same delta times but
//! never fed local input. The remote view mirrors what the other hosts are
//! extrapolating; when the two diverge past a threshold the owner snaps the
//! view back and transmits a full state snapshot.
//!
//! The receiving side runs the inverse: incoming snapshots become a target
//! simulation that the displayed entity is blended toward until the
//! residual interpolation weight becomes negligible.

use arena_shared::tank::{angle_difference, Tank};

use std::f32::consts::{PI, TAU};

/// Divergence limits that trigger a snapshot.
#[derive(Debug, Clone, Copy)]
pub struct ReplicationThresholds {
    /// Radians of heading difference.
    pub angle: f32,
    /// Meters of positional difference.
    pub position: f32,
}

impl Default for ReplicationThresholds {
    fn default() -> Self {
        Self {
            angle: 0.1,
            position: 0.5,
        }
    }
}

/// Owner side: local entity plus its remote view.
#[derive(Debug, Clone)]
pub struct LocalReplica {
    tank: Tank,
    remote_view: Tank,
    thresholds: ReplicationThresholds,
    pending_snapshot: bool,
}

impl LocalReplica {
    pub fn new(tank: Tank, thresholds: ReplicationThresholds) -> Self {
        Self {
            tank,
            remote_view: tank,
            thresholds,
            pending_snapshot: false,
        }
    }

    pub fn tank(&self) -> &Tank {
        &self.tank
    }

    /// Mutable access for input handling.
    pub fn tank_mut(&mut self) -> &mut Tank {
        &mut self.tank
    }

    /// Advances both simulations and checks for divergence.
    pub fn update(&mut self, dt: f32) {
        self.tank.integrate(dt);
        self.remote_view.integrate(dt);

        if !self.is_similar_to_remote_view() {
            self.remote_view = self.tank;
            self.pending_snapshot = true;
        }
    }

    fn is_similar_to_remote_view(&self) -> bool {
        if angle_difference(self.tank.angle, self.remote_view.angle).abs() > self.thresholds.angle {
            return false;
        }
        let dx = self.tank.pos_x - self.remote_view.pos_x;
        let dz = self.tank.pos_z - self.remote_view.pos_z;
        dx * dx + dz * dz <= self.thresholds.position * self.thresholds.position
    }

    /// Whether a snapshot needs to go out. Stays set until
    /// [`LocalReplica::mark_snapshot_sent`], so an append rejected by the
    /// byte budget is retried next tick.
    pub fn pending_snapshot(&self) -> bool {
        self.pending_snapshot
    }

    /// The state to transmit.
    pub fn snapshot(&self) -> &Tank {
        &self.tank
    }

    pub fn mark_snapshot_sent(&mut self) {
        self.pending_snapshot = false;
    }

    /// Forces a snapshot: called for a new remote peer and when a prior
    /// snapshot was reported lost.
    pub fn request_snapshot(&mut self) {
        self.remote_view = self.tank;
        self.pending_snapshot = true;
    }
}

/// Residual weight below which interpolation snaps to the target.
const SNAP_RESIDUAL: f32 = 0.01;

/// Receiving side: displayed entity smoothed toward snapshot targets.
#[derive(Debug, Clone)]
pub struct RemoteReplica {
    tank: Tank,
    target: Option<Tank>,
    residual: f32,
}

impl RemoteReplica {
    pub fn new(tank: Tank) -> Self {
        Self {
            tank,
            target: None,
            residual: 1.0,
        }
    }

    pub fn tank(&self) -> &Tank {
        &self.tank
    }

    pub fn id(&self) -> u16 {
        self.tank.id
    }

    /// Installs a fresh snapshot as the interpolation target.
    pub fn apply_snapshot(&mut self, snapshot: Tank) {
        self.target = Some(snapshot);
        self.residual = 1.0;
    }

    /// Advances the displayed entity; while a target is pending, both
    /// simulations run and the displayed state is pulled toward the target.
    pub fn update(&mut self, dt: f32) {
        self.tank.integrate(dt);
        let Some(mut target) = self.target.take() else {
            return;
        };
        target.integrate(dt);
        self.blend_toward(&target, dt);
        if self.residual < SNAP_RESIDUAL {
            self.tank = target;
        } else {
            self.target = Some(target);
        }
    }

    fn blend_toward(&mut self, target: &Tank, dt: f32) {
        // Braking states converge faster; a blocked tank drifting through
        // an obstacle looks worse than a visible correction.
        let factor1 = (dt * if self.tank.braking { 10.0 } else { 5.0 }).clamp(0.0, 1.0);
        let factor2 = 1.0 - factor1;

        self.tank.pos_x = factor1 * target.pos_x + factor2 * self.tank.pos_x;
        self.tank.pos_z = factor1 * target.pos_z + factor2 * self.tank.pos_z;
        self.tank.acceleration = factor1 * target.acceleration + factor2 * self.tank.acceleration;
        self.tank.angular_acceleration =
            factor1 * target.angular_acceleration + factor2 * self.tank.angular_acceleration;
        self.tank.angular_velocity =
            factor1 * target.angular_velocity + factor2 * self.tank.angular_velocity;
        self.tank.velocity = factor1 * target.velocity + factor2 * self.tank.velocity;

        // Take the shorter arc; never turn more than pi to align.
        let diff = self.tank.angle - target.angle;
        if diff > PI {
            self.tank.angle = factor1 * target.angle + factor2 * (self.tank.angle - TAU);
        } else if diff < -PI {
            self.tank.angle = factor1 * target.angle + factor2 * (self.tank.angle + TAU);
        } else {
            self.tank.angle = factor1 * target.angle + factor2 * self.tank.angle;
        }

        self.residual *= factor2;
    }
}
