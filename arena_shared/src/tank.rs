//! Tank entity: the replicated game object carried on top of the transport.
//!
//! The transport treats tank snapshots as opaque user payload; the schema
//! lives here because both ends of the dead-reckoning pattern (and its
//! tests) integrate the same motion equations over the same field order.

use crate::wire::{udp_tag, Wire, WireReader, WireWriter};

use std::f32::consts::{PI, TAU};

/// Message tag carrying a tank state snapshot.
pub const TANK_UPDATE_MESSAGE: u8 = udp_tag::MIN_USER;

/// Forward/backward drive acceleration, m/s².
pub const TANK_ACCELERATION: f32 = 10.0;
/// Deceleration applied toward zero while braking, m/s².
pub const TANK_BRAKE_ACCELERATION: f32 = 20.0;
/// Turning acceleration, rad/s².
pub const TANK_ANGULAR_ACCELERATION: f32 = 3.0;
/// Per-second decay factor for angular velocity with no turn input.
pub const TANK_ANGULAR_FRICTION: f32 = 0.1;
pub const TANK_MAX_VELOCITY: f32 = 15.0;
pub const TANK_MAX_ANGULAR_VELOCITY: f32 = 2.0;

const EPSILON: f32 = 1e-6;

/// Full physics state of one tank.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tank {
    pub pos_x: f32,
    pub pos_z: f32,
    pub acceleration: f32,
    pub angle: f32,
    pub angular_acceleration: f32,
    pub angular_velocity: f32,
    pub velocity: f32,
    pub id: u16,
    pub braking: bool,
}

impl Tank {
    pub fn new(id: u16) -> Self {
        Self {
            pos_x: 0.0,
            pos_z: 0.0,
            acceleration: 0.0,
            angle: 0.0,
            angular_acceleration: 0.0,
            angular_velocity: 0.0,
            velocity: 0.0,
            id,
            braking: false,
        }
    }

    pub fn at(id: u16, pos_x: f32, pos_z: f32, angle: f32) -> Self {
        Self {
            pos_x,
            pos_z,
            angle,
            ..Self::new(id)
        }
    }

    // Input edges. Stops only cancel the effect they started, so opposing
    // keys released out of order do not zero a newer command.

    pub fn start_accelerating_forwards(&mut self) {
        self.acceleration = TANK_ACCELERATION;
    }

    pub fn stop_accelerating_forwards(&mut self) {
        if self.acceleration == TANK_ACCELERATION {
            self.acceleration = 0.0;
        }
    }

    pub fn start_accelerating_backwards(&mut self) {
        self.acceleration = -TANK_ACCELERATION;
    }

    pub fn stop_accelerating_backwards(&mut self) {
        if self.acceleration == -TANK_ACCELERATION {
            self.acceleration = 0.0;
        }
    }

    pub fn start_braking(&mut self) {
        self.acceleration = TANK_BRAKE_ACCELERATION;
        self.braking = true;
    }

    pub fn stop_braking(&mut self) {
        if self.acceleration == TANK_BRAKE_ACCELERATION {
            self.acceleration = 0.0;
        }
        self.braking = false;
    }

    pub fn start_turning_left(&mut self) {
        self.angular_acceleration = -TANK_ANGULAR_ACCELERATION;
    }

    pub fn stop_turning_left(&mut self) {
        if self.angular_acceleration == -TANK_ANGULAR_ACCELERATION {
            self.angular_acceleration = 0.0;
        }
    }

    pub fn start_turning_right(&mut self) {
        self.angular_acceleration = TANK_ANGULAR_ACCELERATION;
    }

    pub fn stop_turning_right(&mut self) {
        if self.angular_acceleration == TANK_ANGULAR_ACCELERATION {
            self.angular_acceleration = 0.0;
        }
    }

    /// Advances the simulation by `dt` seconds.
    pub fn integrate(&mut self, dt: f32) {
        // Heading: angle 0 faces +Z, growing clockwise.
        self.pos_x += self.angle.sin() * self.velocity * dt;
        self.pos_z += self.angle.cos() * self.velocity * dt;
        self.angle = normalize_angle(self.angle + self.angular_velocity * dt);

        if self.braking {
            // Braking reduces |velocity| toward zero and never flips it.
            let change = dt * self.acceleration;
            if change > self.velocity.abs() {
                self.velocity = 0.0;
            } else if self.velocity > 0.0 {
                self.velocity -= change;
            } else {
                self.velocity += change;
            }
        } else {
            self.velocity += dt * self.acceleration;
        }

        if self.angular_acceleration.abs() < EPSILON {
            self.angular_velocity *= dt * TANK_ANGULAR_FRICTION;
        } else {
            self.angular_velocity += dt * self.angular_acceleration;
        }

        self.angular_velocity = self
            .angular_velocity
            .clamp(-TANK_MAX_ANGULAR_VELOCITY, TANK_MAX_ANGULAR_VELOCITY);
        self.velocity = self.velocity.clamp(-TANK_MAX_VELOCITY, TANK_MAX_VELOCITY);
    }
}

impl Wire for Tank {
    fn wire_size(&self) -> usize {
        7 * 4 + 2 + 1
    }

    fn encode(&self, w: &mut WireWriter) {
        w.write_f32(self.pos_x);
        w.write_f32(self.pos_z);
        w.write_f32(self.acceleration);
        w.write_f32(self.angle);
        w.write_f32(self.angular_acceleration);
        w.write_f32(self.angular_velocity);
        w.write_f32(self.velocity);
        w.write_u16(self.id);
        w.write_u8(self.braking as u8);
    }

    fn decode(r: &mut WireReader<'_>) -> Option<Self> {
        Some(Self {
            pos_x: r.read_f32()?,
            pos_z: r.read_f32()?,
            acceleration: r.read_f32()?,
            angle: r.read_f32()?,
            angular_acceleration: r.read_f32()?,
            angular_velocity: r.read_f32()?,
            velocity: r.read_f32()?,
            id: r.read_u16()?,
            braking: r.read_bool()?,
        })
    }
}

/// Wraps an angle into `[0, 2π)`.
pub fn normalize_angle(angle: f32) -> f32 {
    angle.rem_euclid(TAU)
}

/// Difference `a - b` along the shorter arc, in `(-π, π]`.
pub fn angle_difference(a: f32, b: f32) -> f32 {
    let mut diff = (a - b).rem_euclid(TAU);
    if diff > PI {
        diff -= TAU;
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip_preserves_state() {
        let mut tank = Tank::at(3, 1.5, -2.0, 0.7);
        tank.velocity = 4.0;
        tank.braking = true;

        // Readers consume a leading tag byte before the body.
        let mut w = WireWriter::new(64);
        w.write_u8(42);
        tank.encode(&mut w);
        assert_eq!(w.len(), 1 + tank.wire_size());

        let mut r = WireReader::new(w.as_slice());
        let decoded = Tank::decode(&mut r).unwrap();
        assert_eq!(decoded, tank);
    }

    #[test]
    fn drives_forward_from_rest() {
        let mut tank = Tank::new(1);
        tank.start_accelerating_forwards();
        let dt = 0.01;
        for _ in 0..100 {
            tank.integrate(dt);
        }
        // ~0.5 * a * t^2 along +Z, with one-step integration lag.
        assert!(tank.pos_z > 4.0 && tank.pos_z < 6.0, "pos_z = {}", tank.pos_z);
        assert!((tank.velocity - 10.0).abs() < 0.2);
        assert_eq!(tank.pos_x, 0.0);
    }

    #[test]
    fn braking_stops_without_reversing() {
        let mut tank = Tank::new(1);
        tank.velocity = 5.0;
        tank.start_braking();
        for _ in 0..100 {
            tank.integrate(0.01);
        }
        assert_eq!(tank.velocity, 0.0);

        let mut reversing = Tank::new(1);
        reversing.velocity = -5.0;
        reversing.start_braking();
        for _ in 0..100 {
            reversing.integrate(0.01);
        }
        assert_eq!(reversing.velocity, 0.0);
    }

    #[test]
    fn velocity_is_clamped() {
        let mut tank = Tank::new(1);
        tank.start_accelerating_forwards();
        for _ in 0..1000 {
            tank.integrate(0.01);
        }
        assert_eq!(tank.velocity, TANK_MAX_VELOCITY);
    }

    #[test]
    fn stop_only_cancels_matching_input() {
        let mut tank = Tank::new(1);
        tank.start_accelerating_forwards();
        tank.start_accelerating_backwards();
        tank.stop_accelerating_forwards();
        assert_eq!(tank.acceleration, -TANK_ACCELERATION);
    }

    #[test]
    fn angle_wraps_and_shorter_arc_is_signed() {
        assert!((normalize_angle(TAU + 0.5) - 0.5).abs() < 1e-6);
        assert!((angle_difference(0.1, TAU - 0.1) - 0.2).abs() < 1e-5);
        assert!((angle_difference(TAU - 0.1, 0.1) + 0.2).abs() < 1e-5);
    }
}
