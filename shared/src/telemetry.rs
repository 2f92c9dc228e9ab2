//! Car telemetry value types.
//!
//! [`PositionUpdateIn`] is what a client sends every physics step over the
//! datagram channel. The server folds it into a [`CarStatus`], the live record
//! kept per car, and fans it back out as [`PositionUpdateOut`] entries. Both
//! wire structs are fixed-layout and go through the bincode path of the codec.

use serde::{Deserialize, Serialize};

/// Falling faster than this (m/s, negative is down) counts as off the map.
pub const FALLING_VELOCITY_THRESHOLD: f32 = -75.0;

/// Absolute coordinate bound for a believable position, in metres.
pub const MAX_COORDINATE: f32 = 100_000.0;

/// Plain 3D vector in world space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector3 {
    pub const ZERO: Vector3 = Vector3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    pub fn length_squared(&self) -> f32 {
        self.x * self.x + self.y * self.y + self.z * self.z
    }

    pub fn distance_squared(&self, other: &Vector3) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }

    pub fn scaled_add(&self, direction: &Vector3, factor: f32) -> Vector3 {
        Vector3 {
            x: self.x + direction.x * factor,
            y: self.y + direction.y * factor,
            z: self.z + direction.z * factor,
        }
    }
}

/// Telemetry datagram sent by a client for its own car.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdateIn {
    pub pak_sequence_id: u8,
    pub timestamp: u32,
    pub position: Vector3,
    pub rotation: Vector3,
    pub velocity: Vector3,
    pub tyre_angular_speed: [u8; 4],
    pub steer_angle: u8,
    pub wheel_angle: u8,
    pub engine_rpm: u16,
    pub gear: u8,
    pub status_flag: u32,
    pub performance_delta: i16,
    pub gas: u8,
    pub normalized_position: f32,
}

impl PositionUpdateIn {
    /// Whether the values describe a physically possible car.
    ///
    /// Non-finite floats or coordinates outside the world bound mean a broken
    /// or tampered client; the connection owning the car is dropped.
    pub fn is_valid(&self) -> bool {
        let in_bounds = |v: &Vector3| {
            v.x.abs() < MAX_COORDINATE && v.y.abs() < MAX_COORDINATE && v.z.abs() < MAX_COORDINATE
        };

        self.position.is_finite()
            && self.rotation.is_finite()
            && self.velocity.is_finite()
            && self.normalized_position.is_finite()
            && in_bounds(&self.position)
            && in_bounds(&self.velocity)
    }
}

/// Live state of one car, owned by its slot.
#[derive(Debug, Clone, PartialEq)]
pub struct CarStatus {
    /// Server clock time of the last accepted update, in milliseconds.
    pub timestamp: i64,
    pub pak_sequence_id: u8,
    pub position: Vector3,
    pub rotation: Vector3,
    pub velocity: Vector3,
    pub tyre_angular_speed: [u8; 4],
    pub steer_angle: u8,
    pub wheel_angle: u8,
    pub engine_rpm: u16,
    pub gear: u8,
    pub status_flag: u32,
    pub performance_delta: i16,
    pub gas: u8,
    pub normalized_position: f32,
    pub damage_zone_level: [f32; 5],
    pub current_tyre_compound: String,
}

impl Default for CarStatus {
    fn default() -> Self {
        Self {
            timestamp: 0,
            pak_sequence_id: 0,
            position: Vector3::ZERO,
            rotation: Vector3::ZERO,
            velocity: Vector3::ZERO,
            tyre_angular_speed: [0; 4],
            steer_angle: 127,
            wheel_angle: 127,
            engine_rpm: 0,
            gear: 0,
            status_flag: 0,
            performance_delta: 0,
            gas: 0,
            normalized_position: 0.0,
            damage_zone_level: [0.0; 5],
            current_tyre_compound: String::new(),
        }
    }
}

impl CarStatus {
    /// Copies a client update in wholesale, stamping it with server time.
    pub fn apply(&mut self, update: &PositionUpdateIn, now_ms: i64) {
        self.timestamp = now_ms;
        self.pak_sequence_id = update.pak_sequence_id;
        self.position = update.position;
        self.rotation = update.rotation;
        self.velocity = update.velocity;
        self.tyre_angular_speed = update.tyre_angular_speed;
        self.steer_angle = update.steer_angle;
        self.wheel_angle = update.wheel_angle;
        self.engine_rpm = update.engine_rpm;
        self.gear = update.gear;
        self.status_flag = update.status_flag;
        self.performance_delta = update.performance_delta;
        self.gas = update.gas;
        self.normalized_position = update.normalized_position;
    }

    pub fn is_falling(&self) -> bool {
        self.velocity.y < FALLING_VELOCITY_THRESHOLD
    }
}

/// One car's state as seen by one recipient.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdateOut {
    pub session_id: u8,
    pub pak_sequence_id: u8,
    pub timestamp: u32,
    pub ping: u16,
    pub position: Vector3,
    pub rotation: Vector3,
    pub velocity: Vector3,
    pub tyre_angular_speed: [u8; 4],
    pub steer_angle: u8,
    pub wheel_angle: u8,
    pub engine_rpm: u16,
    pub gear: u8,
    pub status_flag: u32,
    pub performance_delta: i16,
    pub gas: u8,
}

impl PositionUpdateOut {
    /// Builds the entry for `status`, shifting its timestamp into the
    /// recipient's clock by subtracting the recipient's measured offset.
    pub fn from_status(session_id: u8, ping: u16, recipient_offset: i64, status: &CarStatus) -> Self {
        Self {
            session_id,
            pak_sequence_id: status.pak_sequence_id,
            timestamp: (status.timestamp - recipient_offset) as u32,
            ping,
            position: status.position,
            rotation: status.rotation,
            velocity: status.velocity,
            tyre_angular_speed: status.tyre_angular_speed,
            steer_angle: status.steer_angle,
            wheel_angle: status.wheel_angle,
            engine_rpm: status.engine_rpm,
            gear: status.gear,
            status_flag: status.status_flag,
            performance_delta: status.performance_delta,
            gas: status.gas,
        }
    }
}
