//! Complementary-filter fusion over the handset's own sensors.
//!
//! Accelerometer + magnetometer give an absolute but noisy orientation;
//! the gyroscope gives a smooth but drifting one. Gyro readings are
//! integrated into a running rotation matrix, and a fixed-weight blend with
//! the acc/mag orientation rewrites that matrix every update to bound drift.
//! The orientation reported to callers is the raw gyro-derived one, not the
//! blended value; the blend only corrects the internal matrix. Changing that
//! changes observable head-tracking behavior, so it stays as-is.

use std::f32::consts::PI;
use std::time::Duration;

use glam::{Mat3, Quat, Vec3};
use log::info;

use super::{OrientationSource, SOURCE_TIMEOUT};

const FILTER_COEFFICIENT: f32 = 0.98;
const EPSILON: f32 = 1e-9;
const NS2S: f32 = 1.0 / 1_000_000_000.0;
/// Empirical yaw offset applied before exposing the final orientation.
const YAW_OFFSET: f32 = 1.566;

/// One reading pushed by the OS sensor service.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorEvent {
    Accelerometer(Vec3),
    Magnetometer(Vec3),
    /// Angular velocity in rad/s plus the event timestamp in nanoseconds.
    Gyroscope(Vec3, i64),
}

/// Source of platform sensor events.
///
/// `next_batch` blocks up to `timeout` for pending events and returns them
/// all (drain semantics); an empty vec means nothing arrived in time.
pub trait SensorEventStream: Send {
    fn next_batch(&mut self, timeout: Duration) -> Vec<SensorEvent>;
}

/// Fusion engine over the platform sensor streams.
pub struct PlatformFusion {
    stream: Box<dyn SensorEventStream>,

    gravity: Vec3,
    geomagnetic: Vec3,
    acc_mag_orientation: [f32; 3],
    acc_mag_ready: bool,

    init_state: bool,
    gyro_matrix: Mat3,
    gyro_orientation: [f32; 3],
    fused_orientation: [f32; 3],
    final_orientation: [f32; 3],
    first_yaw: f32,
    last_timestamp: i64,

    previous_yaw: f32,
    current_yaw: f32,
}

impl PlatformFusion {
    pub fn new(stream: Box<dyn SensorEventStream>) -> Self {
        Self {
            stream,
            gravity: Vec3::ZERO,
            geomagnetic: Vec3::ZERO,
            acc_mag_orientation: [0.0; 3],
            acc_mag_ready: false,
            init_state: true,
            gyro_matrix: Mat3::IDENTITY,
            gyro_orientation: [0.0; 3],
            fused_orientation: [0.0; 3],
            final_orientation: [0.0; 3],
            first_yaw: 0.0,
            last_timestamp: 0,
            previous_yaw: 0.0,
            current_yaw: 0.0,
        }
    }

    /// Whether the absolute acc/mag baseline has been acquired yet. Gyro
    /// integration does not start before this.
    pub fn is_tracking(&self) -> bool {
        self.acc_mag_ready && !self.init_state
    }

    /// Low-pass-smoothed yaw, exposed for host UI scrolling.
    pub fn current_yaw(&self) -> f32 {
        self.current_yaw
    }

    pub fn handle_event(&mut self, event: SensorEvent) {
        match event {
            SensorEvent::Accelerometer(v) => {
                self.gravity = v;
                self.calculate_acc_mag_orientation();
            }
            SensorEvent::Magnetometer(v) => {
                self.geomagnetic = v;
            }
            SensorEvent::Gyroscope(v, timestamp) => {
                self.handle_gyro(v, timestamp);
            }
        }
    }

    pub fn orientation(&self) -> Quat {
        quaternion_from_orientation(self.final_orientation)
    }

    fn calculate_acc_mag_orientation(&mut self) {
        if let Some(m) = rotation_matrix_from_gravity_mag(self.gravity, self.geomagnetic) {
            self.acc_mag_orientation = orientation_from_matrix(&m);
            self.acc_mag_ready = true;
        }
    }

    fn handle_gyro(&mut self, gyro: Vec3, timestamp: i64) {
        // No absolute baseline yet; integrating now would track from an
        // arbitrary origin.
        if !self.acc_mag_ready {
            return;
        }

        if self.init_state {
            let init = matrix_from_orientation(self.acc_mag_orientation);
            self.gyro_matrix *= init;
            self.first_yaw = self.acc_mag_orientation[0];
            self.init_state = false;
            info!("platform fusion: acc/mag baseline acquired, tracking");
        }

        if self.last_timestamp != 0 {
            let dt = (timestamp - self.last_timestamp) as f32 * NS2S;
            let delta = delta_rotation(gyro, dt / 2.0);
            self.blend_and_correct();
            self.gyro_matrix *= Mat3::from_quat(delta);
            self.gyro_orientation = orientation_from_matrix(&self.gyro_matrix);
        }
        self.last_timestamp = timestamp;
    }

    /// Complementary filter step. The blended orientation rewrites the gyro
    /// matrix to cancel drift, then is overwritten by the raw gyro
    /// orientation: only the gyro signal is ever reported outward.
    fn blend_and_correct(&mut self) {
        for axis in 0..3 {
            self.fused_orientation[axis] =
                blend_axis(self.gyro_orientation[axis], self.acc_mag_orientation[axis]);
        }
        self.gyro_matrix = matrix_from_orientation(self.fused_orientation);
        self.fused_orientation = self.gyro_orientation;
        self.update_final(self.gyro_orientation);
    }

    fn update_final(&mut self, o: [f32; 3]) {
        let ret = [YAW_OFFSET + o[2], -(o[0] - self.first_yaw), o[1]];
        self.final_orientation = [-ret[0], ret[1], ret[2]];

        let dy = ret[1] - self.previous_yaw;
        self.current_yaw = self.previous_yaw + dy * 0.7;
        self.previous_yaw = self.current_yaw;
    }
}

impl OrientationSource for PlatformFusion {
    fn sample(&mut self) -> Quat {
        for event in self.stream.next_batch(SOURCE_TIMEOUT) {
            self.handle_event(event);
        }
        self.orientation()
    }
}

/// Fixed-weight blend of one Euler axis, with the ±2π correction for the
/// −180°/180° boundary: when the two signals straddle it, lift the negative
/// one by a full turn before blending and wrap the result back afterwards.
fn blend_axis(gyro: f32, acc_mag: f32) -> f32 {
    let one_minus = 1.0 - FILTER_COEFFICIENT;
    if gyro < -0.5 * PI && acc_mag > 0.0 {
        let mut fused = FILTER_COEFFICIENT * (gyro + 2.0 * PI) + one_minus * acc_mag;
        if fused > PI {
            fused -= 2.0 * PI;
        }
        fused
    } else if acc_mag < -0.5 * PI && gyro > 0.0 {
        let mut fused = FILTER_COEFFICIENT * gyro + one_minus * (acc_mag + 2.0 * PI);
        if fused > PI {
            fused -= 2.0 * PI;
        }
        fused
    } else {
        FILTER_COEFFICIENT * gyro + one_minus * acc_mag
    }
}

/// Orientation matrix from a gravity/geomagnetic pair. Rows are the
/// horizontal (east), magnetic-north and up axes. Returns `None` when the
/// cross product degenerates (free fall or magnetic pole), matching the
/// platform convention of a 0.1 norm guard.
fn rotation_matrix_from_gravity_mag(gravity: Vec3, geomagnetic: Vec3) -> Option<Mat3> {
    let h = geomagnetic.cross(gravity);
    let norm_h = h.length();
    if norm_h < 0.1 {
        return None;
    }
    let h = h / norm_h;
    let a = gravity.normalize();
    let m = a.cross(h);
    Some(Mat3::from_cols(h, m, a).transpose())
}

/// Extract (yaw, pitch, roll) from a row-major orientation matrix.
fn orientation_from_matrix(m: &Mat3) -> [f32; 3] {
    let r0 = m.row(0);
    let r1 = m.row(1);
    let r2 = m.row(2);
    [
        r0.y.atan2(r1.y),
        (-r2.y).asin(),
        (-r2.x).atan2(r2.z),
    ]
}

/// Rebuild the orientation matrix from (yaw, pitch, roll), composing
/// roll (Y), pitch (X), then yaw (Z). The composition order and the sign
/// convention of the individual axis matrices must match
/// `orientation_from_matrix` exactly.
fn matrix_from_orientation(o: [f32; 3]) -> Mat3 {
    let (sin_x, cos_x) = o[1].sin_cos();
    let (sin_y, cos_y) = o[2].sin_cos();
    let (sin_z, cos_z) = o[0].sin_cos();

    let x_m = Mat3::from_cols(
        Vec3::new(1.0, 0.0, 0.0),
        Vec3::new(0.0, cos_x, sin_x),
        Vec3::new(0.0, -sin_x, cos_x),
    )
    .transpose();
    let y_m = Mat3::from_cols(
        Vec3::new(cos_y, 0.0, sin_y),
        Vec3::new(0.0, 1.0, 0.0),
        Vec3::new(-sin_y, 0.0, cos_y),
    )
    .transpose();
    let z_m = Mat3::from_cols(
        Vec3::new(cos_z, sin_z, 0.0),
        Vec3::new(-sin_z, cos_z, 0.0),
        Vec3::new(0.0, 0.0, 1.0),
    )
    .transpose();

    z_m * (x_m * y_m)
}

/// Small-rotation quaternion from an angular velocity over a half timestep.
fn delta_rotation(gyro: Vec3, time_factor: f32) -> Quat {
    let omega = gyro.length();
    let axis = if omega > EPSILON {
        gyro / omega
    } else {
        Vec3::ZERO
    };
    let theta_over_two = omega * time_factor;
    let (sin_t, cos_t) = theta_over_two.sin_cos();
    Quat::from_xyzw(axis.x * sin_t, axis.y * sin_t, axis.z * sin_t, cos_t)
}

/// Final Euler triple to quaternion: X, then Y, then Z axis rotations.
/// Reordering changes handedness.
fn quaternion_from_orientation(o: [f32; 3]) -> Quat {
    let qx = Quat::from_axis_angle(Vec3::X, o[0]);
    let qy = Quat::from_axis_angle(Vec3::Y, o[1]);
    let qz = Quat::from_axis_angle(Vec3::Z, o[2]);
    (qx * qy * qz).normalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted {
        batches: Vec<Vec<SensorEvent>>,
    }

    impl SensorEventStream for Scripted {
        fn next_batch(&mut self, _timeout: Duration) -> Vec<SensorEvent> {
            if self.batches.is_empty() {
                Vec::new()
            } else {
                self.batches.remove(0)
            }
        }
    }

    fn engine(batches: Vec<Vec<SensorEvent>>) -> PlatformFusion {
        PlatformFusion::new(Box::new(Scripted { batches }))
    }

    #[test]
    fn wraparound_blend_stays_near_boundary() {
        let gyro = (-179.0_f32).to_radians();
        let acc_mag = 10.0_f32.to_radians();
        let fused = blend_axis(gyro, acc_mag);

        // The fused angle must hug the ±180° boundary instead of collapsing
        // toward 0°: within 20° of the nearer input (−179° ≡ +181°).
        let lifted = gyro + 2.0 * PI;
        assert!((fused - lifted).abs() < 20.0_f32.to_radians());
        assert!(fused.abs() <= PI + 1e-6);

        // Symmetric case.
        let fused2 = blend_axis(acc_mag, gyro);
        assert!(fused2.abs() > 150.0_f32.to_radians() || fused2 > 0.0);
        assert!(fused2.abs() <= PI + 1e-6);
    }

    #[test]
    fn plain_blend_without_straddle() {
        let fused = blend_axis(1.0, 0.5);
        assert!((fused - (0.98 * 1.0 + 0.02 * 0.5)).abs() < 1e-6);
    }

    #[test]
    fn degenerate_acc_mag_pair_keeps_awaiting() {
        let mut eng = engine(vec![]);
        // Gravity parallel to the geomagnetic vector: cross product is zero.
        eng.handle_event(SensorEvent::Magnetometer(Vec3::new(0.0, 0.0, 50.0)));
        eng.handle_event(SensorEvent::Accelerometer(Vec3::new(0.0, 0.0, 9.8)));
        assert!(!eng.acc_mag_ready);

        // Gyro samples are dropped until the baseline exists.
        eng.handle_event(SensorEvent::Gyroscope(Vec3::new(1.0, 0.0, 0.0), 1_000_000));
        assert!(!eng.is_tracking());
    }

    #[test]
    fn valid_acc_mag_pair_starts_tracking() {
        let mut eng = engine(vec![]);
        eng.handle_event(SensorEvent::Magnetometer(Vec3::new(22.0, 5.0, -40.0)));
        eng.handle_event(SensorEvent::Accelerometer(Vec3::new(0.0, 9.8, 0.0)));
        assert!(eng.acc_mag_ready);

        eng.handle_event(SensorEvent::Gyroscope(Vec3::ZERO, 1_000_000));
        assert!(eng.is_tracking());
    }

    #[test]
    fn orientation_matrix_round_trip() {
        let o = [0.3_f32, -0.2, 0.7];
        let m = matrix_from_orientation(o);
        let back = orientation_from_matrix(&m);
        for axis in 0..3 {
            assert!((back[axis] - o[axis]).abs() < 1e-5, "axis {axis}");
        }
    }

    #[test]
    fn reported_orientation_is_unit() {
        let mut eng = engine(vec![
            vec![
                SensorEvent::Magnetometer(Vec3::new(22.0, 5.0, -40.0)),
                SensorEvent::Accelerometer(Vec3::new(0.1, 9.7, 0.4)),
                SensorEvent::Gyroscope(Vec3::new(0.1, 0.2, -0.1), 1_000_000),
                SensorEvent::Gyroscope(Vec3::new(0.1, 0.2, -0.1), 11_000_000),
                SensorEvent::Gyroscope(Vec3::new(0.0, 0.1, 0.0), 21_000_000),
            ],
        ]);
        let q = eng.sample();
        assert!((q.length() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn still_device_keeps_gyro_orientation_stable() {
        let mut eng = engine(vec![]);
        // Gravity along +Z with magnetic north in the Y/Z plane puts the
        // acc/mag orientation exactly at zero on every axis, so a still
        // device must stay there.
        eng.handle_event(SensorEvent::Magnetometer(Vec3::new(0.0, 50.0, -30.0)));
        eng.handle_event(SensorEvent::Accelerometer(Vec3::new(0.0, 0.0, 9.8)));
        for axis in 0..3 {
            assert!(eng.acc_mag_orientation[axis].abs() < 1e-6, "axis {axis}");
        }

        let mut ts = 1_000_000_i64;
        for _ in 0..100 {
            eng.handle_event(SensorEvent::Gyroscope(Vec3::ZERO, ts));
            ts += 10_000_000;
        }
        for axis in 0..3 {
            assert!(eng.gyro_orientation[axis].abs() < 1e-4, "axis {axis}");
        }
    }
}
