//! Fusion over the external head tracker.
//!
//! The tracker streams 100-byte frames over a raw character device at 1 kHz
//! sample cadence, batched up to three sub-samples per frame. Orientation is
//! kept as a quaternion integrated from gyro readings, with a
//! proportional tilt correction against the accelerometer gravity vector.

use std::io;
use std::time::{Duration, Instant};

use glam::{Quat, Vec3};
use log::{debug, warn};

use super::packet::{self, TrackerPacket, PACKET_LEN};
use super::{OrientationSource, SOURCE_TIMEOUT};

const TIME_UNIT: f64 = 1.0 / 1000.0;
const RAW_SCALE: f32 = 0.0001;
const GRAVITY: f32 = 9.8;
const SPIKE_THRESHOLD: f32 = 0.01;
const GRAVITY_THRESHOLD: f32 = 0.1;
const RENORMALIZE_INTERVAL: u32 = 500;

/// Framed byte source for tracker packets.
///
/// `read_packet` blocks up to `timeout` for one frame. `Ok(None)` means the
/// wait timed out with the device healthy; `Err` means the device is gone
/// and the transport has released it.
pub trait TrackerTransport: Send {
    fn read_packet(&mut self, timeout: Duration) -> io::Result<Option<[u8; PACKET_LEN]>>;

    /// Release the underlying device. Reopening happens lazily on the next
    /// `read_packet`.
    fn close(&mut self) {}
}

/// Rolling mean over the last `DEPTH` samples.
struct MeanFilter {
    elements: [f32; Self::DEPTH],
    len: usize,
    next: usize,
}

impl MeanFilter {
    const DEPTH: usize = 20;

    fn new() -> Self {
        Self {
            elements: [0.0; Self::DEPTH],
            len: 0,
            next: 0,
        }
    }

    fn add(&mut self, value: f32) {
        self.elements[self.next] = value;
        self.next = (self.next + 1) % Self::DEPTH;
        self.len = (self.len + 1).min(Self::DEPTH);
    }

    fn mean(&self) -> f32 {
        if self.len == 0 {
            return 0.0;
        }
        self.elements[..self.len].iter().sum::<f32>() / self.len as f32
    }
}

/// Fusion engine fed by tracker frames.
pub struct TrackerFusion {
    transport: Box<dyn TrackerTransport>,
    epoch: Instant,

    q: Quat,
    step: u32,
    gyro_offset: Vec3,
    last_corrected_gyro: Vec3,
    tilt_filter: MeanFilter,

    initialized: bool,
    real_time_delta: f64,
    last_timestamp: u16,
    last_sample_count: u8,
    last_acceleration: Vec3,
    last_rotation_rate: Vec3,
    full_timestamp: u32,
}

impl TrackerFusion {
    pub fn new(transport: Box<dyn TrackerTransport>) -> Self {
        Self {
            transport,
            epoch: Instant::now(),
            q: Quat::IDENTITY,
            step: 0,
            gyro_offset: Vec3::ZERO,
            last_corrected_gyro: Vec3::ZERO,
            tilt_filter: MeanFilter::new(),
            initialized: false,
            real_time_delta: 0.0,
            last_timestamp: 0,
            last_sample_count: 0,
            last_acceleration: Vec3::ZERO,
            last_rotation_rate: Vec3::ZERO,
            full_timestamp: 0,
        }
    }

    pub fn orientation(&self) -> Quat {
        self.q
    }

    /// Last drift-corrected angular velocity in rad/s.
    pub fn angular_velocity(&self) -> Vec3 {
        self.last_corrected_gyro
    }

    /// Orientation extrapolated `delta_t` seconds ahead along the last
    /// angular velocity.
    pub fn predicted(&self, delta_t: f32) -> Quat {
        let gyro_length = self.last_corrected_gyro.length();
        if gyro_length == 0.0 {
            return self.q;
        }
        let axis = self.last_corrected_gyro / gyro_length;
        self.q * Quat::from_axis_angle(axis, gyro_length * delta_t)
    }

    /// Timestamp of the last frame extended past the 16-bit rollover,
    /// in milliseconds.
    pub fn full_timestamp(&self) -> u32 {
        self.full_timestamp
    }

    #[cfg(test)]
    fn step_count(&self) -> u32 {
        self.step
    }

    pub fn process(&mut self, data: &TrackerPacket) {
        let now = self.epoch.elapsed().as_secs_f64();

        if !self.initialized {
            self.initialized = true;
            self.last_acceleration = Vec3::ZERO;
            self.last_rotation_rate = Vec3::ZERO;

            // Baseline sensor-to-host time delta, adjusted with each frame.
            self.full_timestamp = data.timestamp as u32;
            self.real_time_delta = now - self.full_timestamp as f64 * TIME_UNIT;
        } else {
            let timestamp_delta: u32 = if data.timestamp < self.last_timestamp {
                // The 16-bit counter rolled over; bump the high word.
                self.full_timestamp += 0x10000;
                data.timestamp as u32 + 0x10000 - self.last_timestamp as u32
            } else {
                (data.timestamp - self.last_timestamp) as u32
            };
            self.full_timestamp = (self.full_timestamp & !0xffff) | data.timestamp as u32;

            // A frame cannot arrive from the future; clamp the delta down
            // when it would, otherwise creep it upward by 100 us so drift
            // only ever hits the clamping case.
            if self.full_timestamp as f64 * TIME_UNIT + self.real_time_delta > now {
                self.real_time_delta = now - self.full_timestamp as f64 * TIME_UNIT;
            } else {
                self.real_time_delta += 0.0001;
            }

            // Missed ticks within one rollover period get filled by holding
            // the last sample, one update per missed tick.
            if timestamp_delta > self.last_sample_count as u32 && timestamp_delta <= 254 {
                let missed = timestamp_delta - self.last_sample_count as u32;
                debug!("tracker gap: replaying {missed} held samples");
                for _ in 0..missed {
                    self.update_orientation(
                        self.last_rotation_rate,
                        self.last_acceleration,
                        TIME_UNIT as f32,
                    );
                }
            }
        }

        let iterations = data.sample_count.min(3) as usize;
        // When more than three ticks are batched the first stored sample
        // stands in for all the overwritten ones.
        let mut delta_t = if data.sample_count > 3 {
            (data.sample_count - 2) as f32 * TIME_UNIT as f32
        } else {
            TIME_UNIT as f32
        };

        let mut acceleration = self.last_acceleration;
        let mut rotation_rate = self.last_rotation_rate;
        for sample in &data.samples[..iterations] {
            acceleration = Vec3::new(
                sample.accel[0] as f32,
                sample.accel[1] as f32,
                sample.accel[2] as f32,
            ) * RAW_SCALE;
            rotation_rate = Vec3::new(
                sample.gyro[0] as f32,
                sample.gyro[1] as f32,
                sample.gyro[2] as f32,
            ) * RAW_SCALE;

            self.update_orientation(rotation_rate, acceleration, delta_t);
            delta_t = TIME_UNIT as f32;
        }

        self.last_sample_count = data.sample_count;
        self.last_timestamp = data.timestamp;
        self.last_acceleration = acceleration;
        self.last_rotation_rate = rotation_rate;
    }

    fn update_orientation(&mut self, gyro: Vec3, accel: Vec3, delta_t: f32) {
        let corrected = self.gyrocorrect(gyro, accel, delta_t);
        self.last_corrected_gyro = corrected;

        let gyro_length = corrected.length();
        if gyro_length != 0.0 {
            let angle = gyro_length * delta_t;
            let (sin_half, cos_half) = (angle * 0.5).sin_cos();
            let axis = corrected / gyro_length * sin_half;
            self.q *= Quat::from_xyzw(axis.x, axis.y, axis.z, cos_half);
        }

        self.step += 1;
        if self.step % RENORMALIZE_INTERVAL == 0 {
            self.q = self.q.normalize();
        }
    }

    /// Proportional tilt correction of the gyro reading against the
    /// accelerometer gravity direction. The integral term feeds a slow gyro
    /// bias estimate and is disabled during spikes and non-gravity
    /// acceleration.
    fn gyrocorrect(&mut self, gyro: Vec3, accel: Vec3, delta_t: f32) -> Vec3 {
        let up = self.q.inverse() * Vec3::Y;
        let mut corrected = gyro - self.gyro_offset;

        let accel_length = accel.length();
        if accel_length < f32::EPSILON {
            return corrected;
        }

        let mut proportional_gain = 0.25_f32;
        let mut integral_gain = 0.0_f32;

        let accel_n = accel / accel_length;
        let up_n = up.normalize();
        let cos_error = accel_n.dot(up_n);
        let tolerance = 0.00001;
        let tilt_correction = accel_n.cross(up_n) * (2.0 / (1.0 + cos_error + tolerance)).sqrt();

        if self.step > 5 {
            let tilt_angle = up.angle_between(accel);
            self.tilt_filter.add(tilt_angle);
            if tilt_angle > self.tilt_filter.mean() + SPIKE_THRESHOLD {
                proportional_gain = 0.0;
                integral_gain = 0.0;
            }
            if (accel_length / GRAVITY - 1.0).abs() > GRAVITY_THRESHOLD {
                integral_gain = 0.0;
            }
        } else {
            // Snap to the measured gravity direction during startup.
            proportional_gain = 1.0 / delta_t;
            integral_gain = 0.0;
        }

        corrected += tilt_correction * proportional_gain;
        self.gyro_offset -= tilt_correction * integral_gain * delta_t;

        corrected
    }
}

impl OrientationSource for TrackerFusion {
    fn stop(&mut self) {
        self.transport.close();
    }

    fn sample(&mut self) -> Quat {
        match self.transport.read_packet(SOURCE_TIMEOUT) {
            Ok(Some(buf)) => {
                if let Ok(data) = packet::decode(&buf) {
                    self.process(&data);
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!("tracker read failed, resetting orientation: {err}");
                self.q = Quat::IDENTITY;
            }
        }
        self.q
    }
}

/// Character-device transport for the physical tracker. The device node is
/// opened lazily and closed on any error so a replug recovers on its own.
pub struct DeviceFile {
    path: &'static str,
    fd: i32,
}

impl DeviceFile {
    pub const DEFAULT_PATH: &'static str = "/dev/ovr0\0";

    pub fn new() -> Self {
        Self {
            path: Self::DEFAULT_PATH,
            fd: -1,
        }
    }

    fn ensure_open(&mut self) -> io::Result<()> {
        if self.fd >= 0 {
            return Ok(());
        }
        // Safety: path is a valid NUL-terminated string constant.
        let fd = unsafe { libc::open(self.path.as_ptr() as *const libc::c_char, libc::O_RDONLY) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        self.fd = fd;
        Ok(())
    }

    fn close_fd(&mut self) {
        if self.fd >= 0 {
            // Safety: fd is an open descriptor owned by this struct.
            unsafe { libc::close(self.fd) };
        }
        self.fd = -1;
    }
}

impl Default for DeviceFile {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackerTransport for DeviceFile {
    fn read_packet(&mut self, timeout: Duration) -> io::Result<Option<[u8; PACKET_LEN]>> {
        self.ensure_open()?;

        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // Safety: pfd points at one valid pollfd.
        let n = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
        if n < 0 {
            let err = io::Error::last_os_error();
            self.close_fd();
            return Err(err);
        }
        if n == 0 || pfd.revents & libc::POLLIN == 0 {
            return Ok(None);
        }

        let mut buf = [0u8; PACKET_LEN];
        // Safety: buf holds PACKET_LEN writable bytes.
        let r = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, PACKET_LEN) };
        if r < 0 {
            let err = io::Error::last_os_error();
            self.close_fd();
            return Err(err);
        }
        Ok(Some(buf))
    }

    fn close(&mut self) {
        self.close_fd();
    }
}

impl Drop for DeviceFile {
    fn drop(&mut self) {
        self.close_fd();
    }
}

#[cfg(test)]
mod tests {
    use super::super::packet::test_support::encode;
    use super::super::packet::TrackerSample;
    use super::*;

    struct Scripted {
        frames: Vec<io::Result<Option<[u8; PACKET_LEN]>>>,
    }

    impl TrackerTransport for Scripted {
        fn read_packet(&mut self, _timeout: Duration) -> io::Result<Option<[u8; PACKET_LEN]>> {
            if self.frames.is_empty() {
                Ok(None)
            } else {
                self.frames.remove(0)
            }
        }
    }

    fn fusion() -> TrackerFusion {
        TrackerFusion::new(Box::new(Scripted { frames: Vec::new() }))
    }

    fn quiet_packet(timestamp: u16, sample_count: u8) -> TrackerPacket {
        let mut packet = TrackerPacket {
            sample_count,
            timestamp,
            ..Default::default()
        };
        // Gravity along +Y in raw units, no rotation.
        for i in 0..sample_count.min(3) as usize {
            packet.samples[i] = TrackerSample {
                accel: [0, 98_000, 0],
                gyro: [0, 0, 0],
            };
        }
        packet
    }

    #[test]
    fn full_timestamp_survives_rollover() {
        let mut eng = fusion();
        for (ts, expected) in [
            (65530u16, 65530u32),
            (65533, 65533),
            (2, 0x10000 + 2),
            (5, 0x10000 + 5),
        ] {
            eng.process(&quiet_packet(ts, 3));
            assert_eq!(eng.full_timestamp(), expected, "ts {ts}");
        }
    }

    #[test]
    fn missed_ticks_replay_held_samples() {
        let mut eng = fusion();
        eng.process(&quiet_packet(100, 3));
        let base = eng.step_count();
        assert_eq!(base, 3);

        // 10 ticks elapsed, 3 carried in the frame: 7 hold replays plus 3
        // real sub-samples.
        eng.process(&quiet_packet(110, 3));
        assert_eq!(eng.step_count() - base, 10);
    }

    #[test]
    fn large_gaps_are_not_replayed() {
        let mut eng = fusion();
        eng.process(&quiet_packet(100, 3));
        eng.process(&quiet_packet(1000, 3));
        // Delta of 900 exceeds the replay window; only the frame's own
        // samples run.
        assert_eq!(eng.step_count(), 6);
    }

    #[test]
    fn batched_frame_stretches_first_sample() {
        let mut eng = fusion();
        let packet = quiet_packet(100, 7);
        eng.process(&packet);
        // Only three stored sub-samples run regardless of the tick count.
        assert_eq!(eng.step_count(), 3);
        assert_eq!(eng.full_timestamp(), 100);
    }

    #[test]
    fn orientation_stays_unit_through_renormalization() {
        let mut eng = fusion();
        let mut ts = 0u16;
        // 200 frames x 3 sub-samples with a slow roll crosses step 500.
        for _ in 0..200 {
            let mut packet = quiet_packet(ts, 3);
            for sample in packet.samples.iter_mut() {
                sample.gyro = [500, 0, 0];
            }
            eng.process(&packet);
            ts = ts.wrapping_add(3);
        }
        assert!(eng.step_count() >= 500);
        assert!((eng.orientation().length() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn startup_snaps_toward_gravity() {
        let mut eng = fusion();
        // Gravity along +X while the orientation's up is +Y forces a large
        // startup correction.
        let mut packet = quiet_packet(1, 1);
        packet.samples[0].accel = [98_000, 0, 0];
        eng.process(&packet);
        let up = eng.orientation().inverse() * Vec3::Y;
        // One full-gain step lands up near the measured gravity direction.
        assert!(up.x > 0.9, "up = {up:?}");
    }

    #[test]
    fn sample_decodes_and_advances() {
        let packet = quiet_packet(42, 2);
        let mut eng = TrackerFusion::new(Box::new(Scripted {
            frames: vec![Ok(Some(encode(&packet))), Ok(None)],
        }));
        let q1 = eng.sample();
        assert_eq!(eng.full_timestamp(), 42);
        assert!((q1.length() - 1.0).abs() < 1e-3);

        // Timeout keeps the previous orientation.
        let q2 = eng.sample();
        assert_eq!(q1, q2);
    }

    #[test]
    fn transport_error_resets_orientation() {
        let packet = quiet_packet(7, 3);
        let mut eng = TrackerFusion::new(Box::new(Scripted {
            frames: vec![
                Ok(Some(encode(&packet))),
                Err(io::Error::from(io::ErrorKind::NotConnected)),
            ],
        }));
        eng.sample();
        let q = eng.sample();
        assert_eq!(q, Quat::IDENTITY);
    }

    #[test]
    fn prediction_extrapolates_along_gyro() {
        let mut eng = fusion();
        eng.last_corrected_gyro = Vec3::new(0.0, 1.0, 0.0);
        let predicted = eng.predicted(0.5);
        let expected = Quat::from_axis_angle(Vec3::Y, 0.5);
        assert!(predicted.dot(expected).abs() > 0.9999);

        eng.last_corrected_gyro = Vec3::ZERO;
        assert_eq!(eng.predicted(0.5), eng.orientation());
    }
}
