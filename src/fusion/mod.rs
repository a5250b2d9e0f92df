//! Sensor fusion engines producing the head orientation quaternion.
//!
//! Two engines exist behind one capability: [`platform::PlatformFusion`]
//! fuses the handset's accelerometer/magnetometer/gyroscope streams with a
//! complementary filter, and [`tracker::TrackerFusion`] integrates packets
//! from an external head tracker device. Exactly one is active at a time,
//! chosen when the owning service is assembled.

pub mod packet;
pub mod platform;
pub mod tracker;

use std::time::Duration;

use glam::Quat;

/// Which fusion engine the host asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorType {
    /// Handset accelerometer + magnetometer + gyroscope.
    Internal,
    /// External head tracker over a raw character device.
    Tracker,
}

impl SensorType {
    /// Decode the host-facing integer selector.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(SensorType::Internal),
            1 => Some(SensorType::Tracker),
            _ => None,
        }
    }
}

/// One drift-corrected orientation producer.
///
/// `sample` performs a single acquire-and-fuse step and returns the current
/// orientation. It may block for a bounded time waiting on the underlying
/// source; a step that sees no new data returns the previous orientation.
pub trait OrientationSource: Send {
    /// Acquire underlying resources (open device, enable sensors).
    fn start(&mut self) {}

    /// Release underlying resources. No `sample` call follows until the next
    /// `start`.
    fn stop(&mut self) {}

    fn sample(&mut self) -> Quat;
}

/// Bounded wait applied by engines when their source has nothing pending.
pub(crate) const SOURCE_TIMEOUT: Duration = Duration::from_millis(100);
