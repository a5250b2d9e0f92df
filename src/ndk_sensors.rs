//! Android sensor event stream via NDK FFI.
//!
//! Feeds accelerometer, magnetometer and gyroscope readings into
//! [`PlatformFusion`](crate::fusion::platform::PlatformFusion). The event
//! queue is created lazily on the first poll so the looper binds to the
//! sampling thread, not the thread that constructed the stream.

use std::ptr;
use std::time::Duration;

use log::{info, warn};

use crate::fusion::platform::{SensorEvent, SensorEventStream};

const ASENSOR_TYPE_ACCELEROMETER: i32 = 1;
const ASENSOR_TYPE_MAGNETIC_FIELD: i32 = 2;
const ASENSOR_TYPE_GYROSCOPE: i32 = 4;

// 100 Hz, same cadence for all three sensors.
const SENSOR_RATE_US: i32 = 10_000;

pub struct AndroidSensorStream {
    sensor_manager: *mut ndk_sys::ASensorManager,
    event_queue: *mut ndk_sys::ASensorEventQueue,
    initialized: bool,
    init_failed: bool,
}

// Safety: the queue and manager pointers are only touched from the thread
// that calls next_batch, which creates them.
unsafe impl Send for AndroidSensorStream {}

impl AndroidSensorStream {
    pub fn new() -> Self {
        Self {
            sensor_manager: ptr::null_mut(),
            event_queue: ptr::null_mut(),
            initialized: false,
            init_failed: false,
        }
    }

    fn init(&mut self) {
        self.initialized = true;

        unsafe {
            self.sensor_manager = ndk_sys::ASensorManager_getInstance();
            if self.sensor_manager.is_null() {
                warn!("ASensorManager not available");
                self.init_failed = true;
                return;
            }

            let mut looper = ndk_sys::ALooper_forThread();
            if looper.is_null() {
                looper = ndk_sys::ALooper_prepare(0);
            }
            if looper.is_null() {
                warn!("failed to prepare ALooper");
                self.init_failed = true;
                return;
            }

            self.event_queue = ndk_sys::ASensorManager_createEventQueue(
                self.sensor_manager,
                looper,
                0,
                None,
                ptr::null_mut(),
            );
            if self.event_queue.is_null() {
                warn!("failed to create sensor event queue");
                self.init_failed = true;
                return;
            }

            for sensor_type in [
                ASENSOR_TYPE_ACCELEROMETER,
                ASENSOR_TYPE_MAGNETIC_FIELD,
                ASENSOR_TYPE_GYROSCOPE,
            ] {
                let sensor =
                    ndk_sys::ASensorManager_getDefaultSensor(self.sensor_manager, sensor_type);
                if sensor.is_null() {
                    warn!("sensor type {sensor_type} not available");
                    continue;
                }
                if ndk_sys::ASensorEventQueue_enableSensor(self.event_queue, sensor) < 0 {
                    warn!("failed to enable sensor type {sensor_type}");
                    continue;
                }
                ndk_sys::ASensorEventQueue_setEventRate(self.event_queue, sensor, SENSOR_RATE_US);
            }

            info!("platform sensors enabled at {SENSOR_RATE_US} us");
        }
    }

    unsafe fn drain(&mut self, out: &mut Vec<SensorEvent>) {
        let mut event: ndk_sys::ASensorEvent = std::mem::zeroed();
        while ndk_sys::ASensorEventQueue_getEvents(self.event_queue, &mut event, 1) > 0 {
            let data = event.__bindgen_anon_1.__bindgen_anon_1.data;
            let v = glam::Vec3::new(data[0], data[1], data[2]);
            match event.type_ {
                ASENSOR_TYPE_ACCELEROMETER => out.push(SensorEvent::Accelerometer(v)),
                ASENSOR_TYPE_MAGNETIC_FIELD => out.push(SensorEvent::Magnetometer(v)),
                ASENSOR_TYPE_GYROSCOPE => out.push(SensorEvent::Gyroscope(v, event.timestamp)),
                _ => {}
            }
        }
    }
}

impl Default for AndroidSensorStream {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorEventStream for AndroidSensorStream {
    fn next_batch(&mut self, timeout: Duration) -> Vec<SensorEvent> {
        if !self.initialized {
            self.init();
        }
        if self.init_failed || self.event_queue.is_null() {
            std::thread::sleep(timeout);
            return Vec::new();
        }

        let mut events = Vec::new();
        unsafe {
            self.drain(&mut events);
            if events.is_empty() {
                ndk_sys::ALooper_pollOnce(
                    timeout.as_millis() as i32,
                    ptr::null_mut(),
                    ptr::null_mut(),
                    ptr::null_mut(),
                );
                self.drain(&mut events);
            }
        }
        events
    }
}

impl Drop for AndroidSensorStream {
    fn drop(&mut self) {
        unsafe {
            if !self.event_queue.is_null() && !self.sensor_manager.is_null() {
                ndk_sys::ASensorManager_destroyEventQueue(self.sensor_manager, self.event_queue);
            }
        }
    }
}
