//! Background orientation sampling.
//!
//! `OrientationService` owns one fusion engine and runs it on a worker
//! thread while started. The worker publishes each sampled quaternion into a
//! shared slot; render code copies the latest value out without ever
//! blocking on sensor I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use glam::Quat;
use log::{info, warn};

use crate::fusion::OrientationSource;

struct Shared {
    orientation: Mutex<Quat>,
    running: AtomicBool,
}

/// Owns the fusion engine and its worker thread.
pub struct OrientationService {
    engine: Option<Box<dyn OrientationSource>>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<Box<dyn OrientationSource>>>,
}

impl OrientationService {
    pub fn new(engine: Box<dyn OrientationSource>) -> Self {
        Self {
            engine: Some(engine),
            shared: Arc::new(Shared {
                orientation: Mutex::new(Quat::IDENTITY),
                running: AtomicBool::new(false),
            }),
            worker: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Swap in a different fusion engine. Refused while the worker runs.
    pub fn set_engine(&mut self, engine: Box<dyn OrientationSource>) -> bool {
        if self.worker.is_some() {
            warn!("engine swap refused while sampling is running");
            return false;
        }
        self.engine = Some(engine);
        true
    }

    /// Start the worker thread. A second start while running is a no-op.
    pub fn start(&mut self) {
        if self.worker.is_some() {
            return;
        }
        let Some(mut engine) = self.engine.take() else {
            return;
        };

        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        self.worker = Some(std::thread::spawn(move || {
            engine.start();
            while shared.running.load(Ordering::Acquire) {
                let q = engine.sample();
                *shared
                    .orientation
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = q;
            }
            engine.stop();
            engine
        }));
        info!("orientation sampling started");
    }

    /// Stop the worker and wait for it to exit. Safe to call when stopped.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            match worker.join() {
                Ok(engine) => self.engine = Some(engine),
                Err(_) => warn!("orientation worker panicked, engine lost"),
            }
            info!("orientation sampling stopped");
        }
    }

    /// Latest published orientation. Identity until the first sample lands.
    pub fn orientation(&self) -> Quat {
        *self
            .shared
            .orientation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for OrientationService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct StubSource {
        value: Quat,
        samples: Arc<AtomicU32>,
        starts: Arc<AtomicU32>,
        stops: Arc<AtomicU32>,
    }

    impl OrientationSource for StubSource {
        fn start(&mut self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn sample(&mut self) -> Quat {
            self.samples.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(1));
            self.value
        }
    }

    fn stub(value: Quat) -> (Box<StubSource>, Arc<AtomicU32>, Arc<AtomicU32>, Arc<AtomicU32>) {
        let samples = Arc::new(AtomicU32::new(0));
        let starts = Arc::new(AtomicU32::new(0));
        let stops = Arc::new(AtomicU32::new(0));
        let source = Box::new(StubSource {
            value,
            samples: Arc::clone(&samples),
            starts: Arc::clone(&starts),
            stops: Arc::clone(&stops),
        });
        (source, samples, starts, stops)
    }

    #[test]
    fn publishes_sampled_orientation() {
        let q = Quat::from_axis_angle(glam::Vec3::Y, 0.5);
        let (source, samples, starts, stops) = stub(q);
        let mut service = OrientationService::new(source);
        assert_eq!(service.orientation(), Quat::IDENTITY);

        service.start();
        while samples.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        service.stop();

        assert_eq!(service.orientation(), q);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_without_start_is_harmless() {
        let (source, _, _, stops) = stub(Quat::IDENTITY);
        let mut service = OrientationService::new(source);
        service.stop();
        assert_eq!(stops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn restart_reuses_the_engine() {
        let (source, samples, starts, _) = stub(Quat::IDENTITY);
        let mut service = OrientationService::new(source);

        service.start();
        while samples.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        service.stop();
        let after_first = samples.load(Ordering::SeqCst);

        service.start();
        while samples.load(Ordering::SeqCst) == after_first {
            std::thread::sleep(Duration::from_millis(1));
        }
        service.stop();

        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn engine_swap_refused_while_running() {
        let (source, samples, _, _) = stub(Quat::IDENTITY);
        let (replacement, _, _, _) = stub(Quat::IDENTITY);
        let mut service = OrientationService::new(source);

        service.start();
        while samples.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!service.set_engine(replacement));
        service.stop();

        let (replacement, _, _, _) = stub(Quat::IDENTITY);
        assert!(service.set_engine(replacement));
    }
}
