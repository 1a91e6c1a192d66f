//! Source backed by a raw capture device

use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use super::backend::{CaptureBackend, CaptureDevice, CaptureFormat};
use super::{AdapterStatus, EventSender, SourceAdapter};
use crate::config::Policy;
use crate::error::SourceError;
use crate::frame::{Event, Frame, StatsSnapshot};

/// Confidence reported while frames are flowing
const STREAMING_CONFIDENCE: f64 = 0.9;

/// Camera adapter: opens the device through the first backend that works,
/// synthesises stats, and now and then raises a simulated gesture event.
pub struct CameraAdapter {
    device_id: u32,
    policy: Policy,
    backends: Vec<Box<dyn CaptureBackend>>,
    device: Option<Box<dyn CaptureDevice>>,
    backend_name: Option<&'static str>,
    events: Option<EventSender>,
    rng: StdRng,
    started: bool,
    status: AdapterStatus,
    blank: Frame,
    stats: StatsSnapshot,
    window_start: Instant,
    window_frames: u32,
}

impl CameraAdapter {
    pub fn new(device_id: u32, policy: Policy, backends: Vec<Box<dyn CaptureBackend>>) -> Self {
        Self::with_rng(device_id, policy, backends, StdRng::from_entropy())
    }

    /// Same as [`new`](Self::new) with a caller-supplied random source
    pub fn with_rng(
        device_id: u32,
        policy: Policy,
        backends: Vec<Box<dyn CaptureBackend>>,
        rng: StdRng,
    ) -> Self {
        let blank = Frame::blank(policy.frame_width, policy.frame_height);
        Self {
            device_id,
            policy,
            backends,
            device: None,
            backend_name: None,
            events: None,
            rng,
            started: false,
            status: AdapterStatus::Ready,
            blank,
            stats: StatsSnapshot::default(),
            window_start: Instant::now(),
            window_frames: 0,
        }
    }

    /// Name of the backend that opened the device, if any
    pub fn backend(&self) -> Option<&'static str> {
        self.backend_name
    }

    fn open_first_backend(&self) -> Option<(Box<dyn CaptureDevice>, &'static str)> {
        let format = CaptureFormat::mjpeg(self.policy.frame_width, self.policy.frame_height);
        for backend in &self.backends {
            match backend.open(self.device_id) {
                Ok(mut device) => {
                    if let Err(e) = device.configure(&format) {
                        warn!(
                            backend = backend.name(),
                            "Could not apply {}x{} MJPEG, using device format: {}",
                            format.width,
                            format.height,
                            e
                        );
                    }
                    return Some((device, backend.name()));
                }
                Err(e) => {
                    debug!(backend = backend.name(), "Open failed: {}", e);
                }
            }
        }
        None
    }

    fn count_frame(&mut self) {
        self.window_frames += 1;
        let elapsed = self.window_start.elapsed();
        if elapsed.as_secs_f64() >= 1.0 {
            self.stats.fps = f64::from(self.window_frames) / elapsed.as_secs_f64();
            self.window_frames = 0;
            self.window_start = Instant::now();
        }
    }

    fn maybe_simulate_event(&mut self) {
        if !self.rng.gen_bool(self.policy.simulated_event_probability) {
            return;
        }
        self.stats.gesture_count += 1;
        if let Some(events) = &self.events {
            if !events.emit(Event::simulated()) {
                debug!("Event queue closed, simulated gesture dropped");
            }
        }
    }
}

impl SourceAdapter for CameraAdapter {
    fn name(&self) -> &str {
        "camera"
    }

    fn on_event(&mut self, events: EventSender) -> Result<(), SourceError> {
        self.events = Some(events);
        Ok(())
    }

    fn start(&mut self) -> Result<(), SourceError> {
        if self.started {
            return Err(SourceError::AlreadyStarted);
        }
        self.started = true;
        self.window_start = Instant::now();
        self.window_frames = 0;

        match self.open_first_backend() {
            Some((device, name)) => {
                info!(device = self.device_id, backend = name, "Camera opened");
                self.device = Some(device);
                self.backend_name = Some(name);
                self.status = AdapterStatus::Ready;
                Ok(())
            }
            None => {
                let tried: Vec<&'static str> = self.backends.iter().map(|b| b.name()).collect();
                warn!(
                    device = self.device_id,
                    "No capture backend available, serving blank frames"
                );
                self.status = AdapterStatus::Degraded;
                Err(SourceError::Unavailable {
                    device: self.device_id,
                    tried,
                })
            }
        }
    }

    fn stop(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.release();
            info!(device = self.device_id, "Camera released");
        }
        self.backend_name = None;
        self.started = false;
    }

    fn next_frame(&mut self) -> Option<Frame> {
        let Some(device) = self.device.as_mut() else {
            return Some(self.blank.clone());
        };

        match device.read() {
            Ok(Some(frame)) => {
                self.stats.confidence = STREAMING_CONFIDENCE;
                self.count_frame();
                self.maybe_simulate_event();
                Some(frame)
            }
            Ok(None) => None,
            Err(e) => {
                debug!("Camera read failed: {}", e);
                Some(self.blank.clone())
            }
        }
    }

    fn stats(&mut self) -> StatsSnapshot {
        self.stats
    }

    fn status(&self) -> AdapterStatus {
        self.status
    }
}

impl std::fmt::Debug for CameraAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraAdapter")
            .field("device_id", &self.device_id)
            .field("backend", &self.backend_name)
            .field("status", &self.status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::event_queue;
    use crate::error::CaptureError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Backend that fails to open, counting attempts
    struct Failing {
        name: &'static str,
        attempts: Arc<AtomicU32>,
    }

    impl CaptureBackend for Failing {
        fn name(&self) -> &'static str {
            self.name
        }

        fn open(&self, _device_id: u32) -> Result<Box<dyn CaptureDevice>, CaptureError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(CaptureError::Device("not here".into()))
        }
    }

    /// Device that yields a fixed frame, fails reads on demand
    struct Fake {
        fail_configure: bool,
        fail_reads: bool,
        released: Arc<AtomicU32>,
    }

    impl CaptureDevice for Fake {
        fn configure(&mut self, _format: &CaptureFormat) -> Result<(), CaptureError> {
            if self.fail_configure {
                Err(CaptureError::Device("format rejected".into()))
            } else {
                Ok(())
            }
        }

        fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
            if self.fail_reads {
                Err(CaptureError::Stream("unplugged".into()))
            } else {
                Ok(Frame::from_rgb(2, 2, vec![7u8; 12]))
            }
        }

        fn release(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Working {
        fail_configure: bool,
        fail_reads: bool,
        released: Arc<AtomicU32>,
    }

    impl CaptureBackend for Working {
        fn name(&self) -> &'static str {
            "working"
        }

        fn open(&self, _device_id: u32) -> Result<Box<dyn CaptureDevice>, CaptureError> {
            Ok(Box::new(Fake {
                fail_configure: self.fail_configure,
                fail_reads: self.fail_reads,
                released: Arc::clone(&self.released),
            }))
        }
    }

    fn policy(probability: f64) -> Policy {
        Policy {
            simulated_event_probability: probability,
            ..Policy::default()
        }
    }

    fn seeded(backends: Vec<Box<dyn CaptureBackend>>, probability: f64) -> CameraAdapter {
        CameraAdapter::with_rng(0, policy(probability), backends, StdRng::seed_from_u64(7))
    }

    #[test]
    fn first_working_backend_wins() {
        let attempts = Arc::new(AtomicU32::new(0));
        let mut adapter = seeded(
            vec![
                Box::new(Failing {
                    name: "first",
                    attempts: Arc::clone(&attempts),
                }),
                Box::new(Working::default()),
                Box::new(Failing {
                    name: "never",
                    attempts: Arc::clone(&attempts),
                }),
            ],
            0.0,
        );

        adapter.start().unwrap();
        assert_eq!(adapter.backend(), Some("working"));
        assert_eq!(adapter.status(), AdapterStatus::Ready);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        let frame = adapter.next_frame().unwrap();
        assert_eq!(frame.pixels()[0], 7);
        assert_eq!(adapter.stats().confidence, 0.9);
        assert_eq!(adapter.stats().detection_count, 0);
    }

    #[test]
    fn configure_failure_is_not_fatal() {
        let mut adapter = seeded(
            vec![Box::new(Working {
                fail_configure: true,
                ..Default::default()
            })],
            0.0,
        );
        adapter.start().unwrap();
        assert_eq!(adapter.status(), AdapterStatus::Ready);
        assert!(!adapter.next_frame().unwrap().is_blank());
    }

    #[test]
    fn all_backends_failing_degrades_to_blank_frames() {
        let attempts = Arc::new(AtomicU32::new(0));
        let mut adapter = seeded(
            vec![
                Box::new(Failing {
                    name: "v4l2",
                    attempts: Arc::clone(&attempts),
                }),
                Box::new(Failing {
                    name: "libcamera",
                    attempts: Arc::clone(&attempts),
                }),
            ],
            1.0,
        );

        match adapter.start() {
            Err(SourceError::Unavailable { device, tried }) => {
                assert_eq!(device, 0);
                assert_eq!(tried, vec!["v4l2", "libcamera"]);
            }
            other => panic!("expected Unavailable, got {other:?}"),
        }
        assert_eq!(adapter.status(), AdapterStatus::Degraded);

        for _ in 0..5 {
            let frame = adapter.next_frame().unwrap();
            assert_eq!((frame.width(), frame.height(), frame.channels()), (640, 480, 3));
            assert!(frame.is_blank());
        }
        // no simulated events without real frames
        assert_eq!(adapter.stats().gesture_count, 0);

        adapter.stop();
        adapter.stop();
    }

    #[test]
    fn failed_read_yields_blank_frame() {
        let mut adapter = seeded(
            vec![Box::new(Working {
                fail_reads: true,
                ..Default::default()
            })],
            0.0,
        );
        adapter.start().unwrap();
        assert!(adapter.next_frame().unwrap().is_blank());
        assert_eq!(adapter.status(), AdapterStatus::Ready);
    }

    #[test]
    fn simulated_events_count_gestures() {
        let mut adapter = seeded(vec![Box::new(Working::default())], 1.0);
        let (events, mut rx) = event_queue();
        adapter.on_event(events).unwrap();
        adapter.start().unwrap();

        for _ in 0..3 {
            adapter.next_frame();
        }
        assert_eq!(adapter.stats().gesture_count, 3);
        for _ in 0..3 {
            let event = rx.try_recv().unwrap();
            assert!(event.is_simulated());
            assert!(event.parameters.is_empty());
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn zero_probability_never_fires() {
        let mut adapter = seeded(vec![Box::new(Working::default())], 0.0);
        let (events, mut rx) = event_queue();
        adapter.on_event(events).unwrap();
        adapter.start().unwrap();
        for _ in 0..100 {
            adapter.next_frame();
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(adapter.stats().gesture_count, 0);
    }

    #[test]
    fn second_start_fails_and_stop_releases_once() {
        let backend = Working::default();
        let released = Arc::clone(&backend.released);
        let mut adapter = seeded(vec![Box::new(backend)], 0.0);

        adapter.start().unwrap();
        assert!(matches!(adapter.start(), Err(SourceError::AlreadyStarted)));

        adapter.stop();
        adapter.stop();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.backend(), None);
    }
}
