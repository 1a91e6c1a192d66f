//! Capture sources
//!
//! Everything the producer can pull frames from sits behind [`SourceAdapter`]:
//! - [`DetectorAdapter`]: wraps an external detector ([`Detector`])
//! - [`CameraAdapter`]: raw capture device with ordered backend fallback,
//!   blank frames when no backend opens, simulated gesture events
//!
//! [`select_adapter`] picks one of them once, at startup.

pub mod backend;
pub mod camera;
pub mod detector;
pub mod telemetry;

pub use backend::{default_backends, CaptureBackend, CaptureDevice, CaptureFormat, LibcameraBackend};
#[cfg(feature = "v4l2")]
pub use backend::V4l2Backend;
pub use camera::CameraAdapter;
pub use detector::{
    CommandCallback, Detector, DetectorAdapter, DetectorCommand, DetectorFactory, DetectorStats,
};
pub use telemetry::CpuMonitor;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::CaptureConfig;
use crate::error::SourceError;
use crate::frame::{Event, Frame, StatsSnapshot};

/// What the producer knows about its source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterStatus {
    /// Delivering real frames
    Ready,
    /// No acquisition possible; serving blank frames at reduced cadence
    Degraded,
}

/// Sending half of the queue from a source to the producer.
///
/// Cheap to clone and usable from any thread, including detector callback
/// threads.
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    /// Queue an event. Returns false once the producer is gone.
    pub fn emit(&self, event: Event) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Receiving half, drained by the producer every tick
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Create the source → producer event queue
pub fn event_queue() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}

/// A frame/stats source owned by the producer.
///
/// Methods are called from the producer thread only. `next_frame` may block,
/// but never for longer than one poll interval.
pub trait SourceAdapter: Send {
    /// Short name for logs and status
    fn name(&self) -> &str;

    /// Register where events raised by the source go
    fn on_event(&mut self, events: EventSender) -> Result<(), SourceError>;

    /// Begin acquisition. Fails with `AlreadyStarted` on a second call, or
    /// `Unavailable` when no backend opens (the adapter then degrades).
    fn start(&mut self) -> Result<(), SourceError>;

    /// Release acquisition resources. Safe after a failed `start` and
    /// safe to call repeatedly.
    fn stop(&mut self);

    /// Most recent frame, or `None` if nothing is available this tick
    fn next_frame(&mut self) -> Option<Frame>;

    /// Best-known stats; fields that cannot be read keep their last value
    fn stats(&mut self) -> StatsSnapshot;

    fn status(&self) -> AdapterStatus;
}

/// Pick the source for this process.
///
/// A detector is preferred when a factory is given and it builds and accepts
/// the event callback; any failure there falls back to the camera adapter
/// over `backends`. Never fails: the camera adapter degrades on its own.
pub fn select_adapter(
    detector: Option<&dyn DetectorFactory>,
    config: &CaptureConfig,
    backends: Vec<Box<dyn CaptureBackend>>,
    events: EventSender,
) -> Box<dyn SourceAdapter> {
    if let Some(factory) = detector {
        match factory.build(config.raw.as_ref()) {
            Ok(detector) => {
                let mut adapter = DetectorAdapter::new(factory.name(), detector, config.policy.clone());
                match adapter.on_event(events.clone()) {
                    Ok(()) => {
                        info!("Using detector source: {}", factory.name());
                        return Box::new(adapter);
                    }
                    Err(e) => warn!("{}. Falling back to camera.", e),
                }
            }
            Err(e) => warn!("{}. Falling back to camera.", e),
        }
    }

    let mut adapter = CameraAdapter::new(config.camera_id, config.policy.clone(), backends);
    if let Err(e) = adapter.on_event(events) {
        warn!("Camera event registration failed: {}", e);
    }
    info!(device = config.camera_id, "Using camera source");
    Box::new(adapter)
}
