//! Source backed by an external detector
//!
//! The detection algorithm itself lives outside this crate. It plugs in by
//! implementing [`Detector`] and handing a [`DetectorFactory`] to
//! [`select_adapter`](super::select_adapter).

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{AdapterStatus, EventSender, SourceAdapter};
use crate::config::Policy;
use crate::error::{DetectorError, SourceError};
use crate::frame::{Event, Frame, StatsSnapshot};

/// A command recognised by the detector
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorCommand {
    pub action: String,
    pub parameters: Map<String, Value>,
}

/// Invoked by the detector, possibly from its own threads
pub type CommandCallback = Box<dyn Fn(DetectorCommand) + Send + Sync>;

/// Stats as reported by a detector. Fields it cannot provide are `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DetectorStats {
    pub fps: Option<f64>,
    pub gesture_count: Option<u64>,
    pub detection_count: Option<u64>,
    pub confidence: Option<f64>,
}

impl DetectorStats {
    /// Overwrite the fields that are present, keep the rest
    pub fn merge_into(&self, state: &mut StatsSnapshot) {
        if let Some(v) = self.fps {
            state.fps = v;
        }
        if let Some(v) = self.gesture_count {
            state.gesture_count = v;
        }
        if let Some(v) = self.detection_count {
            state.detection_count = v;
        }
        if let Some(v) = self.confidence {
            state.confidence = v;
        }
    }
}

/// Capabilities required from an external detector
pub trait Detector: Send {
    fn register_command_callback(&mut self, callback: CommandCallback) -> Result<(), DetectorError>;
    fn start(&mut self) -> Result<(), DetectorError>;
    fn stop(&mut self);
    /// Latest annotated frame, if any
    fn current_frame(&mut self) -> Result<Option<Frame>, DetectorError>;
    fn stats(&self) -> Result<DetectorStats, DetectorError>;
}

/// Builds a detector from the raw config document (`None` when the config
/// file was unreadable)
pub trait DetectorFactory: Send + Sync {
    fn name(&self) -> &str;
    fn build(&self, config: Option<&Value>) -> Result<Box<dyn Detector>, DetectorError>;
}

/// [`SourceAdapter`] over a [`Detector`]
pub struct DetectorAdapter {
    name: String,
    detector: Box<dyn Detector>,
    policy: Policy,
    started: bool,
    status: AdapterStatus,
    stats: StatsSnapshot,
    blank: Frame,
}

impl DetectorAdapter {
    pub fn new(name: impl Into<String>, detector: Box<dyn Detector>, policy: Policy) -> Self {
        let blank = Frame::blank(policy.frame_width, policy.frame_height);
        Self {
            name: name.into(),
            detector,
            policy,
            started: false,
            status: AdapterStatus::Ready,
            stats: StatsSnapshot::default(),
            blank,
        }
    }
}

impl SourceAdapter for DetectorAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&mut self, events: EventSender) -> Result<(), SourceError> {
        let callback: CommandCallback = Box::new(move |cmd: DetectorCommand| {
            debug!(action = %cmd.action, "Detector command");
            events.emit(Event::gesture(cmd.action, cmd.parameters));
        });
        self.detector.register_command_callback(callback)?;
        Ok(())
    }

    fn start(&mut self) -> Result<(), SourceError> {
        if self.started {
            return Err(SourceError::AlreadyStarted);
        }
        self.started = true;
        match self.detector.start() {
            Ok(()) => {
                info!("Detector {} started", self.name);
                self.status = AdapterStatus::Ready;
                Ok(())
            }
            Err(e) => {
                warn!("Detector {} failed to start, serving blank frames", self.name);
                self.status = AdapterStatus::Degraded;
                Err(e.into())
            }
        }
    }

    fn stop(&mut self) {
        if self.started {
            self.detector.stop();
            self.started = false;
            info!("Detector {} stopped", self.name);
        }
    }

    fn next_frame(&mut self) -> Option<Frame> {
        match self.status {
            AdapterStatus::Ready => match self.detector.current_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("Detector {} frame read failed: {}", self.name, e);
                    None
                }
            },
            AdapterStatus::Degraded => Some(self.blank.clone()),
        }
    }

    fn stats(&mut self) -> StatsSnapshot {
        if self.status == AdapterStatus::Ready {
            match self.detector.stats() {
                Ok(stats) => stats.merge_into(&mut self.stats),
                Err(e) => debug!("Detector {} stats read failed: {}", self.name, e),
            }
        }
        self.stats
    }

    fn status(&self) -> AdapterStatus {
        self.status
    }
}

impl std::fmt::Debug for DetectorAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorAdapter")
            .field("name", &self.name)
            .field("status", &self.status)
            .field("frame", &(self.policy.frame_width, self.policy.frame_height))
            .finish()
    }
}
