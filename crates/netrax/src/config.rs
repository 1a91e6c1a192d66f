//! Capture configuration loaded from a JSON file
//!
//! The file supplies the camera device id and, optionally, any of the
//! [`Policy`] constants:
//!
//! ```json
//! { "camera_id": 1, "poll_interval_ms": 20, "simulated_event_probability": 0.005 }
//! ```
//!
//! Unknown keys are kept in [`CaptureConfig::raw`] so a detector factory can
//! read its own section from the same document.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::frame::{DEFAULT_HEIGHT, DEFAULT_WIDTH};

/// Default location of the capture config file
pub const DEFAULT_CONFIG_PATH: &str = "config/body_detection_config.json";

/// Device id used when the config file does not name one
pub const DEFAULT_CAMERA_ID: u32 = 0;

/// Largest capture size accepted from the file (4K UHD)
pub const MAX_FRAME_WIDTH: u32 = 3840;
pub const MAX_FRAME_HEIGHT: u32 = 2160;

/// Tunable cadences and probabilities.
///
/// These are policy, not protocol: changing them alters pacing only.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    /// Producer poll interval while the source is healthy
    pub poll_interval: Duration,
    /// Producer poll interval while the source is degraded (blank frames)
    pub degraded_interval: Duration,
    /// Delay between MJPEG parts sent to one viewer
    pub stream_interval: Duration,
    /// Delay between stats messages sent to one subscriber
    pub stats_interval: Duration,
    /// JPEG quality for the MJPEG stream (1-100)
    pub jpeg_quality: u8,
    /// Chance per delivered camera frame of a simulated gesture event
    pub simulated_event_probability: f64,
    /// Requested capture size, also the size of blank frames
    pub frame_width: u32,
    pub frame_height: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(20),
            degraded_interval: Duration::from_millis(50),
            stream_interval: Duration::from_millis(30),
            stats_interval: Duration::from_millis(500),
            jpeg_quality: 80,
            simulated_event_probability: 0.005,
            frame_width: DEFAULT_WIDTH,
            frame_height: DEFAULT_HEIGHT,
        }
    }
}

/// Everything the capture side needs from the config file
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    pub camera_id: u32,
    pub policy: Policy,
    /// The parsed document, if the file was readable
    pub raw: Option<Value>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            camera_id: DEFAULT_CAMERA_ID,
            policy: Policy::default(),
            raw: None,
        }
    }
}

/// On-disk shape. Every field is optional.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    camera_id: Option<u32>,
    poll_interval_ms: Option<u64>,
    degraded_interval_ms: Option<u64>,
    stream_interval_ms: Option<u64>,
    stats_interval_ms: Option<u64>,
    jpeg_quality: Option<u8>,
    simulated_event_probability: Option<f64>,
    frame_width: Option<u32>,
    frame_height: Option<u32>,
}

impl CaptureConfig {
    /// Load and validate the config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Malformed {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the config file, falling back to defaults if it is missing or
    /// malformed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => {
                info!(path = %path.display(), camera_id = config.camera_id, "Loaded capture config");
                config
            }
            Err(ConfigError::Unreadable { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                info!(path = %path.display(), "No capture config, using defaults");
                Self::default()
            }
            Err(e) => {
                warn!("{}. Using defaults.", e);
                Self::default()
            }
        }
    }

    fn parse(content: &str) -> Result<Self, serde_json::Error> {
        let raw: Value = serde_json::from_str(content)?;
        let file = FileConfig::deserialize(&raw)?;
        let mut policy = Policy::default();

        let ms = Duration::from_millis;
        if let Some(v) = file.poll_interval_ms.filter(|&v| v > 0) {
            policy.poll_interval = ms(v);
        }
        if let Some(v) = file.degraded_interval_ms.filter(|&v| v > 0) {
            policy.degraded_interval = ms(v);
        }
        if let Some(v) = file.stream_interval_ms.filter(|&v| v > 0) {
            policy.stream_interval = ms(v);
        }
        if let Some(v) = file.stats_interval_ms.filter(|&v| v > 0) {
            policy.stats_interval = ms(v);
        }
        if let Some(v) = file.jpeg_quality {
            policy.jpeg_quality = v.clamp(1, 100);
        }
        if let Some(v) = file.simulated_event_probability {
            policy.simulated_event_probability = v.clamp(0.0, 1.0);
        }
        if let Some(v) = file.frame_width.filter(|&v| v > 0) {
            policy.frame_width = clamp_dimension("frame_width", v, MAX_FRAME_WIDTH);
        }
        if let Some(v) = file.frame_height.filter(|&v| v > 0) {
            policy.frame_height = clamp_dimension("frame_height", v, MAX_FRAME_HEIGHT);
        }

        Ok(Self {
            camera_id: file.camera_id.unwrap_or(DEFAULT_CAMERA_ID),
            policy,
            raw: Some(raw),
        })
    }
}

fn clamp_dimension(key: &str, value: u32, max: u32) -> u32 {
    if value > max {
        warn!("{} = {} exceeds {}, clamping", key, value, max);
        max
    } else {
        value
    }
}

/// Resolve the config path from `NETRAX_CONFIG_PATH`, or the default
pub fn config_path_from_env() -> PathBuf {
    std::env::var("NETRAX_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}
