//! Value types shared between the producer and its consumers

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default capture width in pixels
pub const DEFAULT_WIDTH: u32 = 640;

/// Default capture height in pixels
pub const DEFAULT_HEIGHT: u32 = 480;

/// Bytes per pixel (packed 8-bit RGB)
pub const CHANNELS: usize = 3;

/// Event kind carried by every command event on the wire
pub const GESTURE_COMMAND: &str = "gesture_command";

/// Command name used for events synthesised by the camera adapter
pub const SIMULATED_GESTURE: &str = "simulated_gesture";

/// A packed RGB8 bitmap.
///
/// Pixel storage is immutable and reference counted, so cloning a frame out
/// of the shared cell is a snapshot and never copies pixel data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    pixels: Bytes,
}

impl Frame {
    /// Wrap raw RGB8 pixels. Returns `None` if the buffer length does not
    /// match `width * height * 3`.
    pub fn from_rgb(width: u32, height: u32, pixels: impl Into<Bytes>) -> Option<Self> {
        let pixels = pixels.into();
        if pixels.len() != width as usize * height as usize * CHANNELS {
            return None;
        }
        Some(Self {
            width,
            height,
            pixels,
        })
    }

    /// All-black frame of the given size
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: Bytes::from(vec![0u8; width as usize * height as usize * CHANNELS]),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> usize {
        CHANNELS
    }

    /// Row-major RGB8 pixel data
    pub fn pixels(&self) -> &Bytes {
        &self.pixels
    }

    /// True if every byte of the frame is zero
    pub fn is_blank(&self) -> bool {
        self.pixels.iter().all(|&b| b == 0)
    }
}

/// Statistics reported by the capture source.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Frames per second, recomputed over the last measurement window
    pub fps: f64,
    pub gesture_count: u64,
    pub detection_count: u64,
    /// Confidence of the most recent detection (0.0 - 1.0)
    pub confidence: f64,
}

/// A discrete event raised by the capture source.
///
/// Serialises as `{"type": .., "timestamp": .., "command": .., "parameters": {..}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    /// Seconds since the unix epoch
    pub timestamp: f64,
    pub command: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl Event {
    /// A `gesture_command` event stamped with the current time
    pub fn gesture(command: impl Into<String>, parameters: Map<String, Value>) -> Self {
        Self {
            kind: GESTURE_COMMAND.to_string(),
            timestamp: unix_timestamp(),
            command: command.into(),
            parameters,
        }
    }

    /// The event the camera adapter emits in place of real gesture detection
    pub fn simulated() -> Self {
        Self::gesture(SIMULATED_GESTURE, Map::new())
    }

    pub fn is_simulated(&self) -> bool {
        self.command == SIMULATED_GESTURE
    }
}

/// Current wall-clock time as fractional unix seconds
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
