//! Error types, one per boundary where a failure is absorbed.
//!
//! None of these terminate the process: each is handled where it occurs
//! (degrade, fall back, drop a subscriber, use defaults, skip a tick).

use std::path::PathBuf;

use thiserror::Error;

/// Failure of a capture source as seen by the producer
#[derive(Debug, Error)]
pub enum SourceError {
    /// No capture backend could open the device. The adapter keeps running
    /// in degraded mode.
    #[error("no capture backend could open device {device} (tried: {})", tried.join(", "))]
    Unavailable {
        device: u32,
        tried: Vec<&'static str>,
    },

    #[error("source already started")]
    AlreadyStarted,

    #[error(transparent)]
    Detector(#[from] DetectorError),
}

/// The external detector could not be built, wired up or started.
/// Selection falls back to the camera adapter on any of these.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("detector construction failed: {0}")]
    Construction(String),

    #[error("command callback registration failed: {0}")]
    Registration(String),

    #[error("detector failed to start: {0}")]
    Start(String),

    /// A single frame or stats read failed; the next tick tries again
    #[error("detector read failed: {0}")]
    Read(String),
}

/// Failure of a single capture backend or device
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("device error: {0}")]
    Device(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("decode error: {0}")]
    Decode(#[from] image::ImageError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// A subscriber could not accept an event. The hub drops that subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("subscriber transport closed")]
    Closed,

    #[error("subscriber queue full")]
    Full,
}

/// The configuration file could not be used. Defaults apply.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path:?}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config {path:?}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A frame could not be compressed. The encoder skips the tick.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("jpeg encode failed: {0}")]
    Jpeg(#[from] image::ImageError),

    #[error("encoder task failed: {0}")]
    Task(String),
}
