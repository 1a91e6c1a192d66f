//! netrax - live camera acquisition with MJPEG and WebSocket fan-out
//!
//! One producer thread pulls frames and stats from a capture source and
//! publishes them; any number of consumers read them concurrently:
//!
//! - **Core** (always available): frames, stats, events, the shared latest-value
//!   cell, the event hub, capture sources and the producer loop
//! - **`web`**: axum HTTP server with `/video_feed` (MJPEG), `/ws` and `/api/status`
//! - **`v4l2`**: Video4Linux2 capture backend

mod error;
mod frame;

pub mod capture;
pub mod config;
pub mod hub;
pub mod producer;
pub mod service;
pub mod state;

pub use error::{CaptureError, ConfigError, DeliveryError, DetectorError, EncodeError, SourceError};
pub use frame::{
    unix_timestamp, Event, Frame, StatsSnapshot, CHANNELS, DEFAULT_HEIGHT, DEFAULT_WIDTH,
    GESTURE_COMMAND, SIMULATED_GESTURE,
};

pub use config::{CaptureConfig, Policy};
pub use hub::{BroadcastHub, EventSink, HubStats, SubscriberId};
pub use producer::{Producer, ProducerHandle, ProducerMonitor, ProducerState};
pub use service::Service;
pub use state::SharedState;

// Web: axum HTTP server, MJPEG encoder, WebSocket stats
#[cfg(feature = "web")]
pub mod web;
