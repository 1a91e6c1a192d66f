//! WebSocket handler: periodic stats plus hub events, as JSON text frames.
//!
//! Server → client messages:
//!   `{"type":"stats","timestamp":..,"stats":{..},"cpu":..}`  every stats interval
//!   `{"type":"gesture_command","timestamp":..,"command":..,"parameters":{..}}`  on occurrence

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::capture::CpuMonitor;
use crate::frame::{unix_timestamp, StatsSnapshot};
use crate::hub::BroadcastHub;
use crate::state::SharedState;

/// Events buffered per connection before the hub gives up on it
const EVENT_QUEUE_CAPACITY: usize = 64;

/// Periodic stats message
#[derive(Debug, Clone, Serialize)]
pub struct StatsMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub timestamp: f64,
    pub stats: StatsSnapshot,
    /// Host CPU usage in percent
    pub cpu: f32,
}

/// Builds stats messages for one connection from the cell and host CPU
pub struct StatsPublisher {
    state: SharedState,
    cpu: Option<CpuMonitor>,
    last_cpu: f32,
}

impl StatsPublisher {
    pub fn new(state: SharedState) -> Self {
        Self::with_monitor(state, CpuMonitor::new())
    }

    pub fn with_monitor(state: SharedState, cpu: CpuMonitor) -> Self {
        Self {
            state,
            cpu: Some(cpu),
            last_cpu: 0.0,
        }
    }

    pub async fn message(&mut self) -> StatsMessage {
        if let Some(mut monitor) = self.cpu.take() {
            match tokio::task::spawn_blocking(move || {
                let cpu = monitor.sample();
                (monitor, cpu)
            })
            .await
            {
                Ok((monitor, cpu)) => {
                    self.cpu = Some(monitor);
                    self.last_cpu = cpu;
                }
                Err(e) => warn!("CPU sampling task failed: {}", e),
            }
        }

        StatsMessage {
            kind: "stats",
            timestamp: unix_timestamp(),
            stats: self.state.read_stats(),
            cpu: self.last_cpu,
        }
    }
}

/// Handle a single WebSocket connection until the client leaves, a send
/// fails, or shutdown.
pub async fn handle_ws(
    socket: WebSocket,
    state: SharedState,
    hub: BroadcastHub,
    stats_interval: Duration,
    cancel: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (id, mut events) = hub.subscribe_channel(EVENT_QUEUE_CAPACITY);
    debug!(subscriber = %id, "WebSocket client connected");

    let mut publisher = StatsPublisher::new(state);
    let mut ticker = tokio::time::interval(stats_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut subscribed = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
            _ = ticker.tick() => {
                let msg = publisher.message().await;
                match serde_json::to_string(&msg) {
                    Ok(text) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to serialise stats: {}", e),
                }
            }
            // Forward hub events
            event = events.recv(), if subscribed => {
                match event {
                    Some(event) => match serde_json::to_string(&event) {
                        Ok(text) => {
                            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Failed to serialise event: {}", e),
                    },
                    None => {
                        // dropped by the hub; stats keep flowing
                        debug!(subscriber = %id, "Event subscription dropped");
                        subscribed = false;
                    }
                }
            }
            // Handle incoming messages from client (ping/pong, close)
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Err(_)) => break,
                    _ => {} // text/binary from clients is ignored
                }
            }
        }
    }

    hub.unsubscribe(id);
    debug!(subscriber = %id, "WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    #[tokio::test]
    async fn stats_message_shape() {
        let state = SharedState::new();
        state.write(
            Frame::blank(2, 2),
            StatsSnapshot {
                fps: 29.5,
                gesture_count: 3,
                detection_count: 1,
                confidence: 0.9,
            },
        );
        let mut publisher = StatsPublisher::with_monitor(
            state,
            CpuMonitor::with_path("/nonexistent/proc/stat"),
        );

        let msg = publisher.message().await;
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "stats");
        assert!(json["timestamp"].as_f64().unwrap() > 0.0);
        assert_eq!(json["stats"]["fps"], 29.5);
        assert_eq!(json["stats"]["gesture_count"], 3);
        assert_eq!(json["stats"]["detection_count"], 1);
        assert_eq!(json["stats"]["confidence"], 0.9);
        assert_eq!(json["cpu"], 0.0);
    }
}
