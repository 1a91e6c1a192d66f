//! Process-lifetime wiring: cell, hub, source and producer

use std::io;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::capture::{
    event_queue, select_adapter, CaptureBackend, DetectorFactory, EventReceiver, SourceAdapter,
};
use crate::config::{CaptureConfig, Policy};
use crate::hub::BroadcastHub;
use crate::producer::{Producer, ProducerHandle, ProducerMonitor};
use crate::state::SharedState;

/// The running capture pipeline.
///
/// Owns the producer thread; consumers get clones of the cell and hub.
/// Cancelling the token stops everything.
#[derive(Debug)]
pub struct Service {
    state: SharedState,
    hub: BroadcastHub,
    policy: Policy,
    cancel: CancellationToken,
    producer: ProducerHandle,
}

impl Service {
    /// Select the source (detector if `detector` builds, camera otherwise)
    /// and start producing.
    pub fn start(
        config: &CaptureConfig,
        detector: Option<&dyn DetectorFactory>,
        backends: Vec<Box<dyn CaptureBackend>>,
        cancel: CancellationToken,
    ) -> io::Result<Self> {
        let (events, events_rx) = event_queue();
        let adapter = select_adapter(detector, config, backends, events);
        Self::with_adapter(adapter, events_rx, config.policy.clone(), cancel)
    }

    /// Start producing from an already-built adapter. `events` must be the
    /// receiver paired with the sender the adapter was given.
    pub fn with_adapter(
        adapter: Box<dyn SourceAdapter>,
        events: EventReceiver,
        policy: Policy,
        cancel: CancellationToken,
    ) -> io::Result<Self> {
        let state = SharedState::new();
        let hub = BroadcastHub::new();
        let producer = Producer::spawn(
            adapter,
            events,
            state.clone(),
            hub.clone(),
            policy.clone(),
            cancel.child_token(),
        )?;
        info!(adapter = producer.adapter_name(), "Capture service started");

        Ok(Self {
            state,
            hub,
            policy,
            cancel,
            producer,
        })
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn producer(&self) -> ProducerMonitor {
        self.producer.monitor()
    }

    /// Context for the HTTP surface
    #[cfg(feature = "web")]
    pub fn web_context(&self) -> crate::web::WebContext {
        crate::web::WebContext {
            state: self.state.clone(),
            hub: self.hub.clone(),
            policy: self.policy.clone(),
            producer: self.producer.monitor(),
            cancel: self.cancel.clone(),
        }
    }

    /// Stop the producer and release the source. Blocks until the producer
    /// thread has exited; call from a blocking context.
    pub fn shutdown(self) {
        self.producer.shutdown();
        info!("Capture service stopped");
    }
}
