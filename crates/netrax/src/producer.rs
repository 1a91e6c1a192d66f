//! Producer loop: the single owner of the capture source
//!
//! Runs on its own OS thread because adapters do blocking I/O. Every tick it
//! polls the source, replaces the shared cell contents, and forwards queued
//! source events to the broadcast hub in arrival order.

use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::{AdapterStatus, EventReceiver, SourceAdapter};
use crate::config::Policy;
use crate::hub::BroadcastHub;
use crate::state::SharedState;

/// Lifecycle of the producer thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProducerState {
    Starting = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl ProducerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Starting,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ProducerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct SharedProducerState(AtomicU8);

impl SharedProducerState {
    fn get(&self) -> ProducerState {
        ProducerState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: ProducerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Marks the producer stopped however its thread exits, unwinding included
struct StoppedOnExit(Arc<SharedProducerState>);

impl Drop for StoppedOnExit {
    fn drop(&mut self) {
        self.0.set(ProducerState::Stopped);
    }
}

/// Spawns the producer thread
pub struct Producer {
    adapter: Box<dyn SourceAdapter>,
    events: EventReceiver,
    state: SharedState,
    hub: BroadcastHub,
    policy: Policy,
    cancel: CancellationToken,
    lifecycle: Arc<SharedProducerState>,
}

impl Producer {
    /// Start the producer thread. The adapter is moved onto it and started
    /// there; it is stopped again when `cancel` fires.
    pub fn spawn(
        adapter: Box<dyn SourceAdapter>,
        events: EventReceiver,
        state: SharedState,
        hub: BroadcastHub,
        policy: Policy,
        cancel: CancellationToken,
    ) -> io::Result<ProducerHandle> {
        let adapter_name = adapter.name().to_string();
        let lifecycle = Arc::new(SharedProducerState::default());
        let producer = Producer {
            adapter,
            events,
            state,
            hub,
            policy,
            cancel: cancel.clone(),
            lifecycle: Arc::clone(&lifecycle),
        };

        let thread = thread::Builder::new()
            .name("netrax-producer".into())
            .spawn(move || producer.run())?;

        Ok(ProducerHandle {
            monitor: ProducerMonitor {
                adapter_name: adapter_name.into(),
                lifecycle,
            },
            cancel,
            thread: Some(thread),
        })
    }

    fn run(mut self) {
        let _exit = StoppedOnExit(Arc::clone(&self.lifecycle));
        self.lifecycle.set(ProducerState::Starting);
        if let Err(e) = self.adapter.start() {
            warn!(adapter = self.adapter.name(), "Source start failed: {}", e);
        }
        self.lifecycle.set(ProducerState::Running);
        info!(
            adapter = self.adapter.name(),
            status = ?self.adapter.status(),
            "Producer running"
        );

        let mut ticks = 0u64;
        let mut failed_ticks = 0u64;
        while !self.cancel.is_cancelled() {
            let started = Instant::now();
            // a panicking source costs one tick, not the loop
            if panic::catch_unwind(AssertUnwindSafe(|| self.tick())).is_err() {
                failed_ticks += 1;
                error!(adapter = self.adapter.name(), failed_ticks, "Source panicked during tick");
            }
            ticks += 1;

            let interval = match self.adapter.status() {
                AdapterStatus::Ready => self.policy.poll_interval,
                AdapterStatus::Degraded => self.policy.degraded_interval,
            };
            let remaining = interval.saturating_sub(started.elapsed());
            if !remaining.is_zero() && !self.cancel.is_cancelled() {
                thread::sleep(remaining);
            }
        }

        self.lifecycle.set(ProducerState::Stopping);
        self.adapter.stop();
        // events raised after the last tick are still delivered
        self.forward_events();
        self.lifecycle.set(ProducerState::Stopped);
        info!(ticks, failed_ticks, "Producer stopped");
    }

    fn tick(&mut self) {
        let frame = self.adapter.next_frame();
        let stats = self.adapter.stats();
        match frame {
            Some(frame) => self.state.write(frame, stats),
            None => self.state.write_stats(stats),
        }
        self.forward_events();
    }

    fn forward_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            let delivered = self.hub.publish(&event);
            debug!(command = %event.command, delivered, "Event published");
        }
    }
}

/// Read-only view of the producer, cheap to clone into request handlers
#[derive(Debug, Clone)]
pub struct ProducerMonitor {
    adapter_name: Arc<str>,
    lifecycle: Arc<SharedProducerState>,
}

impl ProducerMonitor {
    pub fn state(&self) -> ProducerState {
        self.lifecycle.get()
    }

    /// Name of the source the producer owns
    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }
}

/// Handle to the running producer thread
pub struct ProducerHandle {
    monitor: ProducerMonitor,
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl ProducerHandle {
    pub fn state(&self) -> ProducerState {
        self.monitor.state()
    }

    pub fn adapter_name(&self) -> &str {
        self.monitor.adapter_name()
    }

    pub fn monitor(&self) -> ProducerMonitor {
        self.monitor.clone()
    }

    /// Request shutdown and wait for the thread to exit (blocking)
    pub fn shutdown(mut self) {
        self.cancel.cancel();
        self.join_thread();
    }

    fn join_thread(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Producer thread panicked");
            }
        }
    }
}

impl Drop for ProducerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.join_thread();
    }
}

impl fmt::Debug for ProducerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerHandle")
            .field("adapter", &self.adapter_name())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{event_queue, CameraAdapter, EventSender};
    use crate::error::SourceError;
    use crate::frame::{Event, Frame, StatsSnapshot};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn filled(value: u8) -> Frame {
        Frame::from_rgb(4, 4, vec![value; 4 * 4 * 3]).unwrap()
    }

    fn fast_policy() -> Policy {
        Policy {
            poll_interval: Duration::from_millis(2),
            degraded_interval: Duration::from_millis(5),
            ..Policy::default()
        }
    }

    /// Plays a fixed script of frames, then repeats the last entry
    struct Scripted {
        script: VecDeque<Option<Frame>>,
        last: Option<Frame>,
        events: Option<EventSender>,
        emit_on_tick: Option<usize>,
        panic_on_tick: Option<usize>,
        panic_on_start: bool,
        ticks: usize,
        stopped: Arc<AtomicBool>,
    }

    impl Scripted {
        fn new(script: Vec<Option<Frame>>) -> Self {
            Self {
                script: script.into(),
                last: None,
                events: None,
                emit_on_tick: None,
                panic_on_tick: None,
                panic_on_start: false,
                ticks: 0,
                stopped: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl SourceAdapter for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn on_event(&mut self, events: EventSender) -> Result<(), SourceError> {
            self.events = Some(events);
            Ok(())
        }

        fn start(&mut self) -> Result<(), SourceError> {
            if self.panic_on_start {
                panic!("source blew up on start");
            }
            Ok(())
        }

        fn stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        fn next_frame(&mut self) -> Option<Frame> {
            self.ticks += 1;
            if Some(self.ticks) == self.panic_on_tick {
                panic!("source blew up on tick {}", self.ticks);
            }
            if Some(self.ticks) == self.emit_on_tick {
                if let Some(events) = &self.events {
                    events.emit(Event::simulated());
                }
            }
            match self.script.pop_front() {
                Some(entry) => {
                    if entry.is_some() {
                        self.last = entry.clone();
                    }
                    entry
                }
                None => self.last.clone(),
            }
        }

        fn stats(&mut self) -> StatsSnapshot {
            StatsSnapshot {
                gesture_count: self.ticks as u64,
                ..Default::default()
            }
        }

        fn status(&self) -> AdapterStatus {
            AdapterStatus::Ready
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn latest_frame_wins_and_none_keeps_previous() {
        let adapter = Scripted::new(vec![Some(filled(1)), Some(filled(2)), None, Some(filled(2))]);
        let stopped = Arc::clone(&adapter.stopped);
        let state = SharedState::new();
        let (_events, rx) = event_queue();
        let cancel = CancellationToken::new();

        let handle = Producer::spawn(
            Box::new(adapter),
            rx,
            state.clone(),
            BroadcastHub::new(),
            fast_policy(),
            cancel.clone(),
        )
        .unwrap();

        let mut seen_two = false;
        wait_for(|| {
            if let Some(frame) = state.read_frame() {
                if frame == filled(2) {
                    seen_two = true;
                } else {
                    assert!(!seen_two, "saw F1 after F2");
                }
            }
            seen_two && state.read_stats().gesture_count > 4
        });
        assert_eq!(state.read_frame().unwrap(), filled(2));
        assert_eq!(handle.state(), ProducerState::Running);

        handle.shutdown();
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn events_reach_hub_subscribers() {
        let mut adapter = Scripted::new(vec![Some(filled(1))]);
        adapter.emit_on_tick = Some(3);
        let (events, rx) = event_queue();
        adapter.on_event(events).unwrap();

        let hub = BroadcastHub::new();
        let (_id, mut sub) = hub.subscribe_channel(8);
        let handle = Producer::spawn(
            Box::new(adapter),
            rx,
            SharedState::new(),
            hub.clone(),
            fast_policy(),
            CancellationToken::new(),
        )
        .unwrap();

        let mut received = None;
        wait_for(|| {
            if let Ok(event) = sub.try_recv() {
                received = Some(event);
            }
            received.is_some()
        });
        assert!(received.unwrap().is_simulated());
        assert_eq!(hub.stats().events_published, 1);
        drop(handle);
    }

    #[test]
    fn stops_within_one_interval() {
        let policy = Policy {
            poll_interval: Duration::from_millis(20),
            ..Policy::default()
        };
        let cancel = CancellationToken::new();
        let (_events, rx) = event_queue();
        let handle = Producer::spawn(
            Box::new(Scripted::new(vec![Some(filled(1))])),
            rx,
            SharedState::new(),
            BroadcastHub::new(),
            policy,
            cancel.clone(),
        )
        .unwrap();
        wait_for(|| handle.state() == ProducerState::Running);

        let requested = Instant::now();
        cancel.cancel();
        wait_for(|| handle.state() == ProducerState::Stopped);
        // one interval plus scheduling slack
        assert!(requested.elapsed() < Duration::from_millis(500));
        handle.shutdown();
    }

    #[test]
    fn degraded_camera_serves_blank_frames() {
        let state = SharedState::new();
        let (events, rx) = event_queue();
        let mut camera = CameraAdapter::new(0, fast_policy(), vec![]);
        camera.on_event(events).unwrap();

        let handle = Producer::spawn(
            Box::new(camera),
            rx,
            state.clone(),
            BroadcastHub::new(),
            fast_policy(),
            CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(handle.adapter_name(), "camera");

        wait_for(|| state.generation() >= 3);
        let frame = state.read_frame().unwrap();
        assert_eq!((frame.width(), frame.height(), frame.channels()), (640, 480, 3));
        assert!(frame.is_blank());
        assert_eq!(handle.state(), ProducerState::Running);
        handle.shutdown();
    }

    #[test]
    fn panicking_tick_does_not_stop_the_loop() {
        let mut adapter = Scripted::new(vec![Some(filled(1)), Some(filled(2)), Some(filled(3))]);
        adapter.panic_on_tick = Some(4);
        let state = SharedState::new();
        let (_events, rx) = event_queue();
        let handle = Producer::spawn(
            Box::new(adapter),
            rx,
            state.clone(),
            BroadcastHub::new(),
            fast_policy(),
            CancellationToken::new(),
        )
        .unwrap();

        // frames keep being written after the failed tick
        wait_for(|| state.generation() > 10);
        assert_eq!(state.read_frame().unwrap(), filled(3));
        assert_eq!(handle.state(), ProducerState::Running);

        let monitor = handle.monitor();
        handle.shutdown();
        assert_eq!(monitor.state(), ProducerState::Stopped);
    }

    #[test]
    fn thread_death_is_reported_as_stopped() {
        let mut adapter = Scripted::new(vec![Some(filled(1))]);
        adapter.panic_on_start = true;
        let (_events, rx) = event_queue();
        let handle = Producer::spawn(
            Box::new(adapter),
            rx,
            SharedState::new(),
            BroadcastHub::new(),
            fast_policy(),
            CancellationToken::new(),
        )
        .unwrap();

        wait_for(|| handle.state() == ProducerState::Stopped);
        handle.shutdown();
    }

    #[test]
    fn degraded_source_ticks_at_fallback_cadence() {
        let policy = Policy {
            poll_interval: Duration::from_millis(2),
            degraded_interval: Duration::from_millis(50),
            ..Policy::default()
        };
        let state = SharedState::new();
        let (_events, rx) = event_queue();
        let handle = Producer::spawn(
            Box::new(CameraAdapter::new(0, policy.clone(), vec![])),
            rx,
            state.clone(),
            BroadcastHub::new(),
            policy,
            CancellationToken::new(),
        )
        .unwrap();

        thread::sleep(Duration::from_secs(1));
        let writes = state.generation();
        handle.shutdown();

        // ~20 at 50 ms; the 2 ms poll interval would give hundreds
        assert!((5..=30).contains(&writes), "{writes} writes in 1s");
    }
}
