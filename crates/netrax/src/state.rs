//! Latest-value cell shared between the producer and every consumer

use std::sync::{Arc, PoisonError, RwLock};

use crate::frame::{Frame, StatsSnapshot};

/// Contents of the cell at one point in time
#[derive(Debug, Clone, Default)]
struct Latest {
    frame: Option<Frame>,
    stats: StatsSnapshot,
    /// Incremented on every frame write; 0 means "no frame yet"
    generation: u64,
}

/// Single-slot holder of the most recent frame and stats.
///
/// One writer (the producer) replaces the contents wholesale; any number of
/// readers take snapshots. The lock only guards a pointer swap and a few
/// scalars: frames are reference counted, so neither side copies pixels or
/// does I/O while holding it.
#[derive(Clone, Default)]
pub struct SharedState {
    inner: Arc<RwLock<Latest>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace both frame and stats in one critical section
    pub fn write(&self, frame: Frame, stats: StatsSnapshot) {
        let mut latest = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        latest.frame = Some(frame);
        latest.stats = stats;
        latest.generation += 1;
    }

    /// Replace stats only, keeping the current frame
    pub fn write_stats(&self, stats: StatsSnapshot) {
        let mut latest = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        latest.stats = stats;
    }

    /// Snapshot of the current frame, or `None` before the first write
    pub fn read_frame(&self) -> Option<Frame> {
        self.read_frame_versioned().map(|(frame, _)| frame)
    }

    /// Current frame together with its write generation
    pub fn read_frame_versioned(&self) -> Option<(Frame, u64)> {
        let latest = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        latest.frame.clone().map(|f| (f, latest.generation))
    }

    /// Snapshot of the current stats
    pub fn read_stats(&self) -> StatsSnapshot {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).stats
    }

    /// Number of frame writes so far
    pub fn generation(&self) -> u64 {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).generation
    }
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState")
            .field("generation", &self.generation())
            .finish()
    }
}
