//! Host CPU utilisation from `/proc/stat`

use std::fs;
use std::path::PathBuf;

use tracing::debug;

/// Raw CPU stats from /proc/stat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuStats {
    user: u64,
    nice: u64,
    system: u64,
    idle: u64,
    iowait: u64,
    irq: u64,
    softirq: u64,
}

impl CpuStats {
    fn total(&self) -> u64 {
        self.user + self.nice + self.system + self.idle + self.iowait + self.irq + self.softirq
    }

    fn idle_total(&self) -> u64 {
        self.idle + self.iowait
    }
}

/// Parse the aggregate `cpu ` line
fn parse_cpu_stats(content: &str) -> Option<CpuStats> {
    let cpu_line = content.lines().find(|line| line.starts_with("cpu "))?;

    let parts: Vec<u64> = cpu_line
        .split_whitespace()
        .skip(1)
        .take(7)
        .filter_map(|s| s.parse().ok())
        .collect();

    if parts.len() < 7 {
        return None;
    }

    Some(CpuStats {
        user: parts[0],
        nice: parts[1],
        system: parts[2],
        idle: parts[3],
        iowait: parts[4],
        irq: parts[5],
        softirq: parts[6],
    })
}

/// CPU usage in percent between two samples, if any time passed
fn usage_between(prev: &CpuStats, now: &CpuStats) -> Option<f32> {
    let total_delta = now.total().saturating_sub(prev.total());
    let idle_delta = now.idle_total().saturating_sub(prev.idle_total());
    if total_delta == 0 {
        return None;
    }
    let busy = total_delta - idle_delta.min(total_delta);
    Some((busy as f32 / total_delta as f32) * 100.0)
}

/// Tracks CPU usage between successive samples.
///
/// One per stats publisher. The first sample reads 0; a failed read keeps
/// the last value.
#[derive(Debug)]
pub struct CpuMonitor {
    path: PathBuf,
    prev: Option<CpuStats>,
    last: f32,
}

impl Default for CpuMonitor {
    fn default() -> Self {
        Self::with_path("/proc/stat")
    }
}

impl CpuMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            prev: None,
            last: 0.0,
        }
    }

    /// Current CPU usage (0-100)
    pub fn sample(&mut self) -> f32 {
        let stats = match fs::read_to_string(&self.path) {
            Ok(content) => parse_cpu_stats(&content),
            Err(e) => {
                debug!("Failed to read {}: {}", self.path.display(), e);
                None
            }
        };

        if let Some(now) = stats {
            if let Some(usage) = self.prev.as_ref().and_then(|prev| usage_between(prev, &now)) {
                self.last = usage;
            }
            self.prev = Some(now);
        }
        self.last
    }
}
