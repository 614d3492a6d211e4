//! Decayed load, runnable and utilization averages.
//!
//! Each average is a continuous exponential moving average with a
//! configurable half-life: over an interval of `elapsed` ns the previous
//! value decays by `0.5^(elapsed / half_life)` and the signal observed
//! during the interval fills the rest. The signal is assumed constant over
//! the interval, so callers update the tracker *before* changing the state
//! it observes.
//!
//! Entities and run-queues both carry a tracker. Per-CPU results are
//! published into a [`LoadSnapshot`] that load-balancing code can read
//! without holding the scheduler lock.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::warn;

use crate::types::TimeNs;

/// Fixed-point scale of the runnable and utilization signals: 1024 means
/// "runnable (or running) the whole time".
pub const SCHED_CAPACITY_SCALE: u64 = 1024;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AvgTracker {
    last_update: TimeNs,
    load: f64,
    runnable: f64,
    util: f64,
}

impl AvgTracker {
    pub fn new(now: TimeNs) -> Self {
        Self {
            last_update: now,
            ..Default::default()
        }
    }

    /// Start a new task's load at its full weight so that freshly created
    /// tasks are not mistaken for idle ones by load balancing.
    pub fn new_task(now: TimeNs, weight: u64) -> Self {
        Self {
            last_update: now,
            load: weight as f64,
            ..Default::default()
        }
    }

    /// Fold the interval `[last_update, now)` into the averages.
    ///
    /// `weight` is the load contributed while runnable. Returns whether any
    /// time elapsed. A clock that moved backward leaves the tracker as is.
    pub fn update(
        &mut self,
        now: TimeNs,
        half_life: TimeNs,
        weight: u64,
        runnable: bool,
        running: bool,
    ) -> bool {
        if now < self.last_update {
            warn!(
                now,
                last_update = self.last_update,
                "avg clock went backward, ignoring"
            );
            return false;
        }
        let elapsed = now - self.last_update;
        if elapsed == 0 {
            return false;
        }
        let decay = 0.5f64.powf(elapsed as f64 / half_life.max(1) as f64);
        let fill = 1.0 - decay;
        let signal = |on: bool, value: f64| if on { value * fill } else { 0.0 };
        let scale = SCHED_CAPACITY_SCALE as f64;

        self.load = self.load * decay + signal(runnable, weight as f64);
        self.runnable = self.runnable * decay + signal(runnable, scale);
        self.util = self.util * decay + signal(running, scale);
        self.last_update = now;
        true
    }

    /// Re-anchor on another clock (after a cross-CPU migration) without
    /// decaying the history.
    pub fn rebase(&mut self, now: TimeNs) {
        self.last_update = now;
    }

    pub fn last_update(&self) -> TimeNs {
        self.last_update
    }

    pub fn load_avg(&self) -> u64 {
        self.load.round() as u64
    }

    pub fn runnable_avg(&self) -> u64 {
        self.runnable.round() as u64
    }

    pub fn util_avg(&self) -> u64 {
        self.util.round() as u64
    }
}

/// Point-in-time copy of a CPU's published averages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadSample {
    pub load_avg: u64,
    pub runnable_avg: u64,
    pub util_avg: u64,
    pub nr_running: u64,
    pub updated_at: TimeNs,
}

/// Lock-free publication point for one CPU's load.
///
/// The owning scheduler stores with relaxed ordering after each clock
/// advance and context switch; readers may observe a mix of two
/// consecutive samples, which load balancing tolerates.
#[derive(Debug, Default)]
pub struct LoadSnapshot {
    load_avg: AtomicU64,
    runnable_avg: AtomicU64,
    util_avg: AtomicU64,
    nr_running: AtomicU64,
    updated_at: AtomicU64,
}

impl LoadSnapshot {
    pub fn publish(&self, sample: LoadSample) {
        self.load_avg.store(sample.load_avg, Ordering::Relaxed);
        self.runnable_avg
            .store(sample.runnable_avg, Ordering::Relaxed);
        self.util_avg.store(sample.util_avg, Ordering::Relaxed);
        self.nr_running.store(sample.nr_running, Ordering::Relaxed);
        self.updated_at.store(sample.updated_at, Ordering::Relaxed);
    }

    pub fn read(&self) -> LoadSample {
        LoadSample {
            load_avg: self.load_avg.load(Ordering::Relaxed),
            runnable_avg: self.runnable_avg.load(Ordering::Relaxed),
            util_avg: self.util_avg.load(Ordering::Relaxed),
            nr_running: self.nr_running.load(Ordering::Relaxed),
            updated_at: self.updated_at.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HL: TimeNs = 32_000_000;

    #[test]
    fn test_half_life() {
        let mut avg = AvgTracker::new(0);
        // Saturate.
        assert!(avg.update(100 * HL, HL, 1024, true, true));
        assert_eq!(avg.load_avg(), 1024);
        assert_eq!(avg.util_avg(), 1024);

        // One half-life idle halves everything.
        avg.update(101 * HL, HL, 1024, false, false);
        assert_eq!(avg.load_avg(), 512);
        assert_eq!(avg.runnable_avg(), 512);
        assert_eq!(avg.util_avg(), 512);
    }

    #[test]
    fn test_runnable_but_waiting() {
        let mut avg = AvgTracker::new(0);
        avg.update(HL, HL, 2048, true, false);
        assert_eq!(avg.load_avg(), 1024);
        assert_eq!(avg.runnable_avg(), 512);
        assert_eq!(avg.util_avg(), 0);
    }

    #[test]
    fn test_backward_clock_is_noop() {
        let mut avg = AvgTracker::new_task(1_000, 1024);
        assert!(!avg.update(500, HL, 1024, false, false));
        assert!(!avg.update(1_000, HL, 1024, false, false));
        assert_eq!(avg.load_avg(), 1024);
        assert_eq!(avg.last_update(), 1_000);
    }

    #[test]
    fn test_snapshot_publish() {
        let snap = LoadSnapshot::default();
        assert_eq!(snap.read(), LoadSample::default());
        let sample = LoadSample {
            load_avg: 3,
            runnable_avg: 4,
            util_avg: 5,
            nr_running: 6,
            updated_at: 7,
        };
        snap.publish(sample);
        assert_eq!(snap.read(), sample);
    }
}
