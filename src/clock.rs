use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// A single reading of both clocks, taken together
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timestamp {
    /// Monotonic milliseconds; 0.0 means the monotonic source is unavailable
    pub monotonic_ms: f64,
    pub wall: DateTime<Utc>,
}

/// Start point that durations are measured from.
///
/// Monotonic time is preferred. When either side lacks a monotonic reading
/// the wall-clock difference is used instead, in the same unit.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Origin {
    pub monotonic_ms: f64,
    pub wall: Option<DateTime<Utc>>,
}

impl Origin {
    pub fn at(now: Timestamp) -> Self {
        Self {
            monotonic_ms: now.monotonic_ms,
            wall: Some(now.wall),
        }
    }

    pub fn is_set(&self) -> bool {
        self.monotonic_ms > 0.0 || self.wall.is_some()
    }

    /// Milliseconds from this origin to `now`, never negative
    pub fn elapsed_ms(&self, now: &Timestamp) -> f64 {
        let raw = if self.monotonic_ms > 0.0 && now.monotonic_ms > 0.0 {
            now.monotonic_ms - self.monotonic_ms
        } else if let Some(start) = self.wall {
            let diff = now.wall - start;
            diff.num_microseconds()
                .map_or(diff.num_milliseconds() as f64, |us| us as f64 / 1000.0)
        } else {
            0.0
        };
        raw.max(0.0)
    }
}

/// Source of time for every duration the engine computes
pub trait Clock: std::fmt::Debug + Send + Sync + 'static {
    fn now(&self) -> Timestamp;
}

/// Production clock.
///
/// The monotonic reading is an `Instant` offset from the wall clock at
/// construction, so readings taken by a later process stay comparable with
/// origins restored from a snapshot.
#[derive(Debug, Clone)]
pub struct SystemClock {
    anchor: Instant,
    anchor_ms: f64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
            anchor_ms: Utc::now().timestamp_millis() as f64,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp {
            monotonic_ms: self.anchor_ms + self.anchor.elapsed().as_secs_f64() * 1000.0,
            wall: Utc::now(),
        }
    }
}

#[derive(Debug)]
struct ManualState {
    monotonic_ms: f64,
    wall: DateTime<Utc>,
    monotonic_available: bool,
}

/// Hand-driven clock for tests and replays; clones share the same time
#[derive(Debug, Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    pub fn new(monotonic_ms: f64, wall: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                monotonic_ms,
                wall,
                monotonic_available: true,
            })),
        }
    }

    /// Advance both clocks by `ms` milliseconds
    pub fn advance(&self, ms: u64) {
        let mut state = self.state.lock();
        state.monotonic_ms += ms as f64;
        state.wall += ChronoDuration::milliseconds(ms as i64);
    }

    /// Simulate a host whose monotonic source is not ready yet
    pub fn set_monotonic_available(&self, available: bool) {
        self.state.lock().monotonic_available = available;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        let wall = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap_or_default();
        Self::new(1_000.0, wall)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        let state = self.state.lock();
        Timestamp {
            monotonic_ms: if state.monotonic_available {
                state.monotonic_ms
            } else {
                0.0
            },
            wall: state.wall,
        }
    }
}
