// src/speed.rs

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Smoothed transfer speed over a rolling window of
/// `(time, cumulative bytes)` samples.
#[derive(Debug)]
pub struct SpeedTracker {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// Records the cumulative byte count seen at `now`.
    pub fn record(&mut self, now: Instant, total_bytes: u64) {
        self.samples.push_back((now, total_bytes));
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes per second across the window; 0 until two samples span time.
    pub fn speed(&self) -> f64 {
        let (Some(&(t0, b0)), Some(&(t1, b1))) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let span = t1.duration_since(t0).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        b1.saturating_sub(b0) as f64 / span
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

/// Seconds left at `speed`, or `None` when it cannot be estimated.
pub fn eta_seconds(remaining_bytes: Option<u64>, speed: f64) -> Option<u64> {
    let remaining = remaining_bytes?;
    if speed <= 0.0 || !speed.is_finite() {
        return None;
    }
    Some((remaining as f64 / speed).ceil() as u64)
}
