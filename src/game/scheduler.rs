//! Fixed-rate tick clock
//!
//! Converts the wall time between two ticks into a bounded number of fixed
//! physics sub-steps, and derives the server timestamp from the tick count so
//! snapshot times advance by exactly one interval per tick.

use crate::util::time::TICK_INTERVAL_MS;

/// Upper bound on physics sub-steps per tick; backlog beyond it is dropped
pub const MAX_SUBSTEPS: u32 = 5;

#[derive(Debug, Clone, Default)]
pub struct TickClock {
    /// Unsimulated wall time in milliseconds
    accumulator_ms: f64,
    last_tick_at: Option<u64>,
    /// Playing ticks since the match started
    match_tick: u64,
}

impl TickClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh match timeline
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Record that a tick happens at `now_ms` and return how many fixed
    /// `step_ms` physics steps must run to cover the elapsed time
    pub fn substeps(&mut self, now_ms: u64, step_ms: f64) -> u32 {
        // First tick of a timeline covers exactly one step
        let elapsed = match self.last_tick_at {
            Some(last) => now_ms.saturating_sub(last) as f64,
            None => step_ms,
        };
        self.last_tick_at = Some(now_ms);

        if step_ms <= 0.0 {
            return 0;
        }

        self.accumulator_ms += elapsed;
        let due = (self.accumulator_ms / step_ms).floor() as u64;
        if due > MAX_SUBSTEPS as u64 {
            // Spiral-of-death guard: simulate the cap and forget the rest
            self.accumulator_ms = 0.0;
            MAX_SUBSTEPS
        } else {
            self.accumulator_ms -= due as f64 * step_ms;
            due as u32
        }
    }

    /// Advance the match tick and return `(tick, server_time_ms)`
    pub fn next_server_time(&mut self) -> (u64, f64) {
        self.match_tick += 1;
        (self.match_tick, self.server_time_ms())
    }

    pub fn match_tick(&self) -> u64 {
        self.match_tick
    }

    pub fn server_time_ms(&self) -> f64 {
        self.match_tick as f64 * TICK_INTERVAL_MS
    }
}
