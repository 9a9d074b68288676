//! Time utilities for the authoritative simulation

use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Simulation rate
pub const SIMULATION_TPS: u32 = 60;

/// Fixed tick interval in milliseconds (1000 / 60)
pub const TICK_INTERVAL_MS: f64 = 1000.0 / SIMULATION_TPS as f64;

/// Fixed tick interval as a `Duration`
pub const TICK_DURATION: Duration = Duration::from_micros(1_000_000 / SIMULATION_TPS as u64);

/// Server start time for uptime tracking
static SERVER_START: OnceLock<Instant> = OnceLock::new();

/// Initialize server start time (call once at startup)
pub fn init_server_time() {
    SERVER_START.get_or_init(Instant::now);
}

/// Get server uptime in seconds
pub fn uptime_secs() -> u64 {
    SERVER_START
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

/// Get current Unix timestamp in milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Fixed physics delta time in seconds
pub fn tick_delta() -> f32 {
    1.0 / SIMULATION_TPS as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_interval_matches_rate() {
        assert!((TICK_INTERVAL_MS * SIMULATION_TPS as f64 - 1000.0).abs() < 1e-9);
        assert_eq!(TICK_DURATION.as_micros(), 16_666);
    }

    #[test]
    fn tick_delta_is_one_interval() {
        assert!((tick_delta() as f64 * 1000.0 - TICK_INTERVAL_MS).abs() < 1e-3);
    }
}
