//! Elimination, respawn and invincibility timing
//!
//! Pure timestamp state; the tick loop polls it instead of scheduling
//! callbacks. Invincibility is informational only and does not gate
//! elimination.

/// Per-player life cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifeState {
    eliminated: bool,
    respawn_deadline: Option<u64>,
    invincible_until: Option<u64>,
}

impl LifeState {
    pub fn is_eliminated(&self) -> bool {
        self.eliminated
    }

    pub fn respawn_deadline(&self) -> Option<u64> {
        self.respawn_deadline
    }

    /// Mark eliminated; returns false if the player already was
    pub fn eliminate(&mut self, now: u64, respawn_delay_ms: u64) -> bool {
        if self.eliminated {
            return false;
        }
        self.eliminated = true;
        self.respawn_deadline = Some(now.saturating_add(respawn_delay_ms));
        true
    }

    /// Eliminated and strictly past the deadline
    pub fn respawn_due(&self, now: u64) -> bool {
        self.eliminated && self.respawn_deadline.is_some_and(|deadline| now > deadline)
    }

    /// Back in play with a fresh invincibility window
    pub fn revive(&mut self, now: u64, invincibility_ms: u64) {
        self.eliminated = false;
        self.respawn_deadline = None;
        self.invincible_until = Some(now.saturating_add(invincibility_ms));
    }

    pub fn is_invincible(&self, now: u64) -> bool {
        !self.eliminated && self.invincible_until.is_some_and(|until| now < until)
    }
}

/// Whether a vehicle at height `y` has fallen out of the arena
pub fn has_fallen(y: f32, death_y: f32) -> bool {
    y < death_y
}
