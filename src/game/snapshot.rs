//! Snapshot building

use std::collections::HashMap;

use tracing::warn;

use crate::ws::protocol::{PlayerSnapshot, ServerMessage, Snapshot};

use super::PlayerState;

/// Builds the per-tick full-state snapshot
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    /// Last timestamp sent, to catch a clock that stopped advancing
    last_server_time_ms: Option<f64>,
    /// Snapshots produced in the current match
    sent: u64,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the previous match's timeline
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Build one record per player, stamped with the tick-derived server time
    pub fn build<'a>(
        &mut self,
        tick: u64,
        server_time_ms: f64,
        players: impl IntoIterator<Item = &'a PlayerState>,
        now: u64,
    ) -> ServerMessage {
        if let Some(last) = self.last_server_time_ms {
            if server_time_ms <= last {
                warn!(last, server_time_ms, "Snapshot timestamp did not advance");
            }
        }
        self.last_server_time_ms = Some(server_time_ms);
        self.sent += 1;

        let players: HashMap<_, _> = players
            .into_iter()
            .map(|p| {
                let pose = p.pose;
                (
                    p.id,
                    PlayerSnapshot {
                        position: pose.position,
                        rotation: pose.rotation,
                        team: p.team,
                        carrying_flag: p.carrying_flag,
                        eliminated: p.life.is_eliminated(),
                        invincible: p.life.is_invincible(now),
                    },
                )
            })
            .collect();

        ServerMessage::Snapshot(Snapshot {
            tick,
            server_time_ms,
            players,
        })
    }
}
