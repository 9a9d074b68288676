//! Game simulation modules

pub mod elimination;
pub mod flag;
pub mod map;
pub mod r#match;
pub mod physics;
pub mod scheduler;
pub mod snapshot;
pub mod vehicle;

pub use r#match::{GameMatch, MatchContext, MatchHandle, MatchStatus, Outbound, PeerRegistry, PlayerState};

use std::sync::Arc;

use dashmap::DashMap;

use crate::ws::protocol::{ClientMessage, PlayerId};
use vehicle::InputCommand;

/// Latest input per player, written by connections and read every tick.
///
/// Last write wins; an entry persists until overwritten so a quiet client
/// keeps driving with its previous command.
pub type CommandBuffer = Arc<DashMap<PlayerId, InputCommand>>;

/// Transport event queued for the match task
#[derive(Debug, Clone)]
pub enum MatchEvent {
    Connected { player_id: PlayerId },
    Message { player_id: PlayerId, msg: ClientMessage },
    Disconnected { player_id: PlayerId },
}
