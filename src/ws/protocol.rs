//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use std::collections::HashMap;

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::map::MapData;

/// Opaque per-connection identity; also the player's id for the session
pub type PlayerId = Uuid;

/// The two sides of a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Team {
    Red,
    Blue,
}

impl Team {
    pub const ALL: [Team; 2] = [Team::Red, Team::Blue];

    pub fn opponent(self) -> Team {
        match self {
            Team::Red => Team::Blue,
            Team::Blue => Team::Red,
        }
    }
}

/// One value per team, serialized as `{red, blue}`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamPair<T> {
    pub red: T,
    pub blue: T,
}

impl<T> TeamPair<T> {
    pub fn new(red: T, blue: T) -> Self {
        Self { red, blue }
    }

    pub fn get(&self, team: Team) -> &T {
        match team {
            Team::Red => &self.red,
            Team::Blue => &self.blue,
        }
    }

    pub fn get_mut(&mut self, team: Team) -> &mut T {
        match team {
            Team::Red => &mut self.red,
            Team::Blue => &mut self.blue,
        }
    }
}

/// Capture score per team
pub type Scores = TeamPair<u32>;

/// Match lifecycle state as seen by clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStateKind {
    /// No players joined
    Lobby,
    /// Players joined, gathering readiness
    Waiting,
    /// Match in progress
    Playing,
    /// Match over, cooling down before reset
    Ended,
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Enter the roster of the current lobby
    JoinGame,

    /// Latest driving input; replaces any previous unconsumed input
    Input {
        /// -1.0 = full reverse, 1.0 = full forward
        #[serde(default)]
        throttle: f32,
        /// 0.0 = released, 1.0 = full brake
        #[serde(default)]
        brake: f32,
        /// -1.0 = full left, 1.0 = full right
        #[serde(default)]
        steer: f32,
    },

    /// Client observed its vehicle falling off the map
    PlayerFall,

    /// Toggle readiness
    PlayerReady,

    /// Reset a flipped or stuck vehicle
    RespawnRequest,

    /// Offer a map for the next match
    CustomMap { map_data: MapData },

    /// Ping for latency and clock-offset measurement
    Ping {
        /// Client timestamp, echoed back
        t: f64,
    },
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Identity assigned to this connection
    PlayerId { id: PlayerId },

    /// Lobby / match status, sent on every roster or readiness change
    GameState {
        state: MatchStateKind,
        player_count: usize,
        max_players: usize,
        ready_count: usize,
        can_ready: bool,
    },

    /// A vehicle was placed (match start or respawn)
    Spawn {
        player_id: PlayerId,
        team: Team,
        position: Vec3,
        rotation: Quat,
    },

    /// Per-tick authoritative state
    Snapshot(Snapshot),

    /// Sent only to the eliminated player
    Eliminated { respawn_in_ms: u64 },

    /// Match has started
    GameStart {
        map: String,
        scores: Scores,
        #[serde(skip_serializing_if = "Option::is_none")]
        map_data: Option<MapData>,
    },

    /// Match has ended
    GameEnd { winner: Option<Team>, scores: Scores },

    /// Scores changed
    ScoreUpdate { red: u32, blue: u32 },

    /// Flag carrier changed; `position` is absent while the flag is carried
    FlagUpdate {
        team: Team,
        carried_by: Option<PlayerId>,
        position: Option<Vec3>,
    },

    /// A player disconnected
    PlayerLeft { player_id: PlayerId },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: f64,
        server_time_ms: f64,
    },

    /// Error message
    Error { code: String, message: String },
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Full state of every player in the match at one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Server tick number within the match
    pub tick: u64,
    /// `tick * TICK_INTERVAL_MS`; immune to host clock adjustments
    pub server_time_ms: f64,
    pub players: HashMap<PlayerId, PlayerSnapshot>,
}

/// Player state in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSnapshot {
    pub position: Vec3,
    /// Unit quaternion `[x, y, z, w]`
    pub rotation: Quat,
    pub team: Team,
    pub carrying_flag: Option<Team>,
    pub eliminated: bool,
    pub invincible: bool,
}
