//! Match state machine and authoritative tick loop

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use glam::{Quat, Vec3};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::GameConfig;
use crate::util::time::{tick_delta, TICK_DURATION};
use crate::ws::protocol::{
    ClientMessage, MatchStateKind, PlayerId, Scores, ServerMessage, Team,
};

use super::elimination::{has_fallen, LifeState};
use super::flag::{Contender, Flags};
use super::map::MapData;
use super::physics::{BodyHandle, BodyKind, ColliderDesc, ColliderShape, PhysicsEngine, PhysicsError};
use super::scheduler::TickClock;
use super::snapshot::SnapshotBuilder;
use super::vehicle::{handling_multiplier, InputCommand, Pose, PoseStatus, Vehicle, VehicleTuning};
use super::{CommandBuffer, MatchEvent};

/// Player state in a match (authoritative)
#[derive(Debug, Clone)]
pub struct PlayerState {
    pub id: PlayerId,
    pub team: Team,
    pub life: LifeState,
    pub carrying_flag: Option<Team>,
    /// Last finite post-step pose
    pub pose: Pose,
    /// `None` while eliminated or before the first spawn
    pub vehicle: Option<Vehicle>,
    pub joined_at: u64,
}

impl PlayerState {
    pub fn new(id: PlayerId, team: Team, joined_at: u64) -> Self {
        Self {
            id,
            team,
            life: LifeState::default(),
            carrying_flag: None,
            pose: Pose {
                position: Vec3::ZERO,
                rotation: Quat::IDENTITY,
            },
            vehicle: None,
            joined_at,
        }
    }

    /// Time since joining, in milliseconds
    pub fn session_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.joined_at)
    }

    fn contender(&self) -> Contender {
        Contender {
            id: self.id,
            team: self.team,
            eliminated: self.life.is_eliminated(),
            carrying: self.carrying_flag,
            position: self.pose.position,
        }
    }
}

/// A message produced by the match, addressed to everyone or one peer
#[derive(Debug, Clone)]
pub enum Outbound {
    Broadcast(ServerMessage),
    To(PlayerId, ServerMessage),
}

/// Winning capture waiting for its acknowledgement delay
#[derive(Debug, Clone, Copy)]
struct PendingEnd {
    at: u64,
    winner: Option<Team>,
}

/// Rule outcome found during the read-only scan of a tick
#[derive(Debug, Clone, Copy)]
enum Intent {
    Eliminate(PlayerId),
    Pickup { player: PlayerId, flag: Team },
    Capture { player: PlayerId, flag: Team },
}

/// The single live match of this process, owned by the tick loop
pub struct MatchContext {
    config: GameConfig,
    tuning: VehicleTuning,
    state: MatchStateKind,
    /// Ordered so team shuffles are reproducible for a given seed
    players: BTreeMap<PlayerId, PlayerState>,
    ready: HashSet<PlayerId>,
    scores: Scores,
    flags: Flags,
    default_map: Arc<MapData>,
    map: Arc<MapData>,
    /// Custom map offered in the lobby, applied at the next start
    pending_map: Option<Arc<MapData>>,
    physics: Box<dyn PhysicsEngine>,
    arena_bodies: Vec<BodyHandle>,
    clock: TickClock,
    snapshots: SnapshotBuilder,
    commands: CommandBuffer,
    rng: ChaCha8Rng,
    pending_end: Option<PendingEnd>,
    reset_at: Option<u64>,
    outbox: Vec<Outbound>,
}

impl MatchContext {
    pub fn new(
        config: GameConfig,
        map: MapData,
        physics: Box<dyn PhysicsEngine>,
        commands: CommandBuffer,
        seed: u64,
    ) -> Self {
        let map = Arc::new(map);
        Self {
            flags: Flags::new(&map.flag_bases),
            config,
            tuning: VehicleTuning::default(),
            state: MatchStateKind::Lobby,
            players: BTreeMap::new(),
            ready: HashSet::new(),
            scores: Scores::default(),
            default_map: map.clone(),
            map,
            pending_map: None,
            physics,
            arena_bodies: Vec::new(),
            clock: TickClock::new(),
            snapshots: SnapshotBuilder::new(),
            commands,
            rng: ChaCha8Rng::seed_from_u64(seed),
            pending_end: None,
            reset_at: None,
            outbox: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Read access
    // ------------------------------------------------------------------

    pub fn state(&self) -> MatchStateKind {
        self.state
    }

    pub fn scores(&self) -> Scores {
        self.scores
    }

    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    pub fn map(&self) -> &Arc<MapData> {
        &self.map
    }

    pub fn player(&self, id: &PlayerId) -> Option<&PlayerState> {
        self.players.get(id)
    }

    pub fn players(&self) -> impl Iterator<Item = &PlayerState> {
        self.players.values()
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    pub fn physics(&self) -> &dyn PhysicsEngine {
        self.physics.as_ref()
    }

    /// Direct engine access, used by tooling and tests to stage poses
    pub fn physics_mut(&mut self) -> &mut dyn PhysicsEngine {
        self.physics.as_mut()
    }

    pub fn server_time_ms(&self) -> f64 {
        self.clock.server_time_ms()
    }

    fn can_ready(&self) -> bool {
        matches!(self.state, MatchStateKind::Lobby | MatchStateKind::Waiting)
            && self.players.len() >= self.config.min_players
    }

    pub fn game_state_message(&self) -> ServerMessage {
        ServerMessage::GameState {
            state: self.state,
            player_count: self.players.len(),
            max_players: self.config.max_players,
            ready_count: self.ready.len(),
            can_ready: self.can_ready(),
        }
    }

    /// Messages produced since the last call, in emission order
    pub fn take_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    fn broadcast(&mut self, msg: ServerMessage) {
        self.outbox.push(Outbound::Broadcast(msg));
    }

    fn send_to(&mut self, id: PlayerId, msg: ServerMessage) {
        self.outbox.push(Outbound::To(id, msg));
    }

    fn broadcast_game_state(&mut self) {
        let msg = self.game_state_message();
        self.broadcast(msg);
    }

    fn broadcast_scores(&mut self) {
        let Scores { red, blue } = self.scores;
        self.broadcast(ServerMessage::ScoreUpdate { red, blue });
    }

    // ------------------------------------------------------------------
    // Inbound events
    // ------------------------------------------------------------------

    /// Apply one queued transport event
    pub fn handle_event(&mut self, event: MatchEvent, now: u64) {
        match event {
            MatchEvent::Connected { player_id } => {
                self.send_to(player_id, ServerMessage::PlayerId { id: player_id });
                let state = self.game_state_message();
                self.send_to(player_id, state);
            }
            MatchEvent::Message { player_id, msg } => self.handle_message(player_id, msg, now),
            MatchEvent::Disconnected { player_id } => self.handle_disconnect(player_id, now),
        }
    }

    fn handle_message(&mut self, player_id: PlayerId, msg: ClientMessage, now: u64) {
        match msg {
            ClientMessage::JoinGame => self.handle_join(player_id, now),
            ClientMessage::Input {
                throttle,
                brake,
                steer,
            } => {
                self.commands
                    .insert(player_id, InputCommand::sanitized(throttle, brake, steer));
            }
            ClientMessage::PlayerFall => {
                if self.state == MatchStateKind::Playing {
                    self.eliminate(player_id, now, "reported_fall");
                }
            }
            ClientMessage::PlayerReady => self.handle_ready(player_id),
            ClientMessage::RespawnRequest => self.handle_respawn_request(player_id, now),
            ClientMessage::CustomMap { map_data } => self.handle_custom_map(player_id, map_data),
            ClientMessage::Ping { t } => {
                let server_time_ms = self.clock.server_time_ms();
                self.send_to(player_id, ServerMessage::Pong { t, server_time_ms });
            }
        }
    }

    fn handle_join(&mut self, player_id: PlayerId, now: u64) {
        if matches!(self.state, MatchStateKind::Playing | MatchStateKind::Ended) {
            self.send_to(
                player_id,
                ServerMessage::error("match_in_progress", "A match is in progress, try again shortly"),
            );
            return;
        }
        if self.players.contains_key(&player_id) {
            debug!(player_id = %player_id, "Player already in roster");
            return;
        }
        if self.players.len() >= self.config.max_players {
            self.send_to(player_id, ServerMessage::error("match_full", "Match is full"));
            return;
        }

        // Tentative team; the real split happens at match start
        let reds = self.players.values().filter(|p| p.team == Team::Red).count();
        let team = if reds * 2 <= self.players.len() {
            Team::Red
        } else {
            Team::Blue
        };
        self.players.insert(player_id, PlayerState::new(player_id, team, now));
        if self.state == MatchStateKind::Lobby {
            self.state = MatchStateKind::Waiting;
        }

        info!(
            player_id = %player_id,
            player_count = self.players.len(),
            "Player joined lobby"
        );
        self.broadcast_game_state();
    }

    fn handle_ready(&mut self, player_id: PlayerId) {
        if !self.players.contains_key(&player_id) || !self.can_ready() {
            debug!(player_id = %player_id, "Ignoring ready toggle");
            return;
        }
        if !self.ready.remove(&player_id) {
            self.ready.insert(player_id);
        }
        info!(
            player_id = %player_id,
            ready_count = self.ready.len(),
            player_count = self.players.len(),
            "Ready toggled"
        );
        self.broadcast_game_state();
    }

    fn handle_respawn_request(&mut self, player_id: PlayerId, now: u64) {
        if self.state != MatchStateKind::Playing {
            return;
        }
        let Some(player) = self.players.get(&player_id) else {
            return;
        };
        if player.life.is_eliminated() {
            debug!(player_id = %player_id, "Respawn request while eliminated, waiting for deadline");
            return;
        }
        // A carrier must not teleport home with the flag
        self.force_drop(player_id);
        self.respawn(player_id, now);
    }

    fn handle_custom_map(&mut self, player_id: PlayerId, map: MapData) {
        if !matches!(self.state, MatchStateKind::Lobby | MatchStateKind::Waiting) {
            self.send_to(
                player_id,
                ServerMessage::error("map_locked", "Maps can only change in the lobby"),
            );
            return;
        }
        match map.validate() {
            Ok(()) => {
                info!(player_id = %player_id, map = %map.name, "Custom map queued for next match");
                self.pending_map = Some(Arc::new(map));
            }
            Err(e) => {
                warn!(player_id = %player_id, error = %e, "Rejected custom map");
                self.send_to(player_id, ServerMessage::error("invalid_map", e.to_string()));
            }
        }
    }

    fn handle_disconnect(&mut self, player_id: PlayerId, now: u64) {
        self.commands.remove(&player_id);
        self.ready.remove(&player_id);

        let Some(mut player) = self.players.remove(&player_id) else {
            return;
        };
        if let Some(team) = self.flags.drop_carried_by(player_id) {
            info!(player_id = %player_id, flag = ?team, "Carrier left, flag returned");
            let msg = self.flags.get(team).update_message();
            self.broadcast(msg);
        }
        player.carrying_flag = None;
        if let Some(vehicle) = player.vehicle.take() {
            if let Err(e) = vehicle.despawn(self.physics.as_mut()) {
                warn!(player_id = %player_id, error = %e, "Failed to remove vehicle");
            }
        }

        info!(
            player_id = %player_id,
            player_count = self.players.len(),
            session_ms = player.session_ms(now),
            "Player left"
        );
        self.broadcast(ServerMessage::PlayerLeft { player_id });

        if self.state == MatchStateKind::Waiting && self.players.is_empty() {
            self.state = MatchStateKind::Lobby;
        }
        self.broadcast_game_state();

        if self.state == MatchStateKind::Playing {
            self.check_attrition(now);
        }
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// Run one fixed-interval tick at monotonic time `now` (ms)
    pub fn tick(&mut self, now: u64) {
        match self.state {
            MatchStateKind::Lobby | MatchStateKind::Waiting => self.try_start(now),
            MatchStateKind::Playing => {
                self.simulate(now);
                self.check_end(now);
            }
            MatchStateKind::Ended => {
                if self.reset_at.is_some_and(|at| now >= at) {
                    self.reset_to_lobby();
                }
            }
        }
    }

    fn simulate(&mut self, now: u64) {
        // 1. Latest input for every live vehicle
        let dt = tick_delta();
        for player in self.players.values() {
            let Some(vehicle) = &player.vehicle else {
                continue;
            };
            let input = self
                .commands
                .get(&player.id)
                .map(|c| *c)
                .unwrap_or_default();
            let handling = handling_multiplier(player.carrying_flag.is_some(), self.config.carry_handling);
            if let Err(e) = vehicle.apply_command(self.physics.as_mut(), input, handling, &self.tuning, dt) {
                warn!(player_id = %player.id, error = %e, "Failed to apply input");
            }
        }

        // 2. Fixed sub-steps covering elapsed time
        let step_ms = f64::from(self.physics.timestep()) * 1000.0;
        let steps = self.clock.substeps(now, step_ms);
        for _ in 0..steps {
            self.physics.step();
        }

        // Read back poses; a bad body is a per-entity fault
        let mut faulted = Vec::new();
        for player in self.players.values_mut() {
            let Some(vehicle) = player.vehicle.as_mut() else {
                continue;
            };
            match vehicle.sync_pose(self.physics.as_ref()) {
                Ok(PoseStatus::Valid) => player.pose = vehicle.pose(),
                Ok(PoseStatus::NonFinite) => faulted.push(player.id),
                Err(e) => {
                    warn!(player_id = %player.id, error = %e, "Failed to read vehicle pose");
                    faulted.push(player.id);
                }
            }
        }
        for id in faulted {
            self.recover_vehicle(id, now);
        }

        // Deadline-driven respawns
        let due: Vec<PlayerId> = self
            .players
            .values()
            .filter(|p| p.life.respawn_due(now))
            .map(|p| p.id)
            .collect();
        for id in due {
            self.respawn(id, now);
        }

        // 3. Rules: scan, then apply with re-validation
        let intents = self.scan_rules();
        for intent in intents {
            if self.state != MatchStateKind::Playing {
                break;
            }
            match intent {
                Intent::Eliminate(id) => self.eliminate(id, now, "fell"),
                Intent::Pickup { player, flag } => self.pickup(player, flag),
                Intent::Capture { player, flag } => self.capture(player, flag, now),
            }
        }

        // 4. Snapshot
        let (tick, server_time_ms) = self.clock.next_server_time();
        let snapshot = self
            .snapshots
            .build(tick, server_time_ms, self.players.values(), now);
        self.broadcast(snapshot);
    }

    fn scan_rules(&self) -> Vec<Intent> {
        let mut intents = Vec::new();
        for player in self.players.values() {
            if player.life.is_eliminated() {
                continue;
            }
            if has_fallen(player.pose.position.y, self.config.death_y) {
                intents.push(Intent::Eliminate(player.id));
                continue;
            }
            let contender = player.contender();
            for flag in Team::ALL {
                if self.flags.can_pickup(flag, &contender, self.config.pickup_radius) {
                    intents.push(Intent::Pickup {
                        player: player.id,
                        flag,
                    });
                }
            }
            if let Some(flag) = self.flags.capturable(&contender, self.config.capture_radius) {
                intents.push(Intent::Capture {
                    player: player.id,
                    flag,
                });
            }
        }
        intents
    }

    fn pickup(&mut self, player_id: PlayerId, flag: Team) {
        let Some(player) = self.players.get(&player_id) else {
            return;
        };
        // An earlier intent this tick may have changed things
        if !self
            .flags
            .can_pickup(flag, &player.contender(), self.config.pickup_radius)
        {
            return;
        }
        if !self.flags.pick_up(flag, player_id) {
            return;
        }
        if let Some(player) = self.players.get_mut(&player_id) {
            player.carrying_flag = Some(flag);
        }
        info!(player_id = %player_id, flag = ?flag, "Flag picked up");
        let msg = self.flags.get(flag).update_message();
        self.broadcast(msg);
    }

    fn capture(&mut self, player_id: PlayerId, flag: Team, now: u64) {
        if self.pending_end.is_some() {
            // Result already decided, waiting for the acknowledgement delay
            return;
        }
        let Some(player) = self.players.get(&player_id) else {
            return;
        };
        if self
            .flags
            .capturable(&player.contender(), self.config.capture_radius)
            != Some(flag)
        {
            return;
        }
        let team = player.team;

        self.flags.return_to_base(flag);
        if let Some(player) = self.players.get_mut(&player_id) {
            player.carrying_flag = None;
        }
        let score = {
            let score = self.scores.get_mut(team);
            *score += 1;
            *score
        };
        info!(player_id = %player_id, team = ?team, score, "Flag captured");

        let msg = self.flags.get(flag).update_message();
        self.broadcast(msg);
        self.broadcast_scores();

        if score >= self.config.win_score {
            info!(team = ?team, "Win score reached");
            self.pending_end = Some(PendingEnd {
                at: now.saturating_add(self.config.capture_ack_delay_ms),
                winner: Some(team),
            });
        }
    }

    /// Return any flag `player_id` carries and tell everyone
    fn force_drop(&mut self, player_id: PlayerId) {
        if let Some(team) = self.flags.drop_carried_by(player_id) {
            if let Some(player) = self.players.get_mut(&player_id) {
                player.carrying_flag = None;
            }
            info!(player_id = %player_id, flag = ?team, "Flag returned to base");
            let msg = self.flags.get(team).update_message();
            self.broadcast(msg);
        }
    }

    fn eliminate(&mut self, player_id: PlayerId, now: u64, cause: &'static str) {
        let delay = self.config.respawn_delay_ms;
        let Some(player) = self.players.get_mut(&player_id) else {
            return;
        };
        if !player.life.eliminate(now, delay) {
            return;
        }
        let vehicle = player.vehicle.take();
        info!(player_id = %player_id, cause, "Player eliminated");

        self.force_drop(player_id);
        if let Some(vehicle) = vehicle {
            if let Err(e) = vehicle.despawn(self.physics.as_mut()) {
                warn!(player_id = %player_id, error = %e, "Failed to remove vehicle");
            }
        }
        self.send_to(player_id, ServerMessage::Eliminated { respawn_in_ms: delay });
        self.check_attrition(now);
    }

    /// Place the player at a random team spawn, invincible
    fn respawn(&mut self, player_id: PlayerId, now: u64) {
        let Some(team) = self.players.get(&player_id).map(|p| p.team) else {
            return;
        };
        let position = self.map.pick_spawn(team, &mut self.rng);
        let rotation = self.map.spawn_facing(team, position);
        if let Err(e) = self.place_vehicle(player_id, position, rotation) {
            warn!(player_id = %player_id, error = %e, "Respawn failed");
            return;
        }
        let invincibility = self.config.invincibility_ms;
        if let Some(player) = self.players.get_mut(&player_id) {
            player.life.revive(now, invincibility);
        }
        debug!(player_id = %player_id, "Player respawned");
        self.broadcast(ServerMessage::Spawn {
            player_id,
            team,
            position,
            rotation,
        });
    }

    /// Non-finite or lost body: drop its flag and put it back at a spawn
    fn recover_vehicle(&mut self, player_id: PlayerId, now: u64) {
        warn!(player_id = %player_id, "Vehicle state corrupted, respawning");
        self.force_drop(player_id);
        self.respawn(player_id, now);
    }

    fn place_vehicle(&mut self, player_id: PlayerId, position: Vec3, rotation: Quat) -> Result<(), PhysicsError> {
        let Some(player) = self.players.get_mut(&player_id) else {
            return Ok(());
        };
        match player.vehicle.as_mut() {
            Some(vehicle) => vehicle.teleport(self.physics.as_mut(), position, rotation, &self.tuning)?,
            None => {
                player.vehicle = Some(Vehicle::spawn(self.physics.as_mut(), position, rotation, &self.tuning)?);
            }
        }
        player.pose = Pose { position, rotation };
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    fn try_start(&mut self, now: u64) {
        let count = self.players.len();
        if count == 0
            || count < self.config.min_players
            || count > self.config.max_players
            || self.ready.len() != count
        {
            return;
        }

        self.state = MatchStateKind::Waiting;
        self.broadcast_game_state();

        let custom_map = self.pending_map.take();
        if let Some(map) = &custom_map {
            self.map = map.clone();
        }
        self.build_arena();
        self.flags = Flags::new(&self.map.flag_bases);
        self.scores = Scores::default();
        self.pending_end = None;
        self.clock.reset();
        self.snapshots.reset();

        // Shuffle, then alternate
        let mut ids: Vec<PlayerId> = self.players.keys().copied().collect();
        ids.shuffle(&mut self.rng);
        let mut spawn_index = [0usize; 2];
        for (i, id) in ids.iter().enumerate() {
            let team = if i % 2 == 0 { Team::Red } else { Team::Blue };
            let slot = &mut spawn_index[i % 2];
            let spawns = self.map.spawns.get(team);
            let position = if spawns.is_empty() {
                self.map.pick_spawn(team, &mut self.rng)
            } else {
                spawns[*slot % spawns.len()]
            };
            *slot += 1;
            let rotation = self.map.spawn_facing(team, position);

            self.commands.remove(id);
            if let Some(player) = self.players.get_mut(id) {
                player.team = team;
                player.life = LifeState::default();
                player.carrying_flag = None;
            }
            if let Err(e) = self.place_vehicle(*id, position, rotation) {
                warn!(player_id = %id, error = %e, "Initial spawn failed");
            }
            if let Some(player) = self.players.get_mut(id) {
                player.life.revive(now, self.config.invincibility_ms);
            }
            self.broadcast(ServerMessage::Spawn {
                player_id: *id,
                team,
                position,
                rotation,
            });
        }

        self.broadcast(ServerMessage::GameStart {
            map: self.map.name.clone(),
            scores: self.scores,
            map_data: custom_map.map(|m| (*m).clone()),
        });
        let flag_updates: Vec<ServerMessage> = self.flags.iter().map(|f| f.update_message()).collect();
        for msg in flag_updates {
            self.broadcast(msg);
        }

        self.state = MatchStateKind::Playing;
        self.ready.clear();
        info!(player_count = count, map = %self.map.name, "Match started");
        self.broadcast_game_state();
    }

    fn build_arena(&mut self) {
        self.clear_arena();
        for platform in &self.map.platforms {
            let body = self
                .physics
                .create_rigid_body(platform.center, Quat::IDENTITY, BodyKind::Fixed);
            let collider = ColliderDesc {
                shape: ColliderShape::Cuboid {
                    half_extents: platform.half_extents,
                },
                friction: 0.8,
                restitution: 0.0,
                mass: 0.0,
            };
            if let Err(e) = self.physics.create_collider(body, collider) {
                warn!(error = %e, "Failed to build platform collider");
            }
            self.arena_bodies.push(body);
        }
    }

    fn clear_arena(&mut self) {
        for body in self.arena_bodies.drain(..) {
            if let Err(e) = self.physics.remove_rigid_body(body) {
                debug!(error = %e, "Arena body already removed");
            }
        }
    }

    fn check_end(&mut self, now: u64) {
        if self.state != MatchStateKind::Playing {
            return;
        }
        if let Some(pending) = self.pending_end {
            if now >= pending.at {
                self.end_match(pending.winner, now);
            }
            return;
        }
        self.check_attrition(now);
    }

    /// End the match when fewer than two players are still in play
    fn check_attrition(&mut self, now: u64) {
        if self.state != MatchStateKind::Playing || self.pending_end.is_some() {
            return;
        }
        let active: Vec<Team> = self
            .players
            .values()
            .filter(|p| !p.life.is_eliminated())
            .map(|p| p.team)
            .collect();
        if active.len() >= 2 {
            return;
        }

        let winner = match active.first() {
            Some(team) => Some(*team),
            None => match self.scores.red.cmp(&self.scores.blue) {
                std::cmp::Ordering::Greater => Some(Team::Red),
                std::cmp::Ordering::Less => Some(Team::Blue),
                std::cmp::Ordering::Equal => None,
            },
        };
        info!(active = active.len(), "Not enough active players");
        self.end_match(winner, now);
    }

    fn end_match(&mut self, winner: Option<Team>, now: u64) {
        self.state = MatchStateKind::Ended;
        self.pending_end = None;
        self.reset_at = Some(now.saturating_add(self.config.end_cooldown_ms));
        info!(winner = ?winner, red = self.scores.red, blue = self.scores.blue, "Match ended");
        self.broadcast(ServerMessage::GameEnd {
            winner,
            scores: self.scores,
        });
        self.broadcast_game_state();
    }

    fn reset_to_lobby(&mut self) {
        let players = std::mem::take(&mut self.players);
        for (id, mut player) in players {
            self.commands.remove(&id);
            if let Some(vehicle) = player.vehicle.take() {
                if let Err(e) = vehicle.despawn(self.physics.as_mut()) {
                    debug!(player_id = %id, error = %e, "Vehicle already removed");
                }
            }
        }
        self.clear_arena();
        self.ready.clear();
        self.scores = Scores::default();
        self.map = self.default_map.clone();
        self.pending_map = None;
        self.flags = Flags::new(&self.map.flag_bases);
        self.pending_end = None;
        self.reset_at = None;
        self.clock.reset();
        self.snapshots.reset();
        self.state = MatchStateKind::Lobby;

        info!("Match reset to lobby");
        self.broadcast_scores();
        self.broadcast_game_state();
    }
}

/// Latest status for the HTTP surface
#[derive(Debug, Clone)]
pub struct MatchStatus {
    pub state: MatchStateKind,
    pub player_count: usize,
    pub max_players: usize,
    pub ready_count: usize,
    pub can_ready: bool,
    pub scores: Scores,
    pub map: Arc<MapData>,
}

impl MatchStatus {
    fn from_context(ctx: &MatchContext) -> Self {
        Self {
            state: ctx.state(),
            player_count: ctx.player_count(),
            max_players: ctx.config().max_players,
            ready_count: ctx.ready_count(),
            can_ready: ctx.can_ready(),
            scores: ctx.scores(),
            map: ctx.map().clone(),
        }
    }

    /// Current match state and scores for a client that missed broadcasts.
    /// Flag carriers come back with the next snapshot.
    pub fn resync_messages(&self) -> [ServerMessage; 2] {
        [
            ServerMessage::GameState {
                state: self.state,
                player_count: self.player_count,
                max_players: self.max_players,
                ready_count: self.ready_count,
                can_ready: self.can_ready,
            },
            ServerMessage::ScoreUpdate {
                red: self.scores.red,
                blue: self.scores.blue,
            },
        ]
    }
}

/// Per-connection senders for targeted messages
pub type PeerRegistry = Arc<DashMap<PlayerId, mpsc::Sender<ServerMessage>>>;

/// Handle to the running match
#[derive(Clone)]
pub struct MatchHandle {
    pub events_tx: mpsc::Sender<MatchEvent>,
    pub commands: CommandBuffer,
    pub broadcast_tx: broadcast::Sender<ServerMessage>,
    pub peers: PeerRegistry,
    pub status: Arc<RwLock<MatchStatus>>,
}

impl MatchHandle {
    pub fn status(&self) -> MatchStatus {
        self.status.read().clone()
    }

    pub fn connected_peers(&self) -> usize {
        self.peers.len()
    }
}

/// The authoritative match task
pub struct GameMatch {
    ctx: MatchContext,
    events_rx: mpsc::Receiver<MatchEvent>,
    broadcast_tx: broadcast::Sender<ServerMessage>,
    peers: PeerRegistry,
    status: Arc<RwLock<MatchStatus>>,
    epoch: Instant,
}

impl GameMatch {
    /// Wrap a context; the context's command buffer is shared with the handle
    pub fn new(ctx: MatchContext) -> (Self, MatchHandle) {
        let (events_tx, events_rx) = mpsc::channel(1024);
        let (broadcast_tx, _) = broadcast::channel(256);
        let peers: PeerRegistry = Arc::new(DashMap::new());
        let status = Arc::new(RwLock::new(MatchStatus::from_context(&ctx)));

        let handle = MatchHandle {
            events_tx,
            commands: ctx.commands.clone(),
            broadcast_tx: broadcast_tx.clone(),
            peers: peers.clone(),
            status: status.clone(),
        };

        let game_match = Self {
            ctx,
            events_rx,
            broadcast_tx,
            peers,
            status,
            epoch: Instant::now(),
        };
        (game_match, handle)
    }

    /// Run the authoritative tick loop until every handle is dropped
    pub async fn run(mut self) {
        info!("Match loop started");

        let mut tick_interval = interval(TICK_DURATION);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tick_interval.tick().await;
            let now = self.epoch.elapsed().as_millis() as u64;

            if !self.drain_events(now) {
                info!("All match handles dropped, stopping match loop");
                break;
            }
            self.ctx.tick(now);
            self.flush();
            *self.status.write() = MatchStatus::from_context(&self.ctx);
        }
    }

    /// Apply queued events; false once the channel is closed
    fn drain_events(&mut self, now: u64) -> bool {
        loop {
            match self.events_rx.try_recv() {
                Ok(event) => {
                    self.ctx.handle_event(event, now);
                    self.flush();
                }
                Err(mpsc::error::TryRecvError::Empty) => return true,
                Err(mpsc::error::TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn flush(&mut self) {
        for out in self.ctx.take_outbox() {
            match out {
                Outbound::Broadcast(msg) => {
                    // No subscribers is fine
                    let _ = self.broadcast_tx.send(msg);
                }
                Outbound::To(id, msg) => {
                    let Some(peer) = self.peers.get(&id) else {
                        continue;
                    };
                    if peer.try_send(msg).is_err() {
                        warn!(player_id = %id, "Peer queue full or closed, dropping message");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::physics::{ArcadeWorld, PhysicsSettings};
    use uuid::Uuid;

    fn context() -> MatchContext {
        let physics = ArcadeWorld::new(PhysicsSettings::default()).unwrap();
        MatchContext::new(
            GameConfig::default(),
            MapData::default(),
            Box::new(physics),
            CommandBuffer::default(),
            42,
        )
    }

    fn join(ctx: &mut MatchContext, now: u64) -> PlayerId {
        let id = Uuid::new_v4();
        ctx.handle_event(MatchEvent::Connected { player_id: id }, now);
        ctx.handle_event(
            MatchEvent::Message {
                player_id: id,
                msg: ClientMessage::JoinGame,
            },
            now,
        );
        id
    }

    fn ready(ctx: &mut MatchContext, id: PlayerId, now: u64) {
        ctx.handle_event(
            MatchEvent::Message {
                player_id: id,
                msg: ClientMessage::PlayerReady,
            },
            now,
        );
    }

    #[test]
    fn join_moves_lobby_to_waiting_and_back() {
        let mut ctx = context();
        assert_eq!(ctx.state(), MatchStateKind::Lobby);
        let id = join(&mut ctx, 0);
        assert_eq!(ctx.state(), MatchStateKind::Waiting);
        ctx.handle_event(MatchEvent::Disconnected { player_id: id }, 1);
        assert_eq!(ctx.state(), MatchStateKind::Lobby);
        assert_eq!(ctx.player_count(), 0);
    }

    #[test]
    fn ready_is_gated_until_min_players() {
        let mut ctx = context();
        let a = join(&mut ctx, 0);
        ready(&mut ctx, a, 0);
        assert_eq!(ctx.ready_count(), 0);

        let b = join(&mut ctx, 0);
        ready(&mut ctx, a, 0);
        assert_eq!(ctx.ready_count(), 1);
        // Toggle off again
        ready(&mut ctx, a, 0);
        assert_eq!(ctx.ready_count(), 0);
        ready(&mut ctx, b, 0);
        ctx.tick(0);
        assert_eq!(ctx.state(), MatchStateKind::Waiting);
    }

    #[test]
    fn join_rejected_when_full() {
        let mut ctx = context();
        for _ in 0..ctx.config().max_players {
            join(&mut ctx, 0);
        }
        ctx.take_outbox();
        let late = join(&mut ctx, 0);
        assert_eq!(ctx.player_count(), ctx.config().max_players);
        let rejected = ctx.take_outbox().into_iter().any(|o| {
            matches!(o, Outbound::To(id, ServerMessage::Error { ref code, .. }) if id == late && code == "match_full")
        });
        assert!(rejected);
    }

    #[test]
    fn connect_sends_identity_first() {
        let mut ctx = context();
        let id = Uuid::new_v4();
        ctx.handle_event(MatchEvent::Connected { player_id: id }, 0);
        let out = ctx.take_outbox();
        assert!(matches!(
            out.first(),
            Some(Outbound::To(to, ServerMessage::PlayerId { id: sent })) if *to == id && *sent == id
        ));
    }

    #[test]
    fn invalid_custom_map_is_rejected() {
        let mut ctx = context();
        let id = join(&mut ctx, 0);
        let mut map = MapData::default();
        map.spawns.red.clear();
        ctx.take_outbox();
        ctx.handle_event(
            MatchEvent::Message {
                player_id: id,
                msg: ClientMessage::CustomMap { map_data: map },
            },
            0,
        );
        let out = ctx.take_outbox();
        assert!(out.iter().any(|o| matches!(
            o,
            Outbound::To(_, ServerMessage::Error { code, .. }) if code == "invalid_map"
        )));
    }

    #[test]
    fn input_is_clamped_into_command_buffer() {
        let mut ctx = context();
        let id = join(&mut ctx, 0);
        ctx.handle_event(
            MatchEvent::Message {
                player_id: id,
                msg: ClientMessage::Input {
                    throttle: 9.0,
                    brake: 0.5,
                    steer: -3.0,
                },
            },
            0,
        );
        let cmd = *ctx.commands.get(&id).unwrap();
        assert_eq!(cmd.throttle, 1.0);
        assert_eq!(cmd.steer, -1.0);
        assert_eq!(cmd.brake, 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn match_task_delivers_targeted_and_broadcast_messages() {
        let (game_match, handle) = GameMatch::new(context());
        let task = tokio::spawn(game_match.run());

        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(16);
        handle.peers.insert(id, tx);
        let mut broadcast_rx = handle.broadcast_tx.subscribe();

        handle
            .events_tx
            .send(MatchEvent::Connected { player_id: id })
            .await
            .unwrap();
        handle
            .events_tx
            .send(MatchEvent::Message {
                player_id: id,
                msg: ClientMessage::JoinGame,
            })
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(matches!(rx.recv().await, Some(ServerMessage::PlayerId { id: sent }) if sent == id));
        assert!(matches!(
            broadcast_rx.recv().await,
            Ok(ServerMessage::GameState {
                state: MatchStateKind::Waiting,
                player_count: 1,
                ..
            })
        ));
        assert_eq!(handle.status().player_count, 1);

        task.abort();
    }

    #[test]
    fn resync_reflects_current_state_and_scores() {
        let mut ctx = context();
        join(&mut ctx, 0);
        let b = join(&mut ctx, 0);
        ready(&mut ctx, b, 0);
        ctx.scores = Scores::new(2, 1);

        let [state, scores] = MatchStatus::from_context(&ctx).resync_messages();
        assert!(matches!(
            state,
            ServerMessage::GameState {
                state: MatchStateKind::Waiting,
                player_count: 2,
                ready_count: 1,
                can_ready: true,
                ..
            }
        ));
        assert!(matches!(scores, ServerMessage::ScoreUpdate { red: 2, blue: 1 }));
    }

    #[test]
    fn session_length_counts_from_join() {
        let mut ctx = context();
        let id = join(&mut ctx, 1_000);
        let player = ctx.player(&id).unwrap();
        assert_eq!(player.session_ms(4_500), 3_500);
        assert_eq!(player.session_ms(500), 0);
    }
}
