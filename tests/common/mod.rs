#![allow(dead_code)]

use glam::Vec3;

use flagrush_server::config::GameConfig;
use flagrush_server::game::flag::FlagState;
use flagrush_server::game::map::{MapData, Platform};
use flagrush_server::game::physics::{ArcadeWorld, PhysicsSettings};
use flagrush_server::game::{CommandBuffer, MatchContext, MatchEvent, Outbound};
use flagrush_server::util::time::TICK_INTERVAL_MS;
use flagrush_server::ws::protocol::{ClientMessage, MatchStateKind, PlayerId, ServerMessage, Team, TeamPair};

/// Drives a `MatchContext` on a synthetic 60 Hz clock
pub struct Harness {
    pub ctx: MatchContext,
    pub now: u64,
    ticks: u64,
}

impl Harness {
    pub fn new(config: GameConfig, map: MapData) -> Self {
        let physics = ArcadeWorld::new(PhysicsSettings::default()).unwrap();
        Self {
            ctx: MatchContext::new(config, map, Box::new(physics), CommandBuffer::default(), 1234),
            now: 0,
            ticks: 0,
        }
    }

    pub fn default_match() -> Self {
        Self::new(GameConfig::default(), MapData::default())
    }

    pub fn join(&mut self) -> PlayerId {
        let id = uuid::Uuid::new_v4();
        self.ctx.handle_event(MatchEvent::Connected { player_id: id }, self.now);
        self.send(id, ClientMessage::JoinGame);
        id
    }

    pub fn send(&mut self, player_id: PlayerId, msg: ClientMessage) -> Vec<Outbound> {
        self.ctx
            .handle_event(MatchEvent::Message { player_id, msg }, self.now);
        self.ctx.take_outbox()
    }

    pub fn disconnect(&mut self, player_id: PlayerId) -> Vec<Outbound> {
        self.ctx
            .handle_event(MatchEvent::Disconnected { player_id }, self.now);
        self.ctx.take_outbox()
    }

    /// Advance the clock one interval, run the tick and check flag invariants
    pub fn tick(&mut self) -> Vec<Outbound> {
        self.ticks += 1;
        self.now = (self.ticks as f64 * TICK_INTERVAL_MS).round() as u64;
        self.ctx.tick(self.now);
        assert_flags_consistent(&self.ctx);
        self.ctx.take_outbox()
    }

    /// Tick until `found` matches an outbound message; returns every message seen
    pub fn tick_until(&mut self, max_ticks: usize, found: impl Fn(&Outbound) -> bool) -> Option<Vec<Outbound>> {
        let mut seen = Vec::new();
        for _ in 0..max_ticks {
            let out = self.tick();
            let hit = out.iter().any(&found);
            seen.extend(out);
            if hit {
                return Some(seen);
            }
        }
        None
    }

    /// Join `n` players, ready them all and run the starting tick
    pub fn start(&mut self, n: usize) -> (Vec<PlayerId>, Vec<Outbound>) {
        let ids: Vec<PlayerId> = (0..n).map(|_| self.join()).collect();
        for id in &ids {
            self.send(*id, ClientMessage::PlayerReady);
        }
        self.ctx.take_outbox();
        let out = self.tick();
        assert_eq!(self.ctx.state(), MatchStateKind::Playing);
        (ids, out)
    }

    pub fn team_of(&self, id: PlayerId) -> Team {
        self.ctx.player(&id).unwrap().team
    }

    pub fn members(&self, ids: &[PlayerId], team: Team) -> Vec<PlayerId> {
        ids.iter().copied().filter(|id| self.team_of(*id) == team).collect()
    }
}

/// At most one carrier per flag, and carrier bookkeeping agrees on both sides
pub fn assert_flags_consistent(ctx: &MatchContext) {
    for flag in ctx.flags().iter() {
        let carriers: Vec<_> = ctx
            .players()
            .filter(|p| p.carrying_flag == Some(flag.team))
            .collect();
        match flag.state {
            FlagState::AtBase => assert!(carriers.is_empty(), "{:?} flag at base but carried", flag.team),
            FlagState::Carried(id) => {
                assert_eq!(carriers.len(), 1, "{:?} flag must have exactly one carrier", flag.team);
                assert_eq!(carriers[0].id, id);
            }
        }
    }
}

pub fn broadcasts(out: &[Outbound]) -> impl Iterator<Item = &ServerMessage> {
    out.iter().filter_map(|o| match o {
        Outbound::Broadcast(msg) => Some(msg),
        Outbound::To(..) => None,
    })
}

pub fn sent_to(out: &[Outbound], player: PlayerId) -> impl Iterator<Item = &ServerMessage> {
    out.iter().filter_map(move |o| match o {
        Outbound::To(id, msg) if *id == player => Some(msg),
        _ => None,
    })
}

/// One slab with both bases close together, so a carrier parked at its
/// spawn picks up and captures without driving
pub fn capture_map() -> MapData {
    MapData {
        name: "test_capture".to_string(),
        platforms: vec![Platform {
            center: Vec3::new(0.0, -1.0, 0.0),
            half_extents: Vec3::new(30.0, 1.0, 30.0),
        }],
        spawns: TeamPair::new(vec![Vec3::new(2.5, 1.0, 0.0)], vec![Vec3::new(20.0, 1.0, 20.0)]),
        flag_bases: TeamPair::new(Vec3::new(-4.0, 1.0, 0.0), Vec3::new(4.0, 1.0, 0.0)),
    }
}

/// Default layout, but both red spawns sit next to the blue flag
pub fn pickup_map() -> MapData {
    let mut map = MapData::default();
    map.name = "test_pickup".to_string();
    map.spawns.red = vec![Vec3::new(43.0, 1.0, 0.0), Vec3::new(45.0, 1.0, 2.0)];
    map
}

/// Two islands with a gap; the first red spawn hangs over the gap next to
/// the blue flag
pub fn gap_map() -> MapData {
    MapData {
        name: "test_gap".to_string(),
        platforms: vec![
            Platform {
                center: Vec3::new(-18.0, -1.0, 0.0),
                half_extents: Vec3::new(12.0, 1.0, 30.0),
            },
            Platform {
                center: Vec3::new(20.0, -1.0, 0.0),
                half_extents: Vec3::new(10.0, 1.0, 30.0),
            },
        ],
        spawns: TeamPair::new(
            vec![Vec3::new(3.0, 1.0, 0.0), Vec3::new(-20.0, 1.0, 10.0)],
            vec![Vec3::new(20.0, 1.0, -5.0), Vec3::new(20.0, 1.0, 5.0)],
        ),
        flag_bases: TeamPair::new(Vec3::new(-4.0, 1.0, 0.0), Vec3::new(4.0, 1.0, 0.0)),
    }
}
