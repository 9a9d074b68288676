//! Flag pickup / capture / drop rules

use glam::Vec3;

use crate::ws::protocol::{PlayerId, ServerMessage, Team, TeamPair};

/// Where a team's flag currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagState {
    AtBase,
    Carried(PlayerId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Flag {
    pub team: Team,
    /// Fixed home position
    pub base: Vec3,
    pub state: FlagState,
}

impl Flag {
    pub fn new(team: Team, base: Vec3) -> Self {
        Self {
            team,
            base,
            state: FlagState::AtBase,
        }
    }

    pub fn carrier(&self) -> Option<PlayerId> {
        match self.state {
            FlagState::Carried(id) => Some(id),
            FlagState::AtBase => None,
        }
    }

    /// `flagUpdate` describing the current state
    pub fn update_message(&self) -> ServerMessage {
        match self.state {
            FlagState::AtBase => ServerMessage::FlagUpdate {
                team: self.team,
                carried_by: None,
                position: Some(self.base),
            },
            FlagState::Carried(id) => ServerMessage::FlagUpdate {
                team: self.team,
                carried_by: Some(id),
                position: None,
            },
        }
    }
}

/// What the rules need to know about a player
#[derive(Debug, Clone, Copy)]
pub struct Contender {
    pub id: PlayerId,
    pub team: Team,
    pub eliminated: bool,
    pub carrying: Option<Team>,
    pub position: Vec3,
}

/// Both flags of a match
#[derive(Debug, Clone, PartialEq)]
pub struct Flags {
    flags: TeamPair<Flag>,
}

impl Flags {
    pub fn new(bases: &TeamPair<Vec3>) -> Self {
        Self {
            flags: TeamPair::new(Flag::new(Team::Red, bases.red), Flag::new(Team::Blue, bases.blue)),
        }
    }

    pub fn get(&self, team: Team) -> &Flag {
        self.flags.get(team)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flag> {
        [&self.flags.red, &self.flags.blue].into_iter()
    }

    /// Whether `player` may take `flag_team`'s flag right now
    pub fn can_pickup(&self, flag_team: Team, player: &Contender, radius: f32) -> bool {
        let flag = self.flags.get(flag_team);
        flag.state == FlagState::AtBase
            && player.team != flag_team
            && !player.eliminated
            && player.carrying.is_none()
            && player.position.distance(flag.base) < radius
    }

    /// Flag team `player` would score by capturing now, if any
    pub fn capturable(&self, player: &Contender, radius: f32) -> Option<Team> {
        let enemy = player.team.opponent();
        if player.eliminated || player.carrying != Some(enemy) {
            return None;
        }
        if self.flags.get(enemy).carrier() != Some(player.id) {
            return None;
        }
        let home = self.flags.get(player.team).base;
        let dx = player.position.x - home.x;
        let dz = player.position.z - home.z;
        ((dx * dx + dz * dz).sqrt() < radius).then_some(enemy)
    }

    /// Mark `flag_team`'s flag as carried by `player`.
    ///
    /// Returns false and changes nothing unless the flag is at base.
    pub fn pick_up(&mut self, flag_team: Team, player: PlayerId) -> bool {
        let flag = self.flags.get_mut(flag_team);
        if flag.state != FlagState::AtBase {
            return false;
        }
        flag.state = FlagState::Carried(player);
        true
    }

    /// Snap `flag_team`'s flag back home
    pub fn return_to_base(&mut self, flag_team: Team) {
        self.flags.get_mut(flag_team).state = FlagState::AtBase;
    }

    /// Return whatever `player` carries; yields the flag's team
    pub fn drop_carried_by(&mut self, player: PlayerId) -> Option<Team> {
        for team in Team::ALL {
            let flag = self.flags.get_mut(team);
            if flag.state == FlagState::Carried(player) {
                flag.state = FlagState::AtBase;
                return Some(team);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const PICKUP: f32 = 3.0;
    const CAPTURE: f32 = 5.0;

    fn flags() -> Flags {
        Flags::new(&TeamPair::new(Vec3::new(-45.0, 1.0, 0.0), Vec3::new(45.0, 1.0, 0.0)))
    }

    fn red_at(position: Vec3) -> Contender {
        Contender {
            id: Uuid::new_v4(),
            team: Team::Red,
            eliminated: false,
            carrying: None,
            position,
        }
    }

    #[test]
    fn pickup_requires_enemy_flag_in_radius() {
        let flags = flags();
        let near_blue = red_at(Vec3::new(43.0, 1.0, 0.0));
        assert!(flags.can_pickup(Team::Blue, &near_blue, PICKUP));
        // Own flag
        let near_red = red_at(Vec3::new(-44.0, 1.0, 0.0));
        assert!(!flags.can_pickup(Team::Red, &near_red, PICKUP));
        // Too far
        let far = red_at(Vec3::new(40.0, 1.0, 0.0));
        assert!(!flags.can_pickup(Team::Blue, &far, PICKUP));
        // Pickup radius is 3-D: hovering above the base does not count
        let above = red_at(Vec3::new(45.0, 6.0, 0.0));
        assert!(!flags.can_pickup(Team::Blue, &above, PICKUP));
    }

    #[test]
    fn eliminated_or_loaded_players_cannot_pick_up() {
        let flags = flags();
        let mut p = red_at(Vec3::new(45.0, 1.0, 0.0));
        p.eliminated = true;
        assert!(!flags.can_pickup(Team::Blue, &p, PICKUP));
        p.eliminated = false;
        p.carrying = Some(Team::Blue);
        assert!(!flags.can_pickup(Team::Blue, &p, PICKUP));
    }

    #[test]
    fn carried_flag_cannot_be_picked_up_again() {
        let mut flags = flags();
        let a = red_at(Vec3::new(45.0, 1.0, 0.0));
        let b = red_at(Vec3::new(45.0, 1.0, 1.0));
        assert!(flags.pick_up(Team::Blue, a.id));
        assert!(!flags.can_pickup(Team::Blue, &b, PICKUP));
        assert!(!flags.pick_up(Team::Blue, b.id));
        assert_eq!(flags.get(Team::Blue).carrier(), Some(a.id));
    }

    #[test]
    fn capture_needs_every_condition() {
        let mut flags = flags();
        let mut carrier = red_at(Vec3::new(-44.0, 1.0, 0.0));
        assert!(flags.pick_up(Team::Blue, carrier.id));
        carrier.carrying = Some(Team::Blue);
        assert_eq!(flags.capturable(&carrier, CAPTURE), Some(Team::Blue));

        // Horizontal distance only
        let mut high = carrier;
        high.position.y = 30.0;
        assert_eq!(flags.capturable(&high, CAPTURE), Some(Team::Blue));

        let mut eliminated = carrier;
        eliminated.eliminated = true;
        assert_eq!(flags.capturable(&eliminated, CAPTURE), None);

        let mut far = carrier;
        far.position = Vec3::new(-30.0, 1.0, 0.0);
        assert_eq!(flags.capturable(&far, CAPTURE), None);

        let mut empty_handed = carrier;
        empty_handed.carrying = None;
        assert_eq!(flags.capturable(&empty_handed, CAPTURE), None);

        // Standing at the enemy base with the enemy flag is not a capture
        let mut wrong_base = carrier;
        wrong_base.position = Vec3::new(45.0, 1.0, 0.0);
        assert_eq!(flags.capturable(&wrong_base, CAPTURE), None);
    }

    #[test]
    fn drop_returns_flag_home() {
        let mut flags = flags();
        let a = red_at(Vec3::ZERO);
        flags.pick_up(Team::Blue, a.id);
        assert_eq!(flags.drop_carried_by(a.id), Some(Team::Blue));
        assert_eq!(flags.get(Team::Blue).state, FlagState::AtBase);
        assert_eq!(flags.drop_carried_by(a.id), None);
        match flags.get(Team::Blue).update_message() {
            ServerMessage::FlagUpdate {
                carried_by,
                position,
                ..
            } => {
                assert_eq!(carried_by, None);
                assert_eq!(position, Some(Vec3::new(45.0, 1.0, 0.0)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
