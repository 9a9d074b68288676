//! Arena layout: platforms, spawn points and flag bases

use std::path::Path;

use glam::{Quat, Vec3};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ws::protocol::{Team, TeamPair};

/// Name of the built-in arena
pub const DEFAULT_MAP_NAME: &str = "twin_plateaus";

/// An axis-aligned static box vehicles can drive on
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    pub center: Vec3,
    pub half_extents: Vec3,
}

/// Everything the simulation needs to know about an arena
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapData {
    pub name: String,
    pub platforms: Vec<Platform>,
    pub spawns: TeamPair<Vec<Vec3>>,
    pub flag_bases: TeamPair<Vec3>,
}

#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("failed to read map file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse map: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid map: {0}")]
    Invalid(&'static str),
}

impl Default for MapData {
    fn default() -> Self {
        Self {
            name: DEFAULT_MAP_NAME.to_string(),
            platforms: vec![
                // Red plateau
                Platform {
                    center: Vec3::new(-40.0, -1.0, 0.0),
                    half_extents: Vec3::new(20.0, 1.0, 25.0),
                },
                // Blue plateau
                Platform {
                    center: Vec3::new(40.0, -1.0, 0.0),
                    half_extents: Vec3::new(20.0, 1.0, 25.0),
                },
                // Centre bridge
                Platform {
                    center: Vec3::new(0.0, -1.0, 0.0),
                    half_extents: Vec3::new(20.5, 1.0, 6.0),
                },
            ],
            spawns: TeamPair::new(
                vec![
                    Vec3::new(-50.0, 1.0, -8.0),
                    Vec3::new(-50.0, 1.0, 0.0),
                    Vec3::new(-50.0, 1.0, 8.0),
                    Vec3::new(-46.0, 1.0, 14.0),
                ],
                vec![
                    Vec3::new(50.0, 1.0, -8.0),
                    Vec3::new(50.0, 1.0, 0.0),
                    Vec3::new(50.0, 1.0, 8.0),
                    Vec3::new(46.0, 1.0, 14.0),
                ],
            ),
            flag_bases: TeamPair::new(Vec3::new(-45.0, 1.0, 0.0), Vec3::new(45.0, 1.0, 0.0)),
        }
    }
}

impl MapData {
    /// Parse and validate a JSON map
    pub fn from_json(raw: &str) -> Result<Self, MapError> {
        let map: MapData = serde_json::from_str(raw)?;
        map.validate()?;
        Ok(map)
    }

    pub fn validate(&self) -> Result<(), MapError> {
        if self.name.trim().is_empty() {
            return Err(MapError::Invalid("map name is empty"));
        }
        for team in Team::ALL {
            let spawns = self.spawns.get(team);
            if spawns.is_empty() {
                return Err(MapError::Invalid("every team needs at least one spawn point"));
            }
            if !spawns.iter().all(|s| s.is_finite()) {
                return Err(MapError::Invalid("spawn point is not finite"));
            }
            if !self.flag_bases.get(team).is_finite() {
                return Err(MapError::Invalid("flag base is not finite"));
            }
        }
        for platform in &self.platforms {
            if !platform.center.is_finite() || !platform.half_extents.is_finite() {
                return Err(MapError::Invalid("platform is not finite"));
            }
            if platform.half_extents.min_element() <= 0.0 {
                return Err(MapError::Invalid("platform extents must be positive"));
            }
        }
        Ok(())
    }

    /// Pick one of the team's spawn points uniformly at random
    pub fn pick_spawn<R: Rng>(&self, team: Team, rng: &mut R) -> Vec3 {
        let spawns = self.spawns.get(team);
        if spawns.is_empty() {
            return *self.flag_bases.get(team) + Vec3::Y;
        }
        spawns[rng.gen_range(0..spawns.len())]
    }

    /// Orientation at `position` that faces the enemy base.
    ///
    /// Vehicles drive along their local -Z axis.
    pub fn spawn_facing(&self, team: Team, position: Vec3) -> Quat {
        let target = *self.flag_bases.get(team.opponent());
        let dir = Vec3::new(target.x - position.x, 0.0, target.z - position.z);
        if dir.length_squared() < 1e-6 {
            return Quat::IDENTITY;
        }
        Quat::from_rotation_y((-dir.x).atan2(-dir.z))
    }
}

/// Load the arena from `path`, falling back to the built-in map.
///
/// A missing or broken map must never prevent a match from starting.
pub fn load_or_default(path: Option<&Path>) -> MapData {
    let Some(path) = path else {
        info!(map = DEFAULT_MAP_NAME, "No map configured, using built-in map");
        return MapData::default();
    };

    match std::fs::read_to_string(path)
        .map_err(MapError::from)
        .and_then(|raw| MapData::from_json(&raw))
    {
        Ok(map) => {
            info!(map = %map.name, path = %path.display(), "Loaded map");
            map
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Falling back to built-in map");
            MapData::default()
        }
    }
}
