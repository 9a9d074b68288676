//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed client origins for CORS (comma-separated, `*` for any)
    pub client_origin: String,
    /// Optional JSON map loaded at startup
    pub map_path: Option<PathBuf>,
    /// How many times physics initialization is attempted before giving up
    pub physics_init_attempts: u32,
    /// Gameplay tunables
    pub game: GameConfig,
}

/// Gameplay tunables shared by the match and its subsystems
#[derive(Clone, Debug, PartialEq)]
pub struct GameConfig {
    pub min_players: usize,
    pub max_players: usize,
    /// Captures needed to win
    pub win_score: u32,
    /// 3-D distance within which an enemy flag at base can be grabbed
    pub pickup_radius: f32,
    /// Horizontal distance from the carrier's own base that scores a capture
    pub capture_radius: f32,
    /// Vehicles below this height are eliminated
    pub death_y: f32,
    pub respawn_delay_ms: u64,
    pub invincibility_ms: u64,
    /// Delay between the winning capture and `gameEnd`
    pub capture_ack_delay_ms: u64,
    /// Time spent in `Ended` before the match resets to `Lobby`
    pub end_cooldown_ms: u64,
    /// Handling multiplier applied while carrying a flag
    pub carry_handling: f32,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            min_players: 2,
            max_players: 8,
            win_score: 3,
            pickup_radius: 3.0,
            capture_radius: 5.0,
            death_y: -50.0,
            respawn_delay_ms: 3000,
            invincibility_ms: 2000,
            capture_ack_delay_ms: 1500,
            end_cooldown_ms: 5000,
            carry_handling: 0.7,
        }
    }
}

impl GameConfig {
    /// Load tunables, falling back to defaults for unset variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            min_players: parse_var("MIN_PLAYERS", defaults.min_players)?,
            max_players: parse_var("MAX_PLAYERS", defaults.max_players)?,
            win_score: parse_var("WIN_SCORE", defaults.win_score)?,
            pickup_radius: parse_var("PICKUP_RADIUS", defaults.pickup_radius)?,
            capture_radius: parse_var("CAPTURE_RADIUS", defaults.capture_radius)?,
            death_y: parse_var("DEATH_Y", defaults.death_y)?,
            respawn_delay_ms: parse_var("RESPAWN_DELAY_MS", defaults.respawn_delay_ms)?,
            invincibility_ms: parse_var("INVINCIBILITY_MS", defaults.invincibility_ms)?,
            capture_ack_delay_ms: parse_var("CAPTURE_ACK_DELAY_MS", defaults.capture_ack_delay_ms)?,
            end_cooldown_ms: parse_var("END_COOLDOWN_MS", defaults.end_cooldown_ms)?,
            carry_handling: parse_var("CARRY_HANDLING", defaults.carry_handling)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the match state machine cannot honor
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_players < 2 {
            return Err(ConfigError::Invalid("MIN_PLAYERS must be at least 2"));
        }
        if self.max_players < self.min_players {
            return Err(ConfigError::Invalid("MAX_PLAYERS must be >= MIN_PLAYERS"));
        }
        if self.win_score == 0 {
            return Err(ConfigError::Invalid("WIN_SCORE must be at least 1"));
        }
        if !(self.pickup_radius.is_finite() && self.pickup_radius > 0.0) {
            return Err(ConfigError::Invalid("PICKUP_RADIUS must be a positive number"));
        }
        if !(self.capture_radius.is_finite() && self.capture_radius > 0.0) {
            return Err(ConfigError::Invalid("CAPTURE_RADIUS must be a positive number"));
        }
        if !self.death_y.is_finite() {
            return Err(ConfigError::Invalid("DEATH_Y must be finite"));
        }
        if !(self.carry_handling > 0.0 && self.carry_handling <= 1.0) {
            return Err(ConfigError::Invalid("CARRY_HANDLING must be in (0, 1]"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_level: "info".to_string(),
            client_origin: "*".to_string(),
            map_path: None,
            physics_init_attempts: 3,
            game: GameConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Render provides PORT env var, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            client_origin: env::var("CLIENT_ORIGIN").unwrap_or_else(|_| "*".to_string()),
            map_path: env::var("MAP_PATH").ok().map(PathBuf::from),
            physics_init_attempts: parse_var("PHYSICS_INIT_ATTEMPTS", 3)?.max(1),
            game: GameConfig::from_env()?,
        })
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Malformed(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Malformed value for environment variable: {0}")]
    Malformed(&'static str),

    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(GameConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_player_bounds() {
        let config = GameConfig {
            min_players: 4,
            max_players: 2,
            ..GameConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_non_positive_radius() {
        let config = GameConfig {
            capture_radius: 0.0,
            ..GameConfig::default()
        };
        assert!(config.validate().is_err());

        let config = GameConfig {
            pickup_radius: f32::NAN,
            ..GameConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
