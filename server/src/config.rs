//! Process configuration.
//!
//! Every option can be given as a command line flag or through the
//! environment variable named next to it, so containerised replicas can be
//! configured without changing their command.

use crate::error::ServerError;
use clap::Parser;
use shared::{ShipType, DEFAULT_GRID_SIZE, HIGH_SCORE_ENTRY_COUNT};
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Config {
    /// Server IP address to bind to
    #[clap(short = 'H', long, env = "GAME_SERVER_HOST", default_value = "127.0.0.1")]
    pub host: String,
    /// Port for game connections
    #[clap(short, long, env = "HTTP_PORT", default_value = "8080")]
    pub port: u16,
    /// Port for the read-only leaderboard feed
    #[clap(long, env = "LEADERBOARD_PORT", default_value = "8181")]
    pub leaderboard_port: u16,
    /// Label attached to published events
    #[clap(long, env = "CLUSTER_NAME", default_value = "local")]
    pub cluster_name: String,
    /// Game epoch id shared by all replicas; generated when absent
    #[clap(long, env = "GAME_ID")]
    pub game_id: Option<String>,
    /// Width and height of the board
    #[clap(long, env = "GAME_GRID_SIZE", default_value_t = DEFAULT_GRID_SIZE)]
    pub grid_size: usize,
    /// Duration of a bonus round in milliseconds
    #[clap(long, env = "GAME_BONUS_DURATION_MS", default_value = "5000")]
    pub bonus_duration_ms: u64,
    /// Maximum hits a player may report for one bonus round
    #[clap(long, env = "GAME_MAX_BONUS_HITS", default_value = "100")]
    pub max_bonus_hits: u32,
    /// Time to live of cached player and match records
    #[clap(long, env = "CACHE_TTL_SECS", default_value = "3600")]
    pub cache_ttl_secs: u64,
    /// Idle connections are closed after this many milliseconds
    #[clap(long, env = "WS_ACTIVITY_TIMEOUT_MS", default_value = "1800000")]
    pub activity_timeout_ms: u64,
    /// Frames larger than this many bytes are rejected
    #[clap(long, env = "WS_MAX_PAYLOAD", default_value = "2048")]
    pub max_payload: usize,
    /// Maximum concurrent connections on this replica
    #[clap(long, env = "MAX_CONNECTIONS", default_value = "1024")]
    pub max_connections: usize,
    /// Number of entries kept on the leaderboard
    #[clap(long, env = "LEADERBOARD_SIZE", default_value_t = HIGH_SCORE_ENTRY_COUNT)]
    pub leaderboard_size: usize,
    /// Service that provisions programmatic opponents
    #[clap(long, env = "AI_AGENT_SERVER_URL", default_value = "http://shipwars-bot-server:8080")]
    pub ai_agent_server_url: String,
    /// Hostname programmatic opponents use to reach this service
    #[clap(long, env = "SVC_HOSTNAME", default_value = "shipwars-game-server")]
    pub svc_hostname: String,
}

/// Rule settings handed to message handlers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameSettings {
    pub grid_size: usize,
    pub max_bonus_hits: u32,
    /// Handed to provisioned opponents so they can connect back
    pub agent_ws_url: String,
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            grid_size: DEFAULT_GRID_SIZE,
            max_bonus_hits: 100,
            agent_ws_url: "ws://localhost:8080/shipwars/game".to_string(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ServerError> {
        let longest = ShipType::ALL.iter().map(|s| s.size()).max().unwrap_or(0);

        if self.grid_size < longest {
            return Err(ServerError::InvalidConfig(format!(
                "grid size {} cannot fit a ship of length {}",
                self.grid_size, longest
            )));
        }

        if self.max_payload == 0 {
            return Err(ServerError::InvalidConfig(
                "max payload must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn game_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn leaderboard_address(&self) -> String {
        format!("{}:{}", self.host, self.leaderboard_port)
    }

    /// URL programmatic opponents are told to connect back on
    pub fn agent_ws_url(&self) -> String {
        format!("ws://{}:{}/shipwars/game", self.svc_hostname, self.port)
    }

    pub fn game_settings(&self) -> GameSettings {
        GameSettings {
            grid_size: self.grid_size,
            max_bonus_hits: self.max_bonus_hits,
            agent_ws_url: self.agent_ws_url(),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn activity_timeout(&self) -> Duration {
        Duration::from_millis(self.activity_timeout_ms)
    }
}
