use crate::utils::{generate_id, get_timestamp};
use serde::{Deserialize, Serialize};
use shared::{GameState, GameView};

/// One running game epoch.
///
/// Created once at startup and handed to every handler and listener behind
/// an `Arc`. Reconnects and turn submissions are only honoured for matches
/// that belong to the current epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameConfiguration {
    uuid: String,
    date: u64,
    state: GameState,
    bonus_duration_ms: u64,
    cluster: String,
}

impl GameConfiguration {
    pub fn new(uuid: Option<String>, bonus_duration_ms: u64, cluster: impl Into<String>) -> Self {
        Self {
            uuid: uuid.unwrap_or_else(generate_id),
            date: get_timestamp(),
            state: GameState::Active,
            bonus_duration_ms,
            cluster: cluster.into(),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn date(&self) -> u64 {
        self.date
    }

    pub fn state(&self) -> GameState {
        self.state
    }

    pub fn is_in_state(&self, state: GameState) -> bool {
        self.state == state
    }

    pub fn bonus_duration_ms(&self) -> u64 {
        self.bonus_duration_ms
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn to_view(&self) -> GameView {
        GameView {
            uuid: self.uuid.clone(),
            state: self.state,
        }
    }
}
