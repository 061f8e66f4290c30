use serde::{Deserialize, Serialize};
use shared::{AttackResult, Board, CellPosition, OpponentView, PlayerView};

/// A match participant as persisted in the cache store.
///
/// Every mutation made through these methods must be followed by a write to
/// the store; handlers never keep a `Player` around between messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    uuid: String,
    username: String,
    is_ai: bool,
    #[serde(rename = "match")]
    match_id: String,
    board: Option<Board>,
    score: u64,
    shots_fired: u32,
    consecutive_hits: u32,
    attacked_origins: Vec<CellPosition>,
}

impl Player {
    /// Creates a player without a board or score
    pub fn new(
        uuid: impl Into<String>,
        username: impl Into<String>,
        is_ai: bool,
        match_id: impl Into<String>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            username: username.into(),
            is_ai,
            match_id: match_id.into(),
            board: None,
            score: 0,
            shots_fired: 0,
            consecutive_hits: 0,
            attacked_origins: Vec::new(),
        }
    }

    /// Unique id of the player
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Display name, also checked on reconnect
    pub fn username(&self) -> &str {
        &self.username
    }

    /// True for programmatic opponents
    pub fn is_ai(&self) -> bool {
        self.is_ai
    }

    /// Match this player belongs to
    pub fn match_id(&self) -> &str {
        &self.match_id
    }

    /// Locked board, if ships were placed
    pub fn board(&self) -> Option<&Board> {
        self.board.as_ref()
    }

    /// Running score for the match
    pub fn score(&self) -> u64 {
        self.score
    }

    /// Number of attacks made
    pub fn shots_fired(&self) -> u32 {
        self.shots_fired
    }

    /// Current streak of hits
    pub fn consecutive_hits(&self) -> u32 {
        self.consecutive_hits
    }

    /// Cells this player has attacked, in order
    pub fn attacked_origins(&self) -> &[CellPosition] {
        &self.attacked_origins
    }

    /// True once a valid placement was accepted
    pub fn has_locked_ship_positions(&self) -> bool {
        self.board.is_some()
    }

    /// Locks `board` as this player's placement
    pub fn set_ship_positions(&mut self, board: Board) {
        self.board = Some(board);
    }

    /// True after the first attack
    pub fn has_attacked(&self) -> bool {
        !self.attacked_origins.is_empty()
    }

    /// Whether `origin` was already attacked by this player
    pub fn has_attacked_location(&self, origin: CellPosition) -> bool {
        self.attacked_origins.contains(&origin)
    }

    /// Applies an incoming attack to this player's board
    pub fn receive_attack(&mut self, origin: CellPosition) -> AttackResult {
        match self.board.as_mut() {
            Some(board) => board.receive_attack(origin),
            None => AttackResult::miss(origin),
        }
    }

    /// Records the outcome of an attack this player made
    pub fn record_attack_result(&mut self, result: &AttackResult) {
        if !self.has_attacked_location(result.origin) {
            self.attacked_origins.push(result.origin);
        }

        self.shots_fired += 1;
        self.consecutive_hits = if result.hit {
            self.consecutive_hits + 1
        } else {
            0
        };
    }

    /// Adds `delta` to the score and returns the new total
    pub fn increment_score_by(&mut self, delta: u64) -> u64 {
        self.score = self.score.saturating_add(delta);
        self.score
    }

    /// Full view sent to the player themselves
    pub fn to_view(&self) -> PlayerView {
        PlayerView {
            uuid: self.uuid.clone(),
            username: self.username.clone(),
            is_ai: self.is_ai,
            board: self.board.clone(),
            score: self.score,
            shots_fired: self.shots_fired,
            consecutive_hits: self.consecutive_hits,
            attacks: self.attacked_origins.clone(),
        }
    }

    /// Public view sent to the opponent
    pub fn to_opponent_view(&self) -> OpponentView {
        OpponentView {
            uuid: self.uuid.clone(),
            username: self.username.clone(),
            is_ai: self.is_ai,
            score: self.score,
            destroyed: self
                .board
                .as_ref()
                .map(Board::destroyed_ships)
                .unwrap_or_default(),
        }
    }
}
