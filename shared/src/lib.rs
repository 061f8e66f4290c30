//! Wire protocol and board types shared between the game server and clients.
//!
//! Everything a client sends or receives over a connection is defined here:
//! the `{type, data}` envelope, the incoming payload shapes, the outgoing
//! message enum and the configuration views a player is allowed to see.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const DEFAULT_GRID_SIZE: usize = 5;
pub const SCORE_HIT: u64 = 5;
pub const SCORE_BONUS: u64 = 5;
pub const HIGH_SCORE_ENTRY_COUNT: usize = 20;

/// A cell coordinate as `[x, y]` on the wire.
pub type CellPosition = (i64, i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShipType {
    Carrier,
    Battleship,
    Submarine,
    Destroyer,
}

impl ShipType {
    pub const ALL: [ShipType; 4] = [
        ShipType::Carrier,
        ShipType::Battleship,
        ShipType::Submarine,
        ShipType::Destroyer,
    ];

    /// Number of cells the ship occupies
    pub fn size(self) -> usize {
        match self {
            ShipType::Carrier => 4,
            ShipType::Battleship => 3,
            ShipType::Submarine => 2,
            ShipType::Destroyer => 1,
        }
    }

    /// Extra score awarded for destroying this ship
    pub fn sink_bonus(self) -> u64 {
        match self {
            ShipType::Carrier => 250,
            ShipType::Battleship => 200,
            ShipType::Submarine => 150,
            ShipType::Destroyer => 100,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ShipType::Carrier => "carrier",
            ShipType::Battleship => "battleship",
            ShipType::Submarine => "submarine",
            ShipType::Destroyer => "destroyer",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ship| ship.name() == name)
    }
}

impl fmt::Display for ShipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Total cells a complete, valid board occupies
pub fn expected_occupied_cells() -> usize {
    ShipType::ALL.iter().map(|ship| ship.size()).sum()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Horizontal,
    Vertical,
}

impl Orientation {
    /// Offset between consecutive cells of a ship
    pub fn step(self) -> (i64, i64) {
        match self {
            Orientation::Horizontal => (1, 0),
            Orientation::Vertical => (0, 1),
        }
    }
}

/// Returns the cells covered by a ship of `size` placed at `origin`.
/// Coordinates saturate at the `i64` limits, which lie outside any grid.
pub fn cells_covered(origin: CellPosition, orientation: Orientation, size: usize) -> Vec<CellPosition> {
    let (dx, dy) = orientation.step();
    (0..size as i64)
        .map(|i| (origin.0.saturating_add(dx * i), origin.1.saturating_add(dy * i)))
        .collect()
}

/// A single ship entry of a placement submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShipPlacement {
    pub origin: CellPosition,
    pub orientation: Orientation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipCell {
    pub origin: CellPosition,
    pub hit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipData {
    pub origin: CellPosition,
    pub orientation: Orientation,
    pub cells: Vec<ShipCell>,
}

impl ShipData {
    pub fn new(ship_type: ShipType, placement: ShipPlacement) -> Self {
        let cells = cells_covered(placement.origin, placement.orientation, ship_type.size())
            .into_iter()
            .map(|origin| ShipCell { origin, hit: false })
            .collect();

        Self {
            origin: placement.origin,
            orientation: placement.orientation,
            cells,
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.cells.iter().all(|cell| cell.hit)
    }
}

/// A player's ship layout with per-cell hit marks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    pub ships: BTreeMap<ShipType, ShipData>,
}

impl Board {
    pub fn from_placements(placements: BTreeMap<ShipType, ShipPlacement>) -> Self {
        let ships = placements
            .into_iter()
            .map(|(ship_type, placement)| (ship_type, ShipData::new(ship_type, placement)))
            .collect();

        Self { ships }
    }

    pub fn occupant_at(&self, origin: CellPosition) -> Option<ShipType> {
        self.ships
            .iter()
            .find(|(_, ship)| ship.cells.iter().any(|cell| cell.origin == origin))
            .map(|(ship_type, _)| *ship_type)
    }

    /// Marks the cell at `origin` as hit and reports the outcome.
    ///
    /// `destroyed` is only set when this attack hit the last unhit cell of
    /// a ship. Hitting an already-hit cell reports a hit without a sink.
    pub fn receive_attack(&mut self, origin: CellPosition) -> AttackResult {
        for (ship_type, ship) in self.ships.iter_mut() {
            if let Some(cell) = ship.cells.iter_mut().find(|cell| cell.origin == origin) {
                let was_hit = cell.hit;
                cell.hit = true;

                let destroyed = (!was_hit && ship.is_destroyed()).then_some(*ship_type);
                return AttackResult {
                    hit: true,
                    origin,
                    destroyed,
                };
            }
        }

        AttackResult::miss(origin)
    }

    /// True when the board has ships and every cell of every ship is hit
    pub fn all_ships_destroyed(&self) -> bool {
        !self.ships.is_empty() && self.ships.values().all(ShipData::is_destroyed)
    }

    pub fn destroyed_ships(&self) -> Vec<ShipType> {
        self.ships
            .iter()
            .filter(|(_, ship)| ship.is_destroyed())
            .map(|(ship_type, _)| *ship_type)
            .collect()
    }

    pub fn occupied_cells(&self) -> usize {
        self.ships.values().map(|ship| ship.cells.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttackResult {
    pub hit: bool,
    pub origin: CellPosition,
    pub destroyed: Option<ShipType>,
}

impl AttackResult {
    pub fn miss(origin: CellPosition) -> Self {
        Self {
            hit: false,
            origin,
            destroyed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameState {
    Active,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPhase {
    Placement,
    Active,
    Bonus,
    Complete,
}

// Incoming messages

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingMsgType {
    Connection,
    ShipPositions,
    Attack,
    Bonus,
}

impl IncomingMsgType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "connection" => Some(IncomingMsgType::Connection),
            "ship-positions" => Some(IncomingMsgType::ShipPositions),
            "attack" => Some(IncomingMsgType::Attack),
            "bonus" => Some(IncomingMsgType::Bonus),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            IncomingMsgType::Connection => "connection",
            IncomingMsgType::ShipPositions => "ship-positions",
            IncomingMsgType::Attack => "attack",
            IncomingMsgType::Bonus => "bonus",
        }
    }
}

/// Raw `{type, data}` frame received from a connection
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    /// Parses a frame, requiring `data` to be an object when present
    pub fn parse(text: &str) -> Result<Self, String> {
        let envelope: Envelope = serde_json::from_str(text).map_err(|e| e.to_string())?;

        if !(envelope.data.is_object() || envelope.data.is_null()) {
            return Err("\"data\" must be an object".to_string());
        }

        Ok(envelope)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRequest {
    #[serde(default)]
    pub game_id: Option<String>,
    #[serde(default)]
    pub player_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttackRequest {
    pub origin: CellPosition,
    #[serde(default)]
    pub prediction: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BonusRequest {
    pub hits: u32,
}

// Outgoing messages

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerView {
    pub uuid: String,
    pub username: String,
    pub is_ai: bool,
    pub board: Option<Board>,
    pub score: u64,
    pub shots_fired: u32,
    pub consecutive_hits: u32,
    pub attacks: Vec<CellPosition>,
}

/// What a player may know about their opponent. Ship positions stay hidden.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpponentView {
    pub uuid: String,
    pub username: String,
    pub is_ai: bool,
    pub score: u64,
    pub destroyed: Vec<ShipType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchView {
    pub uuid: String,
    pub phase: MatchPhase,
    pub ready: bool,
    pub turn: String,
    pub winner: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameView {
    pub uuid: String,
    pub state: GameState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerConfiguration {
    pub game: GameView,
    pub player: PlayerView,
    pub opponent: Option<OpponentView>,
    #[serde(rename = "match")]
    pub match_state: Option<MatchView>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationInfo {
    pub info: String,
    #[serde(default)]
    pub reasons: Vec<String>,
}

impl ValidationInfo {
    pub fn new(info: impl Into<String>) -> Self {
        Self {
            info: info.into(),
            reasons: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttackResponse {
    /// Id of the player that performed the attack
    pub attacker: String,
    pub result: AttackResult,
    #[serde(flatten)]
    pub configuration: PlayerConfiguration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreUpdate {
    pub delta: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum OutgoingMessage {
    ConnectionAccepted(PlayerConfiguration),
    BadPayload(ValidationInfo),
    BadAttack(ValidationInfo),
    BadMessageType(ValidationInfo),
    ServerError(ValidationInfo),
    AttackResult(AttackResponse),
    BonusResult(PlayerConfiguration),
    ScoreUpdate(ScoreUpdate),
    Configuration(PlayerConfiguration),
}

impl OutgoingMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            OutgoingMessage::ConnectionAccepted(_) => "connection-accepted",
            OutgoingMessage::BadPayload(_) => "bad-payload",
            OutgoingMessage::BadAttack(_) => "bad-attack",
            OutgoingMessage::BadMessageType(_) => "bad-message-type",
            OutgoingMessage::ServerError(_) => "server-error",
            OutgoingMessage::AttackResult(_) => "attack-result",
            OutgoingMessage::BonusResult(_) => "bonus-result",
            OutgoingMessage::ScoreUpdate(_) => "score-update",
            OutgoingMessage::Configuration(_) => "configuration",
        }
    }
}
