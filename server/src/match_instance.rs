use crate::error::GameError;
use crate::utils::generate_id;
use serde::{Deserialize, Serialize};
use shared::{MatchPhase, MatchView};

/// A two player match as persisted in the cache store.
///
/// Phases run `Placement -> Active -> (Bonus -> Active)* -> Complete`.
/// The turn always belongs to one of the two participants and the winner
/// can only be assigned once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchInstance {
    uuid: String,
    game: String,
    player_a: String,
    player_b: String,
    turn: String,
    phase: MatchPhase,
    ready: bool,
    winner: Option<String>,
}

impl MatchInstance {
    /// Creates a match in the placement phase. `player_a` moves first.
    pub fn new(game: impl Into<String>, player_a: impl Into<String>, player_b: impl Into<String>) -> Self {
        let player_a = player_a.into();

        Self {
            uuid: generate_id(),
            game: game.into(),
            turn: player_a.clone(),
            player_a,
            player_b: player_b.into(),
            phase: MatchPhase::Placement,
            ready: false,
            winner: None,
        }
    }

    /// Unique id of the match
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Game epoch the match was created in
    pub fn game(&self) -> &str {
        &self.game
    }

    /// The human participant
    pub fn player_a(&self) -> &str {
        &self.player_a
    }

    /// The programmatic participant
    pub fn player_b(&self) -> &str {
        &self.player_b
    }

    /// Player whose move it is
    pub fn turn(&self) -> &str {
        &self.turn
    }

    /// Current phase of play
    pub fn phase(&self) -> MatchPhase {
        self.phase
    }

    /// Winner, once the match is complete
    pub fn winner(&self) -> Option<&str> {
        self.winner.as_deref()
    }

    /// Whether the match was created in epoch `game`
    pub fn belongs_to_game(&self, game: &str) -> bool {
        self.game == game
    }

    /// Whether `player` plays in this match
    pub fn is_participant(&self, player: &str) -> bool {
        self.player_a == player || self.player_b == player
    }

    /// The other participant, or `None` for strangers
    pub fn opponent_of(&self, player: &str) -> Option<&str> {
        if self.player_a == player {
            Some(&self.player_b)
        } else if self.player_b == player {
            Some(&self.player_a)
        } else {
            None
        }
    }

    /// Whether `player` holds the turn
    pub fn is_player_turn(&self, player: &str) -> bool {
        self.turn == player
    }

    /// Whether the match is currently in `phase`
    pub fn is_in_phase(&self, phase: MatchPhase) -> bool {
        self.phase == phase
    }

    /// True once both boards are locked
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// True once a winner is set
    pub fn is_complete(&self) -> bool {
        self.phase == MatchPhase::Complete
    }

    /// Both boards are locked: attacks may begin. Returns false if the match
    /// was already ready.
    pub fn set_ready(&mut self) -> bool {
        if self.ready {
            return false;
        }

        self.ready = true;
        if self.phase == MatchPhase::Placement {
            self.phase = MatchPhase::Active;
        }
        true
    }

    /// Passes the turn to the other participant
    pub fn change_turn(&mut self) {
        self.turn = if self.turn == self.player_a {
            self.player_b.clone()
        } else {
            self.player_a.clone()
        };
    }

    /// Ends the match. The turn is left with the winner.
    pub fn set_winner(&mut self, player: &str) -> Result<(), GameError> {
        if let Some(existing) = &self.winner {
            return Err(GameError::invariant(format!(
                "match {} already has winner {}, refusing to assign {}",
                self.uuid, existing, player
            )));
        }

        if !self.is_participant(player) {
            return Err(GameError::invariant(format!(
                "player {} is not a participant of match {}",
                player, self.uuid
            )));
        }

        self.winner = Some(player.to_string());
        self.phase = MatchPhase::Complete;
        Ok(())
    }

    /// Entry point for the lifecycle driver that schedules bonus rounds
    pub fn enter_bonus_round(&mut self) -> Result<(), GameError> {
        if !self.ready || self.phase != MatchPhase::Active {
            return Err(GameError::invariant(format!(
                "match {} cannot enter a bonus round from phase {:?} (ready={})",
                self.uuid, self.phase, self.ready
            )));
        }

        self.phase = MatchPhase::Bonus;
        Ok(())
    }

    /// Returns to regular play after the turn holder submitted their bonus
    pub fn finish_bonus_round(&mut self) {
        if self.phase == MatchPhase::Bonus {
            self.phase = MatchPhase::Active;
            self.change_turn();
        }
    }

    /// Client-facing view of the match
    pub fn to_view(&self) -> MatchView {
        MatchView {
            uuid: self.uuid.clone(),
            phase: self.phase,
            ready: self.ready,
            turn: self.turn.clone(),
            winner: self.winner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_match() -> MatchInstance {
        MatchInstance::new("game", "human", "bot")
    }

    #[test]
    fn test_new_match_waits_for_placement() {
        let instance = new_match();

        assert!(instance.is_in_phase(MatchPhase::Placement));
        assert!(!instance.is_ready());
        assert!(instance.is_player_turn("human"));
        assert_eq!(instance.opponent_of("human"), Some("bot"));
        assert_eq!(instance.opponent_of("bot"), Some("human"));
        assert_eq!(instance.opponent_of("stranger"), None);
    }

    #[test]
    fn test_set_ready_is_idempotent() {
        let mut instance = new_match();

        assert!(instance.set_ready());
        assert!(instance.is_in_phase(MatchPhase::Active));
        assert!(!instance.set_ready());
        assert!(instance.is_ready());
    }

    #[test]
    fn test_turn_alternates() {
        let mut instance = new_match();

        instance.change_turn();
        assert!(instance.is_player_turn("bot"));
        instance.change_turn();
        assert!(instance.is_player_turn("human"));
    }

    #[test]
    fn test_winner_is_set_once() {
        let mut instance = new_match();
        instance.set_ready();

        assert!(instance.set_winner("human").is_ok());
        assert!(instance.is_complete());
        assert_eq!(instance.winner(), Some("human"));
        assert!(instance.is_player_turn("human"));

        let second = instance.set_winner("bot");
        assert!(matches!(second, Err(GameError::Invariant(_))));
        assert_eq!(instance.winner(), Some("human"));
    }

    #[test]
    fn test_winner_must_be_participant() {
        let mut instance = new_match();
        assert!(instance.set_winner("stranger").is_err());
        assert!(!instance.is_complete());
    }

    #[test]
    fn test_bonus_round_cycle() {
        let mut instance = new_match();
        assert!(instance.enter_bonus_round().is_err());

        instance.set_ready();
        assert!(instance.enter_bonus_round().is_ok());
        assert!(instance.is_in_phase(MatchPhase::Bonus));
        assert!(instance.enter_bonus_round().is_err());

        instance.finish_bonus_round();
        assert!(instance.is_in_phase(MatchPhase::Active));
        assert!(instance.is_player_turn("bot"));
    }
}
