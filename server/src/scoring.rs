//! Attack resolution and score arithmetic.

use crate::error::GameError;
use crate::player::Player;
use shared::{AttackRequest, AttackResult, SCORE_BONUS, SCORE_HIT};

/// Resolves `attack` from `attacker` against `defender`.
///
/// Repeated origins and predictions sent by human players are rejected
/// before either player is touched. Otherwise the defender's board is marked
/// and the origin is recorded on the attacker, hit or miss.
pub fn resolve_attack(
    attacker: &mut Player,
    defender: &mut Player,
    attack: &AttackRequest,
    grid_size: usize,
) -> Result<AttackResult, GameError> {
    let (x, y) = attack.origin;

    if attacker.has_attacked_location(attack.origin) {
        return Err(GameError::BadAttack(format!(
            "location {},{} has already been attacked",
            x, y
        )));
    }

    if !attacker.is_ai() && attack.prediction.is_some() {
        return Err(GameError::bad_payload(
            "\"prediction\" key not allowed in data payload",
        ));
    }

    let bound = grid_size as i64;
    if x < 0 || y < 0 || x >= bound || y >= bound {
        return Err(GameError::BadAttack(format!(
            "location {},{} is outside the {}x{} board",
            x, y, grid_size, grid_size
        )));
    }

    let result = defender.receive_attack(attack.origin);
    attacker.record_attack_result(&result);

    Ok(result)
}

/// Score for a single shot.
///
/// A sink is worth its ship bonus plus the base hit value twice.
pub fn score_for_shot(result: &AttackResult) -> u64 {
    let mut score = 0;

    if result.hit {
        score += SCORE_HIT;

        if let Some(ship) = result.destroyed {
            score += ship.sink_bonus() + SCORE_HIT;
        }
    }

    score
}

pub fn score_for_bonus(hits: u32) -> u64 {
    u64::from(hits) * SCORE_BONUS
}
