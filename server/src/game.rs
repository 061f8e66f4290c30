//! Ship placement validation and game-over detection.
//!
//! A placement submission is checked in three passes and every problem found
//! is reported, not only the first:
//!
//! 1. Schema: the payload is an object keyed by ship type, each value is
//!    `{origin: [x, y], orientation}` and every ship type is present.
//! 2. Occupancy: each ship increments the cells it covers on an NxN counter
//!    grid. Cells outside the grid and cells counted twice are rejected.
//! 3. Total: the number of occupied cells must equal the sum of all ship
//!    lengths, which catches anything the grid pass could mask.

use crate::player::Player;
use log::trace;
use serde_json::Value;
use shared::{
    cells_covered, expected_occupied_cells, Board, CellPosition, ShipPlacement, ShipType,
};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlacementError {
    #[error("ship placement must be an object keyed by ship type")]
    NotAnObject,

    #[error("\"{0}\" is not a known ship type")]
    UnknownShip(String),

    #[error("\"{0}\" is required")]
    MissingShip(ShipType),

    #[error("\"{ship}\" is malformed: {reason}")]
    MalformedShip { ship: String, reason: String },

    #[error("{ship} is over the edge of the board at [{}, {}]", .cell.0, .cell.1)]
    OutOfBounds { ship: ShipType, cell: CellPosition },

    #[error("ships are overlapping at grid [{}, {}]", .cell.0, .cell.1)]
    Overlap { cell: CellPosition },

    #[error("{found} grid positions were occupied, but {expected} was the expected value")]
    OccupiedCount { found: usize, expected: usize },
}

/// Validates a raw placement payload for a `grid_size` x `grid_size` board
pub fn validate_ship_placement(data: &Value, grid_size: usize) -> Result<Board, Vec<PlacementError>> {
    let Some(entries) = data.as_object() else {
        return Err(vec![PlacementError::NotAnObject]);
    };

    let mut errors = Vec::new();
    let mut placements = BTreeMap::new();

    for (key, value) in entries {
        let Some(ship_type) = ShipType::from_name(key) else {
            errors.push(PlacementError::UnknownShip(key.clone()));
            continue;
        };

        match serde_json::from_value::<ShipPlacement>(value.clone()) {
            Ok(placement) => {
                placements.insert(ship_type, placement);
            }
            Err(e) => errors.push(PlacementError::MalformedShip {
                ship: key.clone(),
                reason: e.to_string(),
            }),
        }
    }

    for ship_type in ShipType::ALL {
        if !entries.contains_key(ship_type.name()) {
            errors.push(PlacementError::MissingShip(ship_type));
        }
    }

    let mut grid = vec![vec![0u32; grid_size]; grid_size];
    let bound = grid_size as i64;

    for (ship_type, placement) in &placements {
        for (x, y) in cells_covered(placement.origin, placement.orientation, ship_type.size()) {
            if x < 0 || y < 0 || x >= bound || y >= bound {
                errors.push(PlacementError::OutOfBounds {
                    ship: *ship_type,
                    cell: (x, y),
                });
                break;
            }

            grid[y as usize][x as usize] += 1;
        }
    }

    let mut occupied = 0;
    for (y, row) in grid.iter().enumerate() {
        for (x, count) in row.iter().enumerate() {
            if *count > 1 {
                errors.push(PlacementError::Overlap {
                    cell: (x as i64, y as i64),
                });
            }
            if *count != 0 {
                occupied += 1;
            }
        }
    }

    let expected = expected_occupied_cells();
    if occupied != expected {
        errors.push(PlacementError::OccupiedCount {
            found: occupied,
            expected,
        });
    }

    if errors.is_empty() {
        Ok(Board::from_placements(placements))
    } else {
        trace!("rejected ship placement {} with errors {:?}", data, errors);
        Err(errors)
    }
}

/// A player has lost once every cell of every ship has been hit.
/// A player without a board never has.
pub fn is_game_over(player: &Player) -> bool {
    trace!("checking if player {} lost their match", player.uuid());

    player
        .board()
        .map(Board::all_ships_destroyed)
        .unwrap_or(false)
}
