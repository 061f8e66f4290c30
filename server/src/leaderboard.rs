//! Top scores across every match played on this replica.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HighScoreEntry {
    pub match_id: String,
    pub player_id: String,
    pub human: bool,
    pub username: String,
    pub score: u64,
    pub updated_at: u64,
}

impl HighScoreEntry {
    fn is_same_slot(&self, other: &HighScoreEntry) -> bool {
        self.match_id == other.match_id && self.player_id == other.player_id
    }
}

/// Bounded list of the highest scores, highest first
#[derive(Debug, Clone)]
pub struct Leaderboard {
    entries: Vec<HighScoreEntry>,
    capacity: usize,
}

pub type SharedLeaderboard = Arc<RwLock<Leaderboard>>;

impl Leaderboard {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn shared(capacity: usize) -> SharedLeaderboard {
        Arc::new(RwLock::new(Self::new(capacity)))
    }

    /// Records the latest total for a (match, player) pair.
    ///
    /// An existing entry for the pair is updated in place. Otherwise the entry
    /// is inserted while there is room, or replaces the lowest score when it
    /// beats it. Returns whether the list changed.
    pub fn record(&mut self, entry: HighScoreEntry) -> bool {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.is_same_slot(&entry)) {
            existing.score = entry.score;
            existing.updated_at = entry.updated_at;
        } else if self.entries.len() < self.capacity {
            self.entries.push(entry);
        } else {
            match self.entries.last() {
                Some(lowest) if lowest.score < entry.score => {
                    self.entries.pop();
                    self.entries.push(entry);
                }
                _ => return false,
            }
        }

        // Stable, so ties keep their insertion order
        self.entries.sort_by(|a, b| b.score.cmp(&a.score));
        true
    }

    pub fn entries(&self) -> &[HighScoreEntry] {
        &self.entries
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// JSON array sent to leaderboard feed subscribers
    pub fn snapshot_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.entries)
    }
}
