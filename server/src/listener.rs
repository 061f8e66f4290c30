//! Convergence listener.
//!
//! Both players lock their boards independently, possibly on different
//! replicas, so no single request handler ever sees both locks happen. Each
//! replica instead watches the cache store's change feed and re-evaluates
//! the affected match whenever a player or match record is modified:
//!
//! * a player modify may complete the pair of locked boards, in which case
//!   this replica marks the match ready, persists it and publishes the match
//!   start;
//! * once a match is ready, and before either side has attacked, every
//!   replica tells its own connected participants exactly once.
//!
//! Every decision starts from a fresh read of the store, so replaying a
//! notification or seeing the two locks in either order leads to the same
//! outcome.

use crate::client_manager::SharedRegistry;
use crate::epoch::GameConfiguration;
use crate::error::GameError;
use crate::events::{Collaborators, GameEvent};
use crate::handlers::player_configuration;
use crate::match_instance::MatchInstance;
use crate::player::Player;
use crate::store::{CacheStore, ChangeEvent, ChangeOp, RecordKey, Records};
use log::{debug, error, info, trace, warn};
use shared::OutgoingMessage;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// What a single notification led to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    /// Not a notification the listener acts on
    Ignored,
    /// The match is past placement
    Skipped,
    /// Still waiting for the other board to be locked
    Waiting,
    /// Readiness was pushed to `notified` local connections
    Announced { notified: usize },
    /// This replica already told its connections about the match
    AlreadyAnnounced,
}

pub struct ConvergenceListener<S> {
    game: Arc<GameConfiguration>,
    records: Records<S>,
    registry: SharedRegistry,
    collaborators: Collaborators,
    /// Matches whose readiness this replica has already pushed
    announced: HashSet<String>,
}

impl<S: CacheStore> ConvergenceListener<S> {
    pub fn new(
        game: Arc<GameConfiguration>,
        records: Records<S>,
        registry: SharedRegistry,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            game,
            records,
            registry,
            collaborators,
            announced: HashSet::new(),
        }
    }

    /// Consumes the change feed until the store goes away
    pub async fn run(mut self, mut changes: broadcast::Receiver<ChangeEvent>) {
        info!("convergence listener started for game {}", self.game.uuid());

        loop {
            match changes.recv().await {
                Ok(event) => match self.handle_event(&event).await {
                    Ok(outcome) => trace!("{:?} on {} -> {:?}", event.op, event.key, outcome),
                    Err(e) => error!("failed to process {:?} of {}: {}", event.op, event.key, e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        "convergence listener lagged, {} notifications skipped, re-evaluating live matches",
                        skipped
                    );
                    match self.resync().await {
                        Ok(evaluated) => debug!("re-evaluated {} matches after lag", evaluated),
                        Err(e) => error!("failed to re-evaluate matches after lag: {}", e),
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }

        info!("change feed closed, convergence listener stopping");
    }

    pub async fn handle_event(&mut self, event: &ChangeEvent) -> Result<Convergence, GameError> {
        match (event.op, &event.key) {
            (ChangeOp::Modify, RecordKey::Player(id)) => self.on_player_modified(id).await,
            (ChangeOp::Modify, RecordKey::Match(id)) => self.on_match_modified(id).await,
            (ChangeOp::Expire, RecordKey::Match(id)) => {
                self.announced.remove(id);
                Ok(Convergence::Ignored)
            }
            _ => Ok(Convergence::Ignored),
        }
    }

    pub fn has_announced(&self, match_id: &str) -> bool {
        self.announced.contains(match_id)
    }

    /// Re-evaluates every live match this replica has not announced yet
    ///
    /// Used after the feed dropped notifications, any of which may have been
    /// the second board lock of a match. Returns how many matches were
    /// evaluated.
    pub async fn resync(&mut self) -> Result<usize, GameError> {
        let mut evaluated = 0;

        for match_id in self.records.match_ids().await? {
            if self.announced.contains(&match_id) {
                continue;
            }

            match self.reevaluate_match(&match_id).await {
                Ok(outcome) => {
                    trace!("resync of match {} -> {:?}", match_id, outcome);
                    evaluated += 1;
                }
                Err(e) => warn!("failed to re-evaluate match {}: {}", match_id, e),
            }
        }

        Ok(evaluated)
    }

    async fn reevaluate_match(&mut self, match_id: &str) -> Result<Convergence, GameError> {
        let Some(instance) = self.records.get_match(match_id).await? else {
            return Ok(Convergence::Ignored);
        };

        if instance.is_complete() || !instance.belongs_to_game(self.game.uuid()) {
            return Ok(Convergence::Skipped);
        }

        self.on_player_modified(instance.player_a()).await
    }

    async fn on_player_modified(&mut self, player_id: &str) -> Result<Convergence, GameError> {
        let player = self
            .records
            .get_player(player_id)
            .await?
            .ok_or_else(|| GameError::invariant(format!("modified player {} is not in the cache", player_id)))?;

        // Modifies keep firing on every attack once play has started
        if player.has_attacked() {
            return Ok(Convergence::Skipped);
        }

        let Some(mut instance) = self.records.get_match(player.match_id()).await? else {
            return Err(GameError::invariant(format!(
                "failed to find match {} for player {}",
                player.match_id(),
                player_id
            )));
        };

        let opponent = self.load_opponent(&instance, player_id).await?;

        if !instance.is_ready() {
            if !(player.has_locked_ship_positions() && opponent.has_locked_ship_positions()) {
                debug!(
                    "match {} waiting on ship positions from {}",
                    instance.uuid(),
                    if player.has_locked_ship_positions() { opponent.uuid() } else { player_id }
                );
                return Ok(Convergence::Waiting);
            }

            instance.set_ready();
            self.records.put_match(&instance).await?;
            info!("both players locked ships, match {} is ready", instance.uuid());

            let (player_a, player_b) = if instance.player_a() == player.uuid() {
                (&player, &opponent)
            } else {
                (&opponent, &player)
            };
            self.collaborators
                .publish(GameEvent::match_start(&self.game, &instance, player_a, player_b));
        }

        if opponent.has_attacked() {
            return Ok(Convergence::Skipped);
        }

        self.announce(&instance, &player, &opponent).await
    }

    async fn on_match_modified(&mut self, match_id: &str) -> Result<Convergence, GameError> {
        if self.announced.contains(match_id) {
            return Ok(Convergence::AlreadyAnnounced);
        }

        let Some(instance) = self.records.get_match(match_id).await? else {
            return Ok(Convergence::Ignored);
        };

        if !instance.is_ready() || instance.is_complete() {
            return Ok(Convergence::Ignored);
        }

        let player = self.records.get_player(instance.player_a()).await?.ok_or_else(|| {
            GameError::invariant(format!(
                "player {} of match {} is not in the cache",
                instance.player_a(),
                match_id
            ))
        })?;
        let opponent = self.load_opponent(&instance, player.uuid()).await?;

        if player.has_attacked() || opponent.has_attacked() {
            return Ok(Convergence::Skipped);
        }

        self.announce(&instance, &player, &opponent).await
    }

    /// Pushes the ready configuration to each participant connected here
    async fn announce(
        &mut self,
        instance: &MatchInstance,
        player: &Player,
        opponent: &Player,
    ) -> Result<Convergence, GameError> {
        if !self.announced.insert(instance.uuid().to_string()) {
            return Ok(Convergence::AlreadyAnnounced);
        }

        let mut registry = self.registry.write().await;
        let mut notified = 0;

        for (me, them) in [(player, opponent), (opponent, player)] {
            let configuration = player_configuration(&self.game, me, Some(instance), Some(them));
            if registry.send(me.uuid(), OutgoingMessage::Configuration(configuration)) {
                debug!("sent ready configuration of match {} to {}", instance.uuid(), me.uuid());
                notified += 1;
            }
        }

        Ok(Convergence::Announced { notified })
    }

    async fn load_opponent(&self, instance: &MatchInstance, player_id: &str) -> Result<Player, GameError> {
        let opponent_id = instance.opponent_of(player_id).ok_or_else(|| {
            GameError::invariant(format!(
                "player {} is not a participant of match {}",
                player_id,
                instance.uuid()
            ))
        })?;

        self.records
            .get_player(opponent_id)
            .await?
            .ok_or_else(|| GameError::invariant(format!("no opponent {} found for player {}", opponent_id, player_id)))
    }
}
