//! Inbound message handling
//!
//! `GameServer::dispatch` turns one text frame from a connection into the
//! ordered list of replies for that same connection. Anything destined for
//! the other participant is pushed through the connection registry while the
//! message is handled, so it lands on their queue before this connection's
//! replies are written.
//!
//! Handlers never trust state they read earlier: each message reloads the
//! player and match records from the cache store, applies its change and
//! writes them back. Another replica may have written them in between.

use crate::client_manager::SharedRegistry;
use crate::config::GameSettings;
use crate::epoch::GameConfiguration;
use crate::error::GameError;
use crate::events::{AgentRequest, Collaborators, GameEvent, GameRecord};
use crate::game::{is_game_over, validate_ship_placement};
use crate::leaderboard::{HighScoreEntry, SharedLeaderboard};
use crate::match_instance::MatchInstance;
use crate::player::Player;
use crate::scoring::{resolve_attack, score_for_bonus, score_for_shot};
use crate::store::{CacheStore, Records};
use crate::utils::{generate_id, generate_username, get_timestamp};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::{
    AttackRequest, AttackResponse, BonusRequest, ConnectionRequest, Envelope, GameState,
    IncomingMsgType, MatchPhase, OutgoingMessage, PlayerConfiguration, ScoreUpdate,
    ValidationInfo,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

const INVALID_ENVELOPE_INFO: &str = "Your payload was a bit iffy. K thx bye.";

/// Per-connection state owned by the transport task
#[derive(Debug)]
pub struct Session {
    player_id: Option<String>,
    addr: SocketAddr,
    outbound: mpsc::UnboundedSender<OutgoingMessage>,
}

impl Session {
    pub fn new(addr: SocketAddr, outbound: mpsc::UnboundedSender<OutgoingMessage>) -> Self {
        Self {
            player_id: None,
            addr,
            outbound,
        }
    }

    pub fn player_id(&self) -> Option<&str> {
        self.player_id.as_deref()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn require_player(&self) -> Result<String, GameError> {
        self.player_id
            .clone()
            .ok_or_else(|| GameError::invariant(format!("no player associated with connection {}", self.addr)))
    }
}

/// The configuration view a player receives: their own full record, the
/// public view of their opponent and the match state.
pub fn player_configuration(
    game: &GameConfiguration,
    player: &Player,
    instance: Option<&MatchInstance>,
    opponent: Option<&Player>,
) -> PlayerConfiguration {
    PlayerConfiguration {
        game: game.to_view(),
        player: player.to_view(),
        opponent: opponent.map(Player::to_opponent_view),
        match_state: instance.map(MatchInstance::to_view),
    }
}

fn parse_payload<T: DeserializeOwned>(data: Value, kind: IncomingMsgType) -> Result<T, GameError> {
    serde_json::from_value(data).map_err(|e| GameError::BadPayload {
        info: format!("invalid \"{}\" payload", kind.name()),
        reasons: vec![e.to_string()],
    })
}

/// Handles game messages for one replica
pub struct GameServer<S> {
    game: Arc<GameConfiguration>,
    settings: GameSettings,
    records: Records<S>,
    registry: SharedRegistry,
    leaderboard: SharedLeaderboard,
    collaborators: Collaborators,
}

impl<S> Clone for GameServer<S> {
    fn clone(&self) -> Self {
        Self {
            game: Arc::clone(&self.game),
            settings: self.settings.clone(),
            records: self.records.clone(),
            registry: Arc::clone(&self.registry),
            leaderboard: Arc::clone(&self.leaderboard),
            collaborators: self.collaborators.clone(),
        }
    }
}

impl<S: CacheStore> GameServer<S> {
    pub fn new(
        game: Arc<GameConfiguration>,
        settings: GameSettings,
        records: Records<S>,
        registry: SharedRegistry,
        leaderboard: SharedLeaderboard,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            game,
            settings,
            records,
            registry,
            leaderboard,
            collaborators,
        }
    }

    pub fn game(&self) -> &GameConfiguration {
        &self.game
    }

    pub fn records(&self) -> &Records<S> {
        &self.records
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// Handles one inbound frame and returns the replies for its connection,
    /// in the order they must be delivered.
    pub async fn dispatch(&self, session: &mut Session, text: &str) -> Vec<OutgoingMessage> {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("rejecting malformed frame from {}: {}", session.addr, e);
                return vec![OutgoingMessage::BadPayload(ValidationInfo::new(
                    INVALID_ENVELOPE_INFO,
                ))];
            }
        };

        let result = match IncomingMsgType::from_name(&envelope.kind) {
            Some(IncomingMsgType::Connection) => self.on_connection(session, envelope.data).await,
            Some(IncomingMsgType::ShipPositions) => {
                self.on_ship_positions(session, envelope.data).await
            }
            Some(IncomingMsgType::Attack) => self.on_attack(session, envelope.data).await,
            Some(IncomingMsgType::Bonus) => self.on_bonus(session, envelope.data).await,
            None => Err(GameError::BadMessageType(envelope.kind.clone())),
        };

        match result {
            Ok(replies) => replies,
            Err(e) => {
                if e.is_input_error() {
                    warn!(
                        "\"{}\" from {} rejected: {}",
                        envelope.kind, session.addr, e
                    );
                } else {
                    error!(
                        "error processing \"{}\" from {} (player {:?}): {}",
                        envelope.kind, session.addr, session.player_id, e
                    );
                }
                vec![e.to_message()]
            }
        }
    }

    /// Removes the registry entry for a closed connection. Persisted records
    /// are left alone so the player can reconnect.
    pub async fn disconnect(&self, session: &Session) {
        if let Some(player_id) = session.player_id() {
            self.registry
                .write()
                .await
                .remove_if_addr(player_id, session.addr);
        }
    }

    /// Moves an active match into its bonus round and tells both players
    pub async fn enter_bonus_round(&self, match_id: &str) -> Result<(), GameError> {
        let mut instance = self
            .records
            .get_match(match_id)
            .await?
            .ok_or_else(|| GameError::invariant(format!("failed to find match {}", match_id)))?;

        instance.enter_bonus_round()?;
        self.records.put_match(&instance).await?;
        info!("match {} entered a bonus round, turn is {}", match_id, instance.turn());

        let player_a = self.records.get_player(instance.player_a()).await?;
        let player_b = self.records.get_player(instance.player_b()).await?;

        if let (Some(a), Some(b)) = (player_a, player_b) {
            let mut registry = self.registry.write().await;
            registry.send(
                a.uuid(),
                OutgoingMessage::Configuration(player_configuration(&self.game, &a, Some(&instance), Some(&b))),
            );
            registry.send(
                b.uuid(),
                OutgoingMessage::Configuration(player_configuration(&self.game, &b, Some(&instance), Some(&a))),
            );
        }

        Ok(())
    }

    async fn on_connection(
        &self,
        session: &mut Session,
        data: Value,
    ) -> Result<Vec<OutgoingMessage>, GameError> {
        let request: ConnectionRequest = if data.is_null() {
            ConnectionRequest::default()
        } else {
            parse_payload(data, IncomingMsgType::Connection)?
        };

        // Refuse before anything is created, so a full replica leaves no orphans
        if !self.has_room_for(session, &request).await {
            return Err(GameError::invariant(format!(
                "connection limit reached, refusing connection from {}",
                session.addr
            )));
        }

        let (player, instance, opponent) = self.initialise_player(&request).await?;

        {
            let mut registry = self.registry.write().await;

            // A session switching players gives up its previous binding
            if let Some(previous) = session.player_id.as_deref() {
                if previous != player.uuid() {
                    registry.remove_if_addr(previous, session.addr);
                }
            }

            if !registry.register(player.uuid(), session.addr, session.outbound.clone()) {
                return Err(GameError::invariant(format!(
                    "connection limit reached, refusing player {}",
                    player.uuid()
                )));
            }
        }

        session.player_id = Some(player.uuid().to_string());

        Ok(vec![OutgoingMessage::ConnectionAccepted(player_configuration(
            &self.game,
            &player,
            Some(&instance),
            opponent.as_ref(),
        ))])
    }

    /// Whether the registry can take this connection: it already holds the
    /// session's current binding or the requested player, or it has a free slot
    async fn has_room_for(&self, session: &Session, request: &ConnectionRequest) -> bool {
        let registry = self.registry.read().await;

        let holds_session = session
            .player_id()
            .and_then(|id| registry.lookup(id))
            .is_some_and(|connection| connection.addr == session.addr);
        let holds_requested = request
            .player_id
            .as_deref()
            .is_some_and(|id| registry.contains(id));

        holds_session || holds_requested || !registry.is_full()
    }

    /// Restores a player when the request names one from the current epoch
    /// with a matching username, otherwise starts a fresh match.
    async fn initialise_player(
        &self,
        request: &ConnectionRequest,
    ) -> Result<(Player, MatchInstance, Option<Player>), GameError> {
        if let (Some(game_id), Some(player_id), Some(username)) =
            (&request.game_id, &request.player_id, &request.username)
        {
            if game_id != self.game.uuid() {
                info!(
                    "player {} sent game {} but current game is {}, issuing a new player",
                    player_id,
                    game_id,
                    self.game.uuid()
                );
            } else if let Some(player) = self.records.get_player(player_id).await? {
                if player.username() == username {
                    let instance = self.records.get_match(player.match_id()).await?.ok_or_else(|| {
                        GameError::invariant(format!(
                            "failed to find match {} for reconnecting player {}",
                            player.match_id(),
                            player_id
                        ))
                    })?;
                    let opponent = match instance.opponent_of(player.uuid()) {
                        Some(opponent_id) => self.records.get_player(opponent_id).await?,
                        None => None,
                    };

                    info!("player {} reconnected to match {}", player_id, instance.uuid());
                    return Ok((player, instance, opponent));
                }

                warn!(
                    "player {} reconnected with username \"{}\" but \"{}\" is on record, issuing a new player",
                    player_id,
                    username,
                    player.username()
                );
            } else {
                debug!("player {} not found in cache, issuing a new player", player_id);
            }
        }

        self.setup_new_player().await
    }

    async fn setup_new_player(&self) -> Result<(Player, MatchInstance, Option<Player>), GameError> {
        let human_id = generate_id();
        let agent_id = generate_id();
        let instance = MatchInstance::new(self.game.uuid(), &human_id, &agent_id);

        let human = Player::new(&human_id, generate_username(), false, instance.uuid());
        let agent = Player::new(&agent_id, generate_username(), true, instance.uuid());

        self.records.put_player(&agent).await?;
        self.records.put_player(&human).await?;
        self.records.put_match(&instance).await?;

        info!(
            "created match {} for player {} against agent {}",
            instance.uuid(),
            human_id,
            agent_id
        );

        self.collaborators.provision_opponent(AgentRequest {
            ws_url: self.settings.agent_ws_url.clone(),
            game_id: self.game.uuid().to_string(),
            uuid: agent.uuid().to_string(),
            username: agent.username().to_string(),
        });

        Ok((human, instance, Some(agent)))
    }

    async fn on_ship_positions(
        &self,
        session: &Session,
        data: Value,
    ) -> Result<Vec<OutgoingMessage>, GameError> {
        let player_id = session.require_player()?;
        let (mut player, instance) = self.load_match_context(&player_id).await?;

        if !instance.is_in_phase(MatchPhase::Placement) || instance.is_ready() {
            return Err(GameError::invariant(format!(
                "player {} sent ship positions while match {} is in phase {:?}",
                player_id,
                instance.uuid(),
                instance.phase()
            )));
        }

        if player.has_locked_ship_positions() {
            return Err(GameError::invariant(format!(
                "player {} attempted to relocate locked ships",
                player_id
            )));
        }

        let board = validate_ship_placement(&data, self.settings.grid_size).map_err(|errors| {
            GameError::BadPayload {
                info: "invalid ship placement".to_string(),
                reasons: errors.iter().map(ToString::to_string).collect(),
            }
        })?;

        player.set_ship_positions(board);
        // This write is what the convergence listener reacts to
        self.records.put_player(&player).await?;
        debug!("player {} locked ship positions for match {}", player_id, instance.uuid());

        let opponent = self.load_opponent(&instance, &player_id).await.ok();

        Ok(vec![OutgoingMessage::Configuration(player_configuration(
            &self.game,
            &player,
            Some(&instance),
            opponent.as_ref(),
        ))])
    }

    async fn on_attack(&self, session: &Session, data: Value) -> Result<Vec<OutgoingMessage>, GameError> {
        let player_id = session.require_player()?;
        let attack: AttackRequest = parse_payload(data, IncomingMsgType::Attack)?;

        let (mut player, mut instance) = self.load_match_context(&player_id).await?;
        self.check_turn(&player, &instance, MatchPhase::Active)?;

        if !instance.is_ready() {
            return Err(GameError::invariant(format!(
                "player {} attempted an attack, but match {} is not ready",
                player_id,
                instance.uuid()
            )));
        }

        let mut opponent = self.load_opponent(&instance, &player_id).await?;

        let result = resolve_attack(&mut player, &mut opponent, &attack, self.settings.grid_size)?;
        debug!(
            "player {} attack at {:?} against {}: hit={} destroyed={:?}",
            player_id,
            result.origin,
            opponent.uuid(),
            result.hit,
            result.destroyed
        );

        let delta = score_for_shot(&result);
        player.increment_score_by(delta);

        self.records.put_player(&player).await?;
        self.records.put_player(&opponent).await?;
        self.record_high_score(&player, &instance).await;

        self.collaborators
            .publish(GameEvent::attack(&self.game, &instance, &player, &result, delta));

        if is_game_over(&opponent) {
            info!(
                "player {} lost match {} against {}",
                opponent.uuid(),
                instance.uuid(),
                player_id
            );

            instance.set_winner(&player_id)?;
            self.collaborators
                .publish(GameEvent::match_end(&self.game, &instance, &player, &opponent));
            self.collaborators.archive(GameRecord {
                winner: player.clone(),
                loser: opponent.clone(),
                match_instance: instance.clone(),
                game: (*self.game).clone(),
            });
        } else {
            instance.change_turn();
        }

        self.records.put_match(&instance).await?;

        self.registry.write().await.send(
            opponent.uuid(),
            OutgoingMessage::AttackResult(AttackResponse {
                attacker: player_id.clone(),
                result: result.clone(),
                configuration: player_configuration(&self.game, &opponent, Some(&instance), Some(&player)),
            }),
        );

        Ok(vec![
            OutgoingMessage::AttackResult(AttackResponse {
                attacker: player_id,
                result,
                configuration: player_configuration(&self.game, &player, Some(&instance), Some(&opponent)),
            }),
            OutgoingMessage::ScoreUpdate(ScoreUpdate { delta }),
        ])
    }

    async fn on_bonus(&self, session: &Session, data: Value) -> Result<Vec<OutgoingMessage>, GameError> {
        let player_id = session.require_player()?;
        let bonus: BonusRequest = parse_payload(data, IncomingMsgType::Bonus)?;

        if bonus.hits > self.settings.max_bonus_hits {
            return Err(GameError::bad_payload(format!(
                "\"hits\" must not exceed {}",
                self.settings.max_bonus_hits
            )));
        }

        let (mut player, mut instance) = self.load_match_context(&player_id).await?;
        self.check_turn(&player, &instance, MatchPhase::Bonus)?;
        let opponent = self.load_opponent(&instance, &player_id).await?;

        debug!("player {} recorded {} hits in their bonus round", player_id, bonus.hits);

        let delta = score_for_bonus(bonus.hits);
        player.increment_score_by(delta);
        self.records.put_player(&player).await?;
        self.record_high_score(&player, &instance).await;

        self.collaborators
            .publish(GameEvent::bonus(&self.game, &instance, &player, bonus.hits, delta));

        instance.finish_bonus_round();
        self.records.put_match(&instance).await?;

        self.registry.write().await.send(
            opponent.uuid(),
            OutgoingMessage::Configuration(player_configuration(&self.game, &opponent, Some(&instance), Some(&player))),
        );

        Ok(vec![
            OutgoingMessage::ScoreUpdate(ScoreUpdate { delta }),
            OutgoingMessage::BonusResult(player_configuration(&self.game, &player, Some(&instance), Some(&opponent))),
        ])
    }

    /// Loads the player and their match, refusing matches from other epochs
    async fn load_match_context(&self, player_id: &str) -> Result<(Player, MatchInstance), GameError> {
        let player = self
            .records
            .get_player(player_id)
            .await?
            .ok_or_else(|| GameError::invariant(format!("failed to find player data for {}", player_id)))?;

        let instance = self.records.get_match(player.match_id()).await?.ok_or_else(|| {
            GameError::invariant(format!("failed to find match associated with player {}", player_id))
        })?;

        if !instance.belongs_to_game(self.game.uuid()) {
            return Err(GameError::invariant(format!(
                "match {} of player {} belongs to game {}, current game is {}",
                instance.uuid(),
                player_id,
                instance.game(),
                self.game.uuid()
            )));
        }

        Ok((player, instance))
    }

    async fn load_opponent(&self, instance: &MatchInstance, player_id: &str) -> Result<Player, GameError> {
        let opponent_id = instance.opponent_of(player_id).ok_or_else(|| {
            GameError::invariant(format!(
                "player {} is not a participant of match {}",
                player_id,
                instance.uuid()
            ))
        })?;

        self.records.get_player(opponent_id).await?.ok_or_else(|| {
            GameError::invariant(format!("no opponent was found for player {}", player_id))
        })
    }

    /// Guards shared by turn submissions
    fn check_turn(&self, player: &Player, instance: &MatchInstance, phase: MatchPhase) -> Result<(), GameError> {
        if !self.game.is_in_state(GameState::Active) {
            return Err(GameError::invariant(format!(
                "player {} cannot take a turn when game state is {:?}",
                player.uuid(),
                self.game.state()
            )));
        }

        if instance.is_complete() {
            return Err(GameError::invariant(format!(
                "player {} took a turn in completed match {}",
                player.uuid(),
                instance.uuid()
            )));
        }

        if !instance.is_player_turn(player.uuid()) {
            return Err(GameError::invariant(format!(
                "player {} attempted to attack, but it's not their turn",
                player.uuid()
            )));
        }

        if !instance.is_in_phase(phase) {
            return Err(GameError::invariant(format!(
                "player {} sent a {:?} turn while match {} is in phase {:?}",
                player.uuid(),
                phase,
                instance.uuid(),
                instance.phase()
            )));
        }

        Ok(())
    }

    /// Offers a persisted player's total to the leaderboard
    async fn record_high_score(&self, player: &Player, instance: &MatchInstance) {
        self.leaderboard.write().await.record(HighScoreEntry {
            match_id: instance.uuid().to_string(),
            player_id: player.uuid().to_string(),
            human: !player.is_ai(),
            username: player.username().to_string(),
            score: player.score(),
            updated_at: get_timestamp(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_manager::ConnectionRegistry;
    use crate::leaderboard::Leaderboard;
    use crate::error::StoreError;
    use crate::store::{ChangeEvent, MemoryStore, RecordKey};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::broadcast;

    const PLACEMENT: &str = r#"{"type":"ship-positions","data":{
        "carrier": {"origin": [0, 0], "orientation": "horizontal"},
        "battleship": {"origin": [0, 1], "orientation": "horizontal"},
        "submarine": {"origin": [0, 2], "orientation": "horizontal"},
        "destroyer": {"origin": [0, 3], "orientation": "horizontal"}
    }}"#;

    fn server() -> GameServer<MemoryStore> {
        server_with(Arc::new(MemoryStore::default()), 16, Leaderboard::shared(20))
    }

    fn server_with<S: CacheStore>(store: Arc<S>, max_connections: usize, leaderboard: SharedLeaderboard) -> GameServer<S> {
        GameServer::new(
            Arc::new(GameConfiguration::new(Some("game-1".into()), 5000, "test")),
            GameSettings::default(),
            Records::new(store),
            ConnectionRegistry::shared(max_connections),
            leaderboard,
            Collaborators::logging("http://agents"),
        )
    }

    /// Store whose writes can be switched off
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_writes: AtomicBool,
    }

    impl CacheStore for FlakyStore {
        async fn get(&self, key: &RecordKey) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: RecordKey, value: Vec<u8>) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable(format!("write to {} refused", key)));
            }
            self.inner.put(key, value).await
        }

        async fn keys(&self) -> Result<Vec<RecordKey>, StoreError> {
            self.inner.keys().await
        }

        fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
            self.inner.subscribe()
        }
    }

    fn session(port: u16) -> (Session, mpsc::UnboundedReceiver<OutgoingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Session::new(SocketAddr::from(([127, 0, 0, 1], port)), tx), rx)
    }

    fn accepted(replies: Vec<OutgoingMessage>) -> PlayerConfiguration {
        match replies.into_iter().next() {
            Some(OutgoingMessage::ConnectionAccepted(config)) => config,
            other => panic!("expected connection-accepted, got {:?}", other),
        }
    }

    /// Connects a human, then its agent opponent through the reconnect path
    async fn connect_pair<S: CacheStore>(server: &GameServer<S>) -> (Session, Session, PlayerConfiguration) {
        let (mut human, _) = session(4000);
        let config = accepted(server.dispatch(&mut human, r#"{"type":"connection"}"#).await);
        let agent = config.opponent.clone().unwrap();

        let (mut bot, _) = session(4001);
        let frame = json!({
            "type": "connection",
            "data": {"gameId": "game-1", "playerId": agent.uuid, "username": agent.username}
        });
        let agent_config = accepted(server.dispatch(&mut bot, &frame.to_string()).await);
        assert_eq!(agent_config.player.uuid, agent.uuid);
        assert!(agent_config.player.is_ai);

        (human, bot, config)
    }

    async fn lock_and_ready<S: CacheStore>(server: &GameServer<S>, human: &mut Session, bot: &mut Session) -> String {
        server.dispatch(human, PLACEMENT).await;
        server.dispatch(bot, PLACEMENT).await;

        let player = server.records().get_player(human.player_id().unwrap()).await.unwrap().unwrap();
        let mut instance = server.records().get_match(player.match_id()).await.unwrap().unwrap();
        assert!(instance.set_ready());
        server.records().put_match(&instance).await.unwrap();
        instance.uuid().to_string()
    }

    fn attack_frame(x: i64, y: i64) -> String {
        json!({"type": "attack", "data": {"origin": [x, y]}}).to_string()
    }

    fn kinds(replies: &[OutgoingMessage]) -> Vec<&'static str> {
        replies.iter().map(OutgoingMessage::kind).collect()
    }

    #[tokio::test]
    async fn test_malformed_frames() {
        let server = server();
        let (mut session, _) = session(4000);

        let replies = server.dispatch(&mut session, "not json").await;
        assert_eq!(
            replies,
            vec![OutgoingMessage::BadPayload(ValidationInfo::new(INVALID_ENVELOPE_INFO))]
        );

        let replies = server.dispatch(&mut session, r#"{"type":"dance","data":{}}"#).await;
        assert_eq!(kinds(&replies), vec!["bad-message-type"]);
    }

    #[tokio::test]
    async fn test_turn_before_connection_is_server_error() {
        let server = server();
        let (mut session, _) = session(4000);

        let replies = server.dispatch(&mut session, &attack_frame(0, 0)).await;
        assert_eq!(
            replies,
            vec![OutgoingMessage::ServerError(ValidationInfo::default())]
        );
    }

    #[tokio::test]
    async fn test_new_connection_creates_match() {
        let server = server();
        let (mut session, _) = session(4000);

        let config = accepted(server.dispatch(&mut session, r#"{"type":"connection"}"#).await);
        let view = config.match_state.unwrap();

        assert_eq!(config.game.uuid, "game-1");
        assert!(!config.player.is_ai);
        assert!(config.opponent.unwrap().is_ai);
        assert_eq!(view.phase, MatchPhase::Placement);
        assert_eq!(view.turn, config.player.uuid);
        assert_eq!(session.player_id(), Some(config.player.uuid.as_str()));
        assert!(server.registry().read().await.contains(&config.player.uuid));
    }

    #[tokio::test]
    async fn test_reconnect_requires_matching_username() {
        let server = server();
        let (mut first, _) = session(4000);
        let config = accepted(server.dispatch(&mut first, r#"{"type":"connection"}"#).await);

        let (mut second, _) = session(4001);
        let frame = json!({
            "type": "connection",
            "data": {"gameId": "game-1", "playerId": config.player.uuid, "username": config.player.username}
        });
        let restored = accepted(server.dispatch(&mut second, &frame.to_string()).await);
        assert_eq!(restored.player.uuid, config.player.uuid);

        let (mut third, _) = session(4002);
        let frame = json!({
            "type": "connection",
            "data": {"gameId": "game-1", "playerId": config.player.uuid, "username": "Someone Else"}
        });
        let fresh = accepted(server.dispatch(&mut third, &frame.to_string()).await);
        assert_ne!(fresh.player.uuid, config.player.uuid);

        let (mut fourth, _) = session(4003);
        let frame = json!({
            "type": "connection",
            "data": {"gameId": "old-game", "playerId": config.player.uuid, "username": config.player.username}
        });
        let fresh = accepted(server.dispatch(&mut fourth, &frame.to_string()).await);
        assert_ne!(fresh.player.uuid, config.player.uuid);
    }

    #[tokio::test]
    async fn test_invalid_placement_lists_reasons() {
        let server = server();
        let (mut human, _bot, _) = connect_pair(&server).await;

        let frame = r#"{"type":"ship-positions","data":{
            "carrier": {"origin": [0, 0], "orientation": "horizontal"},
            "battleship": {"origin": [0, 0], "orientation": "vertical"},
            "submarine": {"origin": [0, 2], "orientation": "horizontal"},
            "destroyer": {"origin": [0, 3], "orientation": "horizontal"}
        }}"#;

        match server.dispatch(&mut human, frame).await.as_slice() {
            [OutgoingMessage::BadPayload(info)] => {
                assert_eq!(info.info, "invalid ship placement");
                assert!(info
                    .reasons
                    .contains(&"ships are overlapping at grid [0, 0]".to_string()));
            }
            other => panic!("unexpected replies {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_valid_placement_locks_board() {
        let server = server();
        let (mut human, _bot, _) = connect_pair(&server).await;

        match server.dispatch(&mut human, PLACEMENT).await.as_slice() {
            [OutgoingMessage::Configuration(config)] => {
                assert!(config.player.board.is_some());
                assert!(!config.match_state.as_ref().unwrap().ready);
            }
            other => panic!("unexpected replies {:?}", other),
        }

        // Locked boards cannot be moved
        let replies = server.dispatch(&mut human, PLACEMENT).await;
        assert_eq!(kinds(&replies), vec!["server-error"]);
    }

    #[tokio::test]
    async fn test_attack_before_ready_is_server_error() {
        let server = server();
        let (mut human, _bot, _) = connect_pair(&server).await;
        server.dispatch(&mut human, PLACEMENT).await;

        let replies = server.dispatch(&mut human, &attack_frame(0, 0)).await;
        assert_eq!(kinds(&replies), vec!["server-error"]);
    }

    #[tokio::test]
    async fn test_attack_replies_in_order_and_alternates_turn() {
        let server = server();
        let (mut human, mut bot, _) = connect_pair(&server).await;
        lock_and_ready(&server, &mut human, &mut bot).await;

        let replies = server.dispatch(&mut human, &attack_frame(0, 0)).await;
        assert_eq!(kinds(&replies), vec!["attack-result", "score-update"]);
        match &replies[..] {
            [OutgoingMessage::AttackResult(response), OutgoingMessage::ScoreUpdate(update)] => {
                assert!(response.result.hit);
                assert_eq!(update.delta, shared::SCORE_HIT);
                assert_eq!(response.configuration.player.score, shared::SCORE_HIT);
                assert_eq!(
                    response.configuration.match_state.as_ref().unwrap().turn,
                    bot.player_id().unwrap()
                );
            }
            other => panic!("unexpected replies {:?}", other),
        }

        // Out of turn
        let replies = server.dispatch(&mut human, &attack_frame(1, 0)).await;
        assert_eq!(kinds(&replies), vec!["server-error"]);

        let replies = server.dispatch(&mut bot, &attack_frame(4, 4)).await;
        assert_eq!(kinds(&replies), vec!["attack-result", "score-update"]);

        // Same cell twice
        let replies = server.dispatch(&mut human, &attack_frame(0, 0)).await;
        assert_eq!(kinds(&replies), vec!["bad-attack"]);

        // Still the human's turn after the rejection
        let replies = server.dispatch(&mut human, &attack_frame(1, 0)).await;
        assert_eq!(kinds(&replies), vec!["attack-result", "score-update"]);
    }

    #[tokio::test]
    async fn test_attack_pushes_result_to_opponent() {
        let server = server();
        let (mut human, _) = session(4000);
        let config = accepted(server.dispatch(&mut human, r#"{"type":"connection"}"#).await);
        let agent = config.opponent.unwrap();

        let (mut bot, mut bot_rx) = session(4001);
        let frame = json!({
            "type": "connection",
            "data": {"gameId": "game-1", "playerId": agent.uuid, "username": agent.username}
        });
        server.dispatch(&mut bot, &frame.to_string()).await;
        lock_and_ready(&server, &mut human, &mut bot).await;

        server.dispatch(&mut human, &attack_frame(2, 2)).await;

        match bot_rx.try_recv().unwrap() {
            OutgoingMessage::AttackResult(response) => {
                assert_eq!(response.attacker, config.player.uuid);
                assert_eq!(response.configuration.player.uuid, agent.uuid);
            }
            other => panic!("unexpected push {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_prediction_rejected_for_humans() {
        let server = server();
        let (mut human, mut bot, _) = connect_pair(&server).await;
        lock_and_ready(&server, &mut human, &mut bot).await;

        let frame = json!({"type": "attack", "data": {"origin": [0, 0], "prediction": {"x": 0}}});
        let replies = server.dispatch(&mut human, &frame.to_string()).await;
        assert_eq!(kinds(&replies), vec!["bad-payload"]);
    }

    #[tokio::test]
    async fn test_bonus_round() {
        let server = server();
        let (mut human, mut bot, _) = connect_pair(&server).await;
        let match_id = lock_and_ready(&server, &mut human, &mut bot).await;

        // No bonus outside the bonus phase
        let bonus = r#"{"type":"bonus","data":{"hits":3}}"#;
        assert_eq!(kinds(&server.dispatch(&mut human, bonus).await), vec!["server-error"]);

        server.enter_bonus_round(&match_id).await.unwrap();

        let too_many = r#"{"type":"bonus","data":{"hits":1000}}"#;
        assert_eq!(kinds(&server.dispatch(&mut human, too_many).await), vec!["bad-payload"]);

        let replies = server.dispatch(&mut human, bonus).await;
        assert_eq!(kinds(&replies), vec!["score-update", "bonus-result"]);
        match &replies[..] {
            [OutgoingMessage::ScoreUpdate(update), OutgoingMessage::BonusResult(config)] => {
                assert_eq!(update.delta, 15);
                let view = config.match_state.as_ref().unwrap();
                assert_eq!(view.phase, MatchPhase::Active);
                assert_eq!(view.turn, bot.player_id().unwrap());
            }
            other => panic!("unexpected replies {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_keeps_records() {
        let server = server();
        let (mut human, _) = session(4000);
        let config = accepted(server.dispatch(&mut human, r#"{"type":"connection"}"#).await);

        server.disconnect(&human).await;

        assert!(!server.registry().read().await.contains(&config.player.uuid));
        assert!(server
            .records()
            .get_player(&config.player.uuid)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_full_registry_refuses_before_creating_records() {
        let store = Arc::new(MemoryStore::default());
        let server = server_with(Arc::clone(&store), 1, Leaderboard::shared(20));

        let (mut human, _) = session(4000);
        let config = accepted(server.dispatch(&mut human, r#"{"type":"connection"}"#).await);
        let created = store.len().await;
        assert_eq!(created, 3);

        let (mut late, _) = session(4002);
        let replies = server.dispatch(&mut late, r#"{"type":"connection"}"#).await;
        assert_eq!(kinds(&replies), vec!["server-error"]);
        assert_eq!(store.len().await, created);
        assert!(late.player_id().is_none());

        // A registered player can still take over their slot from a new socket
        let (mut resumed, _) = session(4003);
        let frame = json!({
            "type": "connection",
            "data": {"gameId": "game-1", "playerId": config.player.uuid, "username": config.player.username}
        });
        let resumed_config = accepted(server.dispatch(&mut resumed, &frame.to_string()).await);
        assert_eq!(resumed_config.player.uuid, config.player.uuid);
        assert_eq!(store.len().await, created);
    }

    #[tokio::test]
    async fn test_second_connection_on_session_releases_first_player() {
        let server = server_with(Arc::new(MemoryStore::default()), 1, Leaderboard::shared(20));
        let (mut client, _) = session(4000);

        let first = accepted(server.dispatch(&mut client, r#"{"type":"connection"}"#).await);
        let second = accepted(server.dispatch(&mut client, r#"{"type":"connection"}"#).await);
        assert_ne!(first.player.uuid, second.player.uuid);

        {
            let registry = server.registry().read().await;
            assert!(!registry.contains(&first.player.uuid));
            assert!(registry.contains(&second.player.uuid));
            assert_eq!(registry.len(), 1);
        }

        server.disconnect(&client).await;
        assert!(server.registry().read().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_leaderboard_untouched() {
        let store = Arc::new(FlakyStore::default());
        let leaderboard = Leaderboard::shared(20);
        let server = server_with(Arc::clone(&store), 16, Arc::clone(&leaderboard));
        let (mut human, mut bot, _) = connect_pair(&server).await;
        lock_and_ready(&server, &mut human, &mut bot).await;

        store.fail_writes.store(true, Ordering::SeqCst);
        let replies = server.dispatch(&mut human, &attack_frame(0, 0)).await;
        assert_eq!(kinds(&replies), vec!["server-error"]);
        assert!(leaderboard.read().await.is_empty());

        store.fail_writes.store(false, Ordering::SeqCst);
        let replies = server.dispatch(&mut human, &attack_frame(0, 0)).await;
        assert_eq!(kinds(&replies), vec!["attack-result", "score-update"]);

        let board = leaderboard.read().await;
        assert_eq!(board.len(), 1);
        assert_eq!(board.entries()[0].score, shared::SCORE_HIT);
        assert_eq!(board.entries()[0].player_id, human.player_id().unwrap());
    }
}
