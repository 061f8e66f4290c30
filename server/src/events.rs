//! Outbound integrations: the event feed, opponent provisioning and the
//! archive of finished matches.
//!
//! None of these sit on the player-facing path. `Collaborators` calls them
//! and logs any failure instead of returning it, so a broken integration
//! never changes what a connected player sees.

use crate::epoch::GameConfiguration;
use crate::match_instance::MatchInstance;
use crate::player::Player;
use crate::utils::get_timestamp;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use shared::{AttackResult, Board, CellPosition, ShipType};
use std::error::Error;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub type CollaboratorError = Box<dyn Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Matches,
    Attacks,
    Bonuses,
    Results,
}

impl EventType {
    pub fn name(self) -> &'static str {
        match self {
            EventType::Matches => "matches",
            EventType::Attacks => "attacks",
            EventType::Bonuses => "bonuses",
            EventType::Results => "results",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPlayer {
    pub uuid: String,
    pub username: String,
    pub human: bool,
    pub board: Option<Board>,
}

impl From<&Player> for EventPlayer {
    fn from(player: &Player) -> Self {
        Self {
            uuid: player.uuid().to_string(),
            username: player.username().to_string(),
            human: !player.is_ai(),
            board: player.board().cloned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchStartEvent {
    pub player_a: EventPlayer,
    pub player_b: EventPlayer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttackEvent {
    pub attacker: String,
    pub hit: bool,
    pub origin: CellPosition,
    pub destroyed: Option<ShipType>,
    pub score_delta: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BonusEvent {
    pub attacker: String,
    pub shots: u32,
    pub score_delta: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPlayer {
    pub uuid: String,
    pub score: u64,
    pub shot_count: u32,
}

impl From<&Player> for ResultPlayer {
    fn from(player: &Player) -> Self {
        Self {
            uuid: player.uuid().to_string(),
            score: player.score(),
            shot_count: player.shots_fired(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchEndEvent {
    pub winner: ResultPlayer,
    pub loser: ResultPlayer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum EventData {
    MatchStart(MatchStartEvent),
    Attack(AttackEvent),
    Bonus(BonusEvent),
    MatchEnd(MatchEndEvent),
}

/// Payload handed to an `EventSink`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameEvent {
    pub game: String,
    #[serde(rename = "match")]
    pub match_id: String,
    pub cluster: String,
    pub ts: u64,
    #[serde(flatten)]
    pub data: EventData,
}

impl GameEvent {
    fn new(game: &GameConfiguration, instance: &MatchInstance, data: EventData) -> Self {
        Self {
            game: game.uuid().to_string(),
            match_id: instance.uuid().to_string(),
            cluster: game.cluster().to_string(),
            ts: get_timestamp(),
            data,
        }
    }

    pub fn match_start(
        game: &GameConfiguration,
        instance: &MatchInstance,
        player_a: &Player,
        player_b: &Player,
    ) -> Self {
        Self::new(
            game,
            instance,
            EventData::MatchStart(MatchStartEvent {
                player_a: player_a.into(),
                player_b: player_b.into(),
            }),
        )
    }

    pub fn attack(
        game: &GameConfiguration,
        instance: &MatchInstance,
        attacker: &Player,
        result: &AttackResult,
        score_delta: u64,
    ) -> Self {
        Self::new(
            game,
            instance,
            EventData::Attack(AttackEvent {
                attacker: attacker.uuid().to_string(),
                hit: result.hit,
                origin: result.origin,
                destroyed: result.destroyed,
                score_delta,
            }),
        )
    }

    pub fn bonus(
        game: &GameConfiguration,
        instance: &MatchInstance,
        attacker: &Player,
        shots: u32,
        score_delta: u64,
    ) -> Self {
        Self::new(
            game,
            instance,
            EventData::Bonus(BonusEvent {
                attacker: attacker.uuid().to_string(),
                shots,
                score_delta,
            }),
        )
    }

    pub fn match_end(
        game: &GameConfiguration,
        instance: &MatchInstance,
        winner: &Player,
        loser: &Player,
    ) -> Self {
        Self::new(
            game,
            instance,
            EventData::MatchEnd(MatchEndEvent {
                winner: winner.into(),
                loser: loser.into(),
            }),
        )
    }

    pub fn event_type(&self) -> EventType {
        match self.data {
            EventData::MatchStart(_) => EventType::Matches,
            EventData::Attack(_) => EventType::Attacks,
            EventData::Bonus(_) => EventType::Bonuses,
            EventData::MatchEnd(_) => EventType::Results,
        }
    }
}

/// Request sent to the service that drives programmatic opponents
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub ws_url: String,
    pub game_id: String,
    pub uuid: String,
    pub username: String,
}

/// Snapshot written once a match has a winner
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GameRecord {
    pub winner: Player,
    pub loser: Player,
    #[serde(rename = "match")]
    pub match_instance: MatchInstance,
    pub game: GameConfiguration,
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event_type: EventType, event: &GameEvent) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait OpponentProvisioner: Send + Sync {
    async fn provision(&self, request: &AgentRequest) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait RecordArchive: Send + Sync {
    async fn write(&self, record: &GameRecord) -> Result<(), CollaboratorError>;
}

/// Writes every event to the log as JSON
#[derive(Debug, Default)]
pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    async fn publish(&self, event_type: EventType, event: &GameEvent) -> Result<(), CollaboratorError> {
        let payload = serde_json::to_string(event)?;
        debug!("sending \"{}\" event with data: {}", event_type.name(), payload);
        Ok(())
    }
}

/// Logs provisioning requests addressed to `agent_server_url`
#[derive(Debug)]
pub struct LogProvisioner {
    agent_server_url: String,
}

impl LogProvisioner {
    pub fn new(agent_server_url: impl Into<String>) -> Self {
        Self {
            agent_server_url: agent_server_url.into(),
        }
    }
}

#[async_trait]
impl OpponentProvisioner for LogProvisioner {
    async fn provision(&self, request: &AgentRequest) -> Result<(), CollaboratorError> {
        let body = serde_json::to_string(request)?;
        info!(
            "requesting agent {} for game {} from {}/agent: {}",
            request.uuid, request.game_id, self.agent_server_url, body
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LogArchive;

#[async_trait]
impl RecordArchive for LogArchive {
    async fn write(&self, record: &GameRecord) -> Result<(), CollaboratorError> {
        let body = serde_json::to_string(record)?;
        info!(
            "write game record for game {} / match {} ({} bytes)",
            record.game.uuid(),
            record.match_instance.uuid(),
            body.len()
        );
        Ok(())
    }
}

/// Keeps published events in memory so they can be inspected
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<(EventType, GameEvent)>>,
}

impl MemoryEventSink {
    pub fn events(&self) -> Vec<(EventType, GameEvent)> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.events()
            .iter()
            .filter(|(kind, _)| *kind == event_type)
            .count()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn publish(&self, event_type: EventType, event: &GameEvent) -> Result<(), CollaboratorError> {
        self.events
            .lock()
            .map_err(|_| "event buffer poisoned")?
            .push((event_type, event.clone()));
        Ok(())
    }
}

/// Counts deliveries that were spawned but have not finished yet
#[derive(Debug, Default)]
struct InFlight {
    pending: AtomicUsize,
    idle: Notify,
}

/// Fire-and-forget front for every outbound integration
///
/// Each call is spawned onto the runtime and returns immediately. Failures
/// are logged from inside the spawned task.
#[derive(Clone)]
pub struct Collaborators {
    events: Arc<dyn EventSink>,
    provisioner: Arc<dyn OpponentProvisioner>,
    archive: Arc<dyn RecordArchive>,
    in_flight: Arc<InFlight>,
}

impl Collaborators {
    pub fn new(
        events: Arc<dyn EventSink>,
        provisioner: Arc<dyn OpponentProvisioner>,
        archive: Arc<dyn RecordArchive>,
    ) -> Self {
        Self {
            events,
            provisioner,
            archive,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Log-only integrations, used when no external services are configured
    pub fn logging(agent_server_url: impl Into<String>) -> Self {
        Self::new(
            Arc::new(LogEventSink),
            Arc::new(LogProvisioner::new(agent_server_url)),
            Arc::new(LogArchive),
        )
    }

    /// Publishes `event` on the feed matching its type
    pub fn publish(&self, event: GameEvent) {
        let events = Arc::clone(&self.events);

        self.spawn(async move {
            let event_type = event.event_type();
            if let Err(e) = events.publish(event_type, &event).await {
                warn!(
                    "failed to publish \"{}\" event for match {}: {}",
                    event_type.name(),
                    event.match_id,
                    e
                );
            }
        });
    }

    /// Asks the agent server to connect a programmatic opponent
    pub fn provision_opponent(&self, request: AgentRequest) {
        let provisioner = Arc::clone(&self.provisioner);

        self.spawn(async move {
            if let Err(e) = provisioner.provision(&request).await {
                warn!(
                    "failed to provision agent {} for game {}: {}",
                    request.uuid, request.game_id, e
                );
            }
        });
    }

    /// Writes the record of a finished match
    pub fn archive(&self, record: GameRecord) {
        let archive = Arc::clone(&self.archive);

        self.spawn(async move {
            if let Err(e) = archive.write(&record).await {
                warn!(
                    "failed to write record of match {}: {}",
                    record.match_instance.uuid(),
                    e
                );
            }
        });
    }

    /// Number of deliveries still running
    pub fn pending(&self) -> usize {
        self.in_flight.pending.load(Ordering::SeqCst)
    }

    /// Waits until every delivery spawned so far has finished
    pub async fn settled(&self) {
        loop {
            // Registered before the check so a completion in between is not missed
            let idle = self.in_flight.idle.notified();
            if self.pending() == 0 {
                return;
            }
            idle.await;
        }
    }

    fn spawn<F>(&self, delivery: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.pending.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            delivery.await;
            if in_flight.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                in_flight.idle.notify_waiters();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn publish(&self, _: EventType, _: &GameEvent) -> Result<(), CollaboratorError> {
            Err("broker unreachable".into())
        }
    }

    /// Holds every delivery until the gate opens
    struct GatedSink {
        gate: Notify,
        inner: MemoryEventSink,
    }

    #[async_trait]
    impl EventSink for GatedSink {
        async fn publish(&self, event_type: EventType, event: &GameEvent) -> Result<(), CollaboratorError> {
            self.gate.notified().await;
            self.inner.publish(event_type, event).await
        }
    }

    fn fixtures() -> (GameConfiguration, MatchInstance, Player, Player) {
        let game = GameConfiguration::new(Some("game-1".into()), 5000, "test");
        let instance = MatchInstance::new(game.uuid(), "a", "b");
        let a = Player::new("a", "Salty Kraken", false, instance.uuid());
        let b = Player::new("b", "Rusty Gull", true, instance.uuid());
        (game, instance, a, b)
    }

    #[test]
    fn test_attack_event_payload() {
        let (game, instance, a, _) = fixtures();
        let result = AttackResult {
            hit: true,
            origin: (1, 2),
            destroyed: Some(ShipType::Destroyer),
        };

        let event = GameEvent::attack(&game, &instance, &a, &result, 110);
        assert_eq!(event.event_type(), EventType::Attacks);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["game"], "game-1");
        assert_eq!(json["match"], instance.uuid());
        assert_eq!(json["attacker"], "a");
        assert_eq!(json["scoreDelta"], 110);
        assert_eq!(json["destroyed"], "destroyer");
    }

    #[test]
    fn test_match_start_marks_humans() {
        let (game, instance, a, b) = fixtures();
        let event = GameEvent::match_start(&game, &instance, &a, &b);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["playerA"]["human"], true);
        assert_eq!(json["playerB"]["human"], false);
    }

    #[tokio::test]
    async fn test_memory_sink_records_events() {
        let (game, instance, a, b) = fixtures();
        let sink = Arc::new(MemoryEventSink::default());
        let collaborators = Collaborators::new(
            sink.clone(),
            Arc::new(LogProvisioner::new("http://agents")),
            Arc::new(LogArchive),
        );

        collaborators.publish(GameEvent::bonus(&game, &instance, &a, 4, 20));
        collaborators.publish(GameEvent::match_end(&game, &instance, &a, &b));
        collaborators.settled().await;

        assert_eq!(collaborators.pending(), 0);
        assert_eq!(sink.count(EventType::Bonuses), 1);
        assert_eq!(sink.count(EventType::Results), 1);
        assert_eq!(sink.count(EventType::Attacks), 0);
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let (game, instance, a, b) = fixtures();
        let collaborators = Collaborators::new(
            Arc::new(FailingSink),
            Arc::new(LogProvisioner::new("http://agents")),
            Arc::new(LogArchive),
        );

        collaborators.publish(GameEvent::match_start(&game, &instance, &a, &b));
        collaborators.archive(GameRecord {
            winner: a,
            loser: b,
            match_instance: instance,
            game,
        });
        collaborators.settled().await;
        assert_eq!(collaborators.pending(), 0);
    }

    #[tokio::test]
    async fn test_publish_does_not_wait_for_delivery() {
        let (game, instance, a, b) = fixtures();
        let sink = Arc::new(GatedSink {
            gate: Notify::new(),
            inner: MemoryEventSink::default(),
        });
        let collaborators = Collaborators::new(
            sink.clone(),
            Arc::new(LogProvisioner::new("http://agents")),
            Arc::new(LogArchive),
        );

        // Returns while the sink is still blocked
        collaborators.publish(GameEvent::match_start(&game, &instance, &a, &b));
        assert_eq!(collaborators.pending(), 1);

        tokio::task::yield_now().await;
        assert_eq!(sink.inner.count(EventType::Matches), 0);

        sink.gate.notify_one();
        collaborators.settled().await;
        assert_eq!(collaborators.pending(), 0);
        assert_eq!(sink.inner.count(EventType::Matches), 1);
    }
}
