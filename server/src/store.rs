//! Shared record storage with change notifications.
//!
//! The cache store is the single source of truth for player and match
//! records. Every replica talks to the same store and learns about writes
//! made elsewhere through the change feed returned by `subscribe`, never
//! through direct calls between replicas.
//!
//! Records are bincode encoded and expire after a fixed TTL that every
//! `put` refreshes.

use crate::error::StoreError;
use crate::match_instance::MatchInstance;
use crate::player::Player;
use log::{debug, trace};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;

/// Buffered notifications per subscriber before it starts lagging
const CHANGE_FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKey {
    Player(String),
    Match(String),
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Player(id) => write!(f, "player:{}", id),
            RecordKey::Match(id) => write!(f, "match:{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Create,
    Modify,
    Expire,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub key: RecordKey,
}

/// A TTL-bounded key-value store that broadcasts every write.
///
/// Methods use RPITIT so implementations can be plain `async fn`s.
pub trait CacheStore: Send + Sync + 'static {
    /// Returns the live value stored under `key`
    fn get(&self, key: &RecordKey)
        -> impl Future<Output = Result<Option<Vec<u8>>, StoreError>> + Send;

    /// Overwrites `key`, refreshes its TTL and notifies every subscriber
    fn put(&self, key: RecordKey, value: Vec<u8>)
        -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Every key that currently holds a live value
    fn keys(&self) -> impl Future<Output = Result<Vec<RecordKey>, StoreError>> + Send;

    /// Feed of `(op, key)` notifications for writes from any replica
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}

struct StoredRecord {
    value: Vec<u8>,
    expires_at: Instant,
}

impl StoredRecord {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-process `CacheStore`. Replicas share one instance through an `Arc`.
pub struct MemoryStore {
    records: RwLock<HashMap<RecordKey, StoredRecord>>,
    ttl: Duration,
    changes: broadcast::Sender<ChangeEvent>,
}

impl MemoryStore {
    pub fn new(ttl: Duration) -> Self {
        Self::with_feed_capacity(ttl, CHANGE_FEED_CAPACITY)
    }

    /// Creates a store whose subscribers lag after `capacity` unread notifications
    pub fn with_feed_capacity(ttl: Duration, capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity);

        Self {
            records: RwLock::new(HashMap::new()),
            ttl,
            changes,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Removes expired records and emits an `Expire` notification for each
    pub async fn purge_expired(&self) -> Vec<RecordKey> {
        let now = Instant::now();
        let expired: Vec<RecordKey> = {
            let mut records = self.records.write().await;
            let keys: Vec<RecordKey> = records
                .iter()
                .filter(|(_, record)| !record.is_live(now))
                .map(|(key, _)| key.clone())
                .collect();

            for key in &keys {
                records.remove(key);
            }
            keys
        };

        for key in &expired {
            self.notify(ChangeOp::Expire, key.clone());
        }

        expired
    }

    fn notify(&self, op: ChangeOp, key: RecordKey) {
        trace!("change notification {:?} for {}", op, key);
        // No subscribers yet is fine
        let _ = self.changes.send(ChangeEvent { op, key });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(60 * 60))
    }
}

impl CacheStore for MemoryStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<Vec<u8>>, StoreError> {
        let records = self.records.read().await;
        let now = Instant::now();

        Ok(records
            .get(key)
            .filter(|record| record.is_live(now))
            .map(|record| record.value.clone()))
    }

    async fn put(&self, key: RecordKey, value: Vec<u8>) -> Result<(), StoreError> {
        let op = {
            let mut records = self.records.write().await;
            let now = Instant::now();
            let previous = records.insert(
                key.clone(),
                StoredRecord {
                    value,
                    expires_at: now + self.ttl,
                },
            );

            match previous {
                Some(record) if record.is_live(now) => ChangeOp::Modify,
                _ => ChangeOp::Create,
            }
        };

        self.notify(op, key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<RecordKey>, StoreError> {
        let records = self.records.read().await;
        let now = Instant::now();

        Ok(records
            .iter()
            .filter(|(_, record)| record.is_live(now))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}

/// Periodically purges expired records from `store`
pub async fn run_expiry_sweeper(store: Arc<MemoryStore>, every: Duration) {
    let mut interval = tokio::time::interval(every);

    loop {
        interval.tick().await;

        let expired = store.purge_expired().await;
        if !expired.is_empty() {
            debug!("expired {} cached records", expired.len());
        }
    }
}

/// Typed access to player and match records
pub struct Records<S> {
    store: Arc<S>,
}

impl<S> Clone for Records<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: CacheStore> Records<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub async fn get_player(&self, uuid: &str) -> Result<Option<Player>, StoreError> {
        self.read(RecordKey::Player(uuid.to_string())).await
    }

    pub async fn put_player(&self, player: &Player) -> Result<(), StoreError> {
        trace!("writing player {} to cache", player.uuid());
        self.write(RecordKey::Player(player.uuid().to_string()), player)
            .await
    }

    pub async fn get_match(&self, uuid: &str) -> Result<Option<MatchInstance>, StoreError> {
        self.read(RecordKey::Match(uuid.to_string())).await
    }

    pub async fn put_match(&self, instance: &MatchInstance) -> Result<(), StoreError> {
        trace!("writing match {} to cache", instance.uuid());
        self.write(RecordKey::Match(instance.uuid().to_string()), instance)
            .await
    }

    /// Ids of every live match record
    pub async fn match_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .store
            .keys()
            .await?
            .into_iter()
            .filter_map(|key| match key {
                RecordKey::Match(id) => Some(id),
                RecordKey::Player(_) => None,
            })
            .collect())
    }

    async fn read<T: DeserializeOwned>(&self, key: RecordKey) -> Result<Option<T>, StoreError> {
        match self.store.get(&key).await? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|source| StoreError::Decode {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    async fn write<T: Serialize>(&self, key: RecordKey, value: &T) -> Result<(), StoreError> {
        let bytes = bincode::serialize(value).map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })?;

        self.store.put(key, bytes).await
    }
}
