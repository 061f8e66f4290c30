//! Connection registry for the replica's live players
//!
//! This module tracks which players currently hold a connection to this
//! replica, including:
//! - Registration on `connection`, replacing any older socket for the player
//! - Ordered delivery through each connection's outbound queue
//! - Capacity enforcement and cleanup when a socket closes
//!
//! Players connected to a different replica are simply absent here. Sends to
//! them are no-ops, which is what lets every replica run the same
//! convergence logic without coordinating.

use log::{debug, info};
use shared::OutgoingMessage;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Handle to a live connection
///
/// Each connection holds:
/// - The player it belongs to and the peer address it was opened from
/// - The sending half of its ordered outbound queue
#[derive(Debug, Clone)]
pub struct Connection {
    /// Player bound to this connection
    pub player_id: String,
    /// Peer address, used to tell a reconnect apart from the socket it replaced
    pub addr: SocketAddr,
    outbound: mpsc::UnboundedSender<OutgoingMessage>,
}

impl Connection {
    /// Creates a connection handle around an outbound queue
    pub fn new(
        player_id: impl Into<String>,
        addr: SocketAddr,
        outbound: mpsc::UnboundedSender<OutgoingMessage>,
    ) -> Self {
        Self {
            player_id: player_id.into(),
            addr,
            outbound,
        }
    }

    /// Queues a message behind everything already queued for this connection
    ///
    /// Returns false when the connection task has already gone away.
    pub fn send(&self, message: OutgoingMessage) -> bool {
        self.outbound.send(message).is_ok()
    }

    /// True once the connection task has dropped its receiver
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Maps player ids to their live connection on this replica
pub struct ConnectionRegistry {
    /// Live connections indexed by player id
    connections: HashMap<String, Connection>,
    /// Maximum number of concurrent connections allowed
    max_connections: usize,
}

pub type SharedRegistry = Arc<RwLock<ConnectionRegistry>>;

impl ConnectionRegistry {
    /// Creates an empty registry holding at most `max_connections` players
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: HashMap::new(),
            max_connections,
        }
    }

    /// Creates an empty registry behind a shared lock
    pub fn shared(max_connections: usize) -> SharedRegistry {
        Arc::new(RwLock::new(Self::new(max_connections)))
    }

    /// Binds `player_id` to a connection
    ///
    /// A player that reconnects replaces its previous entry. New players are
    /// refused once the registry is at capacity, in which case false is
    /// returned.
    pub fn register(
        &mut self,
        player_id: &str,
        addr: SocketAddr,
        outbound: mpsc::UnboundedSender<OutgoingMessage>,
    ) -> bool {
        if !self.has_room_for(player_id) {
            info!(
                "Refusing player {} from {}: {} connections open",
                player_id,
                addr,
                self.connections.len()
            );
            return false;
        }

        info!("Player {} connected from {}", player_id, addr);
        self.connections
            .insert(player_id.to_string(), Connection::new(player_id, addr, outbound));
        true
    }

    /// True when `player_id` could be registered right now: either they
    /// already hold an entry or the registry is below capacity
    pub fn has_room_for(&self, player_id: &str) -> bool {
        self.connections.contains_key(player_id) || !self.is_full()
    }

    /// True when no new player can be registered
    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Returns the live connection for `player_id`, if any
    pub fn lookup(&self, player_id: &str) -> Option<&Connection> {
        self.connections.get(player_id)
    }

    /// True when `player_id` is connected to this replica
    pub fn contains(&self, player_id: &str) -> bool {
        self.connections.contains_key(player_id)
    }

    /// Queues `message` for `player_id` if they are connected here
    ///
    /// A player without a live local connection is not an error: they are
    /// either on another replica or gone. Returns whether the message was
    /// queued.
    pub fn send(&mut self, player_id: &str, message: OutgoingMessage) -> bool {
        match self.connections.get(player_id) {
            Some(connection) => {
                let kind = message.kind();
                if connection.send(message) {
                    true
                } else {
                    debug!("Connection for player {} closed before {} could be sent", player_id, kind);
                    false
                }
            }
            None => {
                debug!(
                    "No local connection for player {}, dropping {}",
                    player_id,
                    message.kind()
                );
                false
            }
        }
    }

    /// Drops the entry for `player_id`, returning whether one existed
    pub fn remove(&mut self, player_id: &str) -> bool {
        if self.connections.remove(player_id).is_some() {
            info!("Player {} disconnected", player_id);
            true
        } else {
            false
        }
    }

    /// Removes the entry for `player_id` only if it still belongs to `addr`
    ///
    /// A socket closing after its player reconnected elsewhere must not evict
    /// the newer connection.
    pub fn remove_if_addr(&mut self, player_id: &str, addr: SocketAddr) -> bool {
        match self.connections.get(player_id) {
            Some(connection) if connection.addr == addr => self.remove(player_id),
            Some(_) => {
                debug!(
                    "Player {} already reconnected, keeping newer connection over {}",
                    player_id, addr
                );
                false
            }
            None => false,
        }
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// True when nobody is connected
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Configured connection capacity
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{ScoreUpdate, ValidationInfo};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_register_and_send_in_order() {
        let mut registry = ConnectionRegistry::new(4);
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(registry.register("p1", addr(5000), tx));
        assert!(registry.contains("p1"));
        assert_eq!(registry.lookup("p1").map(|c| c.addr), Some(addr(5000)));

        assert!(registry.send("p1", OutgoingMessage::ScoreUpdate(ScoreUpdate { delta: 5 })));
        assert!(registry.send("p1", OutgoingMessage::BadAttack(ValidationInfo::new("nope"))));

        assert_eq!(rx.try_recv().unwrap().kind(), "score-update");
        assert_eq!(rx.try_recv().unwrap().kind(), "bad-attack");
    }

    #[test]
    fn test_send_to_absent_player_is_noop() {
        let mut registry = ConnectionRegistry::new(4);
        assert!(!registry.send("ghost", OutgoingMessage::ScoreUpdate(ScoreUpdate { delta: 0 })));
    }

    #[test]
    fn test_send_to_closed_connection() {
        let mut registry = ConnectionRegistry::new(4);
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register("p1", addr(5000), tx);
        drop(rx);

        assert!(registry.lookup("p1").unwrap().is_closed());
        assert!(!registry.send("p1", OutgoingMessage::ScoreUpdate(ScoreUpdate { delta: 0 })));
    }

    #[test]
    fn test_capacity_limit() {
        let mut registry = ConnectionRegistry::new(1);
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let (tx3, _rx3) = mpsc::unbounded_channel();

        assert!(!registry.is_full());
        assert!(registry.register("p1", addr(5000), tx1));
        assert!(registry.is_full());
        assert!(registry.has_room_for("p1"));
        assert!(!registry.has_room_for("p2"));
        assert!(!registry.register("p2", addr(5001), tx2));
        // Reconnects replace rather than add
        assert!(registry.register("p1", addr(5002), tx3));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stale_socket_does_not_evict_reconnect() {
        let mut registry = ConnectionRegistry::new(4);
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        let (new_tx, mut new_rx) = mpsc::unbounded_channel();

        registry.register("p1", addr(5000), old_tx);
        registry.register("p1", addr(5001), new_tx);

        assert!(!registry.remove_if_addr("p1", addr(5000)));
        assert!(registry.send("p1", OutgoingMessage::ScoreUpdate(ScoreUpdate { delta: 1 })));
        assert!(new_rx.try_recv().is_ok());

        assert!(registry.remove_if_addr("p1", addr(5001)));
        assert!(registry.is_empty());
        assert!(!registry.remove("p1"));
    }
}
