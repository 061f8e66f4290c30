//! # Shipwars Game Server Library
//!
//! This library provides the authoritative backend for two-player naval
//! combat matches. It validates ship placements, enforces turn order,
//! resolves attacks and bonus rounds, keeps scores and pushes the resulting
//! state to every connected player.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Game Rules
//! Clients only submit intentions. Whether ships fit the board, whose turn it
//! is, what an attack hit and what it was worth are all decided here.
//!
//! ### Cross-Replica Convergence
//! Several replicas can serve the same game epoch. They share nothing but
//! the cache store: player and match records live there, and each replica
//! learns about writes made elsewhere through the store's change feed.
//! The convergence listener uses that feed to detect when both boards of a
//! match are locked, however the two players are spread over replicas.
//!
//! ### Connection Management
//! Each replica tracks only the players connected to it. Messages for a
//! player connected elsewhere are dropped; that player picks up the
//! persisted state from the store on their next reconnect.
//!
//! ## Architecture Design
//!
//! ### Reload, Mutate, Persist
//! No handler keeps records in memory between messages. Every message reloads
//! the records it needs from the store, applies its change and writes them
//! back, so the store's last write is always the truth.
//!
//! ### Ordered Per-Connection Queues
//! Every connection owns an unbounded queue drained by its own task. Replies
//! and pushes from other connections are written in the order they were
//! queued, which is what keeps a score update behind the attack result it
//! belongs to.
//!
//! ### Tagged Errors
//! Input errors go back to the client with detail. Invariant violations are
//! logged in full and surface only as an opaque `server-error`.
//!
//! ## Module Organization
//!
//! ### Rules (`game`, `scoring`, `match_instance`, `player`, `epoch`)
//! - Ship placement validation and game-over detection
//! - Attack resolution and score arithmetic
//! - Match phases, turns and winners
//! - Per-player boards, scores and attack history
//! - The running game epoch
//!
//! ### State (`store`, `listener`, `leaderboard`)
//! - TTL-bounded cache store with a change feed
//! - Readiness detection driven by that feed
//! - Bounded high-score list
//!
//! ### Delivery (`handlers`, `client_manager`, `network`, `events`)
//! - Message dispatch for `connection`, `ship-positions`, `attack` and `bonus`
//! - Registry of live connections on this replica
//! - Newline-delimited JSON transport and the leaderboard feed
//! - Fire-and-forget outbound integrations
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::client_manager::ConnectionRegistry;
//! use server::config::GameSettings;
//! use server::epoch::GameConfiguration;
//! use server::events::Collaborators;
//! use server::handlers::GameServer;
//! use server::leaderboard::Leaderboard;
//! use server::network::{ConnectionLimits, Server};
//! use server::store::{MemoryStore, Records};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let game = Arc::new(GameConfiguration::new(None, 5000, "local"));
//!     let handlers = GameServer::new(
//!         game,
//!         GameSettings::default(),
//!         Records::new(Arc::new(MemoryStore::default())),
//!         ConnectionRegistry::shared(1024),
//!         Leaderboard::shared(20),
//!         Collaborators::logging("http://localhost:8282"),
//!     );
//!
//!     // Accept connections until the process is stopped
//!     let server = Server::bind("127.0.0.1:8080", handlers, ConnectionLimits::default()).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! The binary additionally runs the convergence listener, the expiry sweeper
//! and the leaderboard feed as separate tasks.

pub mod client_manager;
pub mod config;
pub mod epoch;
pub mod error;
pub mod events;
pub mod game;
pub mod handlers;
pub mod leaderboard;
pub mod listener;
pub mod match_instance;
pub mod network;
pub mod player;
pub mod scoring;
pub mod store;
pub mod utils;
