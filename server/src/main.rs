use clap::Parser;
use log::{error, info, warn};
use server::client_manager::ConnectionRegistry;
use server::config::Config;
use server::epoch::GameConfiguration;
use server::events::Collaborators;
use server::handlers::GameServer;
use server::leaderboard::Leaderboard;
use server::listener::ConvergenceListener;
use server::network::{ConnectionLimits, LeaderboardFeed, Server, LEADERBOARD_PUSH_INTERVAL};
use server::store::{run_expiry_sweeper, CacheStore, MemoryStore, Records};
use std::sync::Arc;
use std::time::Duration;

/// How often expired cache records are purged
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// How long shutdown waits for outbound events and records to be delivered
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Main-method of the application.
/// Parses configuration, then runs the game server, the convergence listener,
/// the cache sweeper and the leaderboard feed until one of them stops or
/// Ctrl+C is received.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::parse();
    config.validate()?;

    let game = Arc::new(GameConfiguration::new(
        config.game_id.clone(),
        config.bonus_duration_ms,
        config.cluster_name.clone(),
    ));
    info!(
        "Starting game {} on cluster {} with a {}x{} grid",
        game.uuid(),
        game.cluster(),
        config.grid_size,
        config.grid_size
    );

    let store = Arc::new(MemoryStore::new(config.cache_ttl()));
    let records = Records::new(Arc::clone(&store));
    let registry = ConnectionRegistry::shared(config.max_connections);
    let leaderboard = Leaderboard::shared(config.leaderboard_size);
    let collaborators = Collaborators::logging(config.ai_agent_server_url.clone());

    // Subscribe before accepting connections so no write goes unseen
    let changes = store.subscribe();
    let listener = ConvergenceListener::new(
        Arc::clone(&game),
        records.clone(),
        Arc::clone(&registry),
        collaborators.clone(),
    );

    let handlers = GameServer::new(
        Arc::clone(&game),
        config.game_settings(),
        records,
        registry,
        Arc::clone(&leaderboard),
        collaborators.clone(),
    );

    let limits = ConnectionLimits {
        max_payload: config.max_payload,
        activity_timeout: config.activity_timeout(),
    };
    let server = Server::bind(&config.game_address(), handlers, limits).await?;
    let feed = LeaderboardFeed::bind(&config.leaderboard_address(), leaderboard, LEADERBOARD_PUSH_INTERVAL).await?;

    let listener_handle = tokio::spawn(listener.run(changes));
    let sweeper_handle = tokio::spawn(run_expiry_sweeper(store, SWEEP_INTERVAL));
    let server_handle = tokio::spawn(server.run());
    let feed_handle = tokio::spawn(feed.run());

    tokio::select! {
        result = server_handle => {
            match result {
                Ok(Err(e)) => error!("Game server stopped: {}", e),
                Err(e) => error!("Game server task panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
        result = feed_handle => {
            match result {
                Ok(Err(e)) => error!("Leaderboard feed stopped: {}", e),
                Err(e) => error!("Leaderboard feed task panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
        result = listener_handle => {
            if let Err(e) = result {
                error!("Convergence listener task panicked: {}", e);
            }
        }
        result = sweeper_handle => {
            if let Err(e) = result {
                error!("Cache sweeper task panicked: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    if tokio::time::timeout(DRAIN_TIMEOUT, collaborators.settled()).await.is_err() {
        warn!(
            "Gave up on {} outbound deliveries after {:?}",
            collaborators.pending(),
            DRAIN_TIMEOUT
        );
    }

    Ok(())
}
