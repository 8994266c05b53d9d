use clap::Parser;
use log::{error, info};
use server::config::ServerConfig;
use server::network::{Server, ServerMessage};
use server::rating::LocalRatingService;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Arena server with real-time duels")]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Tick rate (updates per second)
    #[arg(short, long, default_value_t = 30)]
    tick_rate: u32,

    /// Maximum number of connected peers
    #[arg(short, long, default_value_t = 32)]
    max_clients: usize,

    /// NPC avatars to spawn into the open arena
    #[arg(long, default_value_t = 2)]
    bots: usize,

    /// Round wins needed to take a duel
    #[arg(long, default_value_t = shared::DUEL_WIN_THRESHOLD)]
    win_threshold: u32,

    /// Countdown before each round, in seconds
    #[arg(long, default_value_t = shared::DUEL_PREPARATION_TIME)]
    preparation_time: f32,

    /// How long a duel request stays open, in seconds
    #[arg(long, default_value_t = shared::DUEL_REQUEST_TIMEOUT)]
    request_timeout: f32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();

    let mut config = ServerConfig::new(
        format!("{}:{}", args.host, args.port),
        args.tick_rate,
        args.max_clients,
    );
    config.bots = args.bots;
    config.duel.win_threshold = args.win_threshold.max(1);
    config.duel.preparation_duration = args.preparation_time.max(0.0);
    config.duel.request_timeout = args.request_timeout.max(0.0);

    info!(
        "Starting server on {} at {}Hz (duels to {} round wins)",
        config.bind_addr, args.tick_rate, config.duel.win_threshold
    );

    let mut server = Server::new(config, Arc::new(LocalRatingService::new())).await?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down");
            if let Err(e) = shutdown.send(ServerMessage::Shutdown) {
                error!("Failed to signal shutdown: {}", e);
            }
        }
    });

    server.run().await
}
