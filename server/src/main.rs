use clap::Parser;
use log::{info, warn};
use server::config::{ServerConfig, DEFAULT_ENGINE_TOKEN};
use server::network::{NetworkMessage, Server};
use std::time::Duration;

/// Main-method of the application.
/// Parses command-line arguments, then runs the orchestration server until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,

        /// Server port to listen on
        #[clap(short, long, default_value = "8080")]
        port: u16,

        /// Expected interval between client heartbeats
        #[clap(long, default_value = "1000")]
        heartbeat_interval_ms: u64,

        /// Silent heartbeat intervals before a client counts as disconnected
        #[clap(long, default_value = "3")]
        missed_heartbeats: u32,

        /// Grace window for a disconnected tournament player before forfeit
        #[clap(long, default_value = "10000")]
        forfeit_grace_ms: u64,

        /// Countdown once a room or tournament lobby is ready
        #[clap(long, default_value = "3000")]
        countdown_ms: u64,

        /// Countdown between tournament rounds
        #[clap(long, default_value = "5000")]
        round_countdown_ms: u64,

        /// How long a finished tournament stays subscribable
        #[clap(long, default_value = "60000")]
        finished_linger_ms: u64,

        /// Maximum concurrent connections
        #[clap(long, default_value = "256")]
        max_clients: usize,

        /// Messages buffered per connection before drops
        #[clap(long, default_value = "256")]
        outbox_capacity: usize,

        /// Connect token identifying the game engine
        #[clap(long, default_value = DEFAULT_ENGINE_TOKEN)]
        engine_token: String,
    }

    env_logger::init();

    let args = Args::parse();
    let config = ServerConfig {
        heartbeat_interval: Duration::from_millis(args.heartbeat_interval_ms),
        missed_heartbeats: args.missed_heartbeats,
        forfeit_grace: Duration::from_millis(args.forfeit_grace_ms),
        countdown: Duration::from_millis(args.countdown_ms),
        round_countdown: Duration::from_millis(args.round_countdown_ms),
        finished_linger: Duration::from_millis(args.finished_linger_ms),
        max_clients: args.max_clients,
        outbox_capacity: args.outbox_capacity,
        engine_token: args.engine_token,
    };

    if config.uses_default_engine_token() {
        warn!(
            "Engine token is the default '{}'; any client connecting with it can report results. Set --engine-token",
            DEFAULT_ENGINE_TOKEN
        );
    }

    let address = format!("{}:{}", args.host, args.port);
    let mut server = Server::new(&address, config).await?;

    // Handle shutdown gracefully
    let shutdown = server.shutdown_sender();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down gracefully...");
            let _ = shutdown.send(NetworkMessage::Shutdown);
        }
    });

    server.run().await
}
