use clap::Parser;
use client::network::Client;
use log::info;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Display name, sent as the connect token
    #[arg(short = 'n', long, default_value = "player")]
    name: String,

    /// Interval between heartbeats in milliseconds
    #[arg(long, default_value = "1000")]
    heartbeat_interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    info!("Connecting to: {} as {}", args.server, args.name);

    let mut client = Client::new(
        &args.server,
        &args.name,
        Duration::from_millis(args.heartbeat_interval_ms),
    )
    .await?;

    client.run().await?;

    Ok(())
}
