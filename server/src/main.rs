use clap::Parser;
use log::info;
use server::config::ServerConfig;
use server::network::{Server, ServerMessage};
use shared::transport::DEFAULT_PORT;
use shared::{LinkSettings, Vec2};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Snapshot broadcasts per second
    #[arg(short, long, default_value = "30")]
    tick_rate: u32,

    /// Maximum concurrent connections
    #[arg(short, long, default_value = "8")]
    max_connections: usize,

    /// Spawn position X
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    spawn_x: f32,

    /// Spawn position Y
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    spawn_y: f32,

    /// Seconds of silence before a client is dropped
    #[arg(long, default_value = "5")]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = ServerConfig {
        bind_address: format!("{}:{}", args.host, args.port),
        tick_rate: args.tick_rate,
        max_connections: args.max_connections,
        spawn_position: Vec2::new(args.spawn_x, args.spawn_y),
        link: LinkSettings {
            timeout: Duration::from_secs(args.timeout),
            ..LinkSettings::default()
        },
    };

    let mut server = Server::new(config).await?;
    let handle = server.handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down gracefully...");
            let _ = handle.send(ServerMessage::Shutdown);
        }
    });

    server.run().await?;

    Ok(())
}
