use clap::Parser;
use client::config::ClientConfig;
use client::network::{Client, ClientCommand};
use client::view::LogView;
use log::info;
use rand::Rng;
use shared::transport::DEFAULT_PORT;
use shared::Vec2;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value_t = format!("127.0.0.1:{}", DEFAULT_PORT))]
    server: String,

    /// Display name sent with the join request
    #[arg(short = 'u', long, default_value = "Player 1")]
    username: String,

    /// Position updates per second
    #[arg(short, long, default_value = "60")]
    tick_rate: u32,

    /// Largest step of the random walk, per axis
    #[arg(long, default_value = "1.0")]
    step: f32,
}

/// Stands in for keyboard input: nudges the local position every 100ms
fn spawn_random_walk(commands: mpsc::UnboundedSender<ClientCommand>, step: f32) {
    tokio::spawn(async move {
        let mut walk_interval = tokio::time::interval(Duration::from_millis(100));
        loop {
            walk_interval.tick().await;
            let delta = {
                let mut rng = rand::thread_rng();
                Vec2::new(rng.gen_range(-step..=step), rng.gen_range(-step..=step))
            };
            if commands.send(ClientCommand::MoveBy(delta)).is_err() {
                break;
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    info!("Connecting to: {} as '{}'", args.server, args.username);

    let config = ClientConfig {
        server_address: args.server,
        username: args.username,
        tick_rate: args.tick_rate,
        ..ClientConfig::default()
    };

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    spawn_random_walk(commands_tx.clone(), args.step.abs());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, disconnecting...");
            let _ = commands_tx.send(ClientCommand::Disconnect);
        }
    });

    let mut client = Client::new(config, LogView::new()).await?;
    client.run(commands_rx).await?;

    info!("Applied {} remote position changes", client.view().moves());

    Ok(())
}
