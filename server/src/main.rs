use clap::Parser;
use log::info;
use server::config::ServerConfig;
use server::game::ArenaWorld;
use server::network::Server;
use shared::control::{Control, MOVE_DOWN, MOVE_LEFT, MOVE_RIGHT, MOVE_UP};
use shared::snapshot::EntityDesc;
use shared::Tick;
use std::time::Duration;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "8890")]
    port: u16,
    /// Maximum number of connected peers
    #[clap(short, long, default_value = "50")]
    max_peers: usize,
    /// Peer timeout in milliseconds
    #[clap(long, default_value = "5000")]
    timeout_ms: u64,
    /// Controls applied per second
    #[clap(long, default_value = "60")]
    client_rate: u8,
    /// Snapshots sent per second
    #[clap(long, default_value = "20")]
    server_rate: u8,
    /// First port of the bulk transfer pool
    #[clap(long, default_value = "62000")]
    bulk_port: u16,
    /// Number of scripted players
    #[clap(short, long, default_value = "0")]
    bots: usize,
    /// Arena width
    #[clap(long, default_value = "800")]
    width: f32,
    /// Arena height
    #[clap(long, default_value = "600")]
    height: f32,
}

/// Walks in a square, changing direction every second
fn patrol(_: &EntityDesc, tick: Tick) -> Control {
    const MOVES: [u8; 4] = [MOVE_RIGHT, MOVE_DOWN, MOVE_LEFT, MOVE_UP];
    let leg = (tick / 60) as usize % MOVES.len();
    Control {
        movement: MOVES[leg],
        facing_angle: leg as f32 * std::f32::consts::FRAC_PI_2,
        ..Control::new(tick)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        max_peers: args.max_peers,
        peer_timeout: Duration::from_millis(args.timeout_ms),
        client_rate: args.client_rate,
        server_rate: args.server_rate,
        bulk_port_first: args.bulk_port,
        bots: args.bots,
        ..ServerConfig::default()
    };

    let world = ArenaWorld::new(args.width, args.height);
    let mut server = Server::bind(config.clone(), world).await?;
    for i in 0..config.bots {
        server.add_bot(&format!("bot{}", i), patrol);
    }

    info!("server listening on {}", server.local_addr()?);
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("cannot listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    Ok(())
}
