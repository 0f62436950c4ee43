use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::info;

use beacond::config::Config;
use beacond::db::MemoryDatabase;
use beacond::server::{self, Server};
use beacond::state::ServerState;
use beacond::workers;

#[derive(Parser, Debug)]
#[command(name = "beacond")]
#[command(about = "LBeacon fleet coordination daemon")]
struct Args {
    /// Path to config file (default: /etc/beacond/beacond.toml, or
    /// $BEACOND_CONFIG)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    println!("[beacond] starting coordination daemon...");

    let config = match &args.config {
        Some(path) => Config::load_path(path)?,
        None => Config::load(),
    };

    let db = Arc::new(MemoryDatabase::new());
    let state = ServerState::new(config, db);
    let server = Server::start(Arc::clone(&state))?;
    println!("[beacond] listening on {}", server.recv_addr());

    workers::spawn_all(&state);

    {
        use tokio::signal::unix::{SignalKind, signal};
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut sigterm = signal(SignalKind::terminate()).unwrap();
            sigterm.recv().await;
            println!("[beacond] SIGTERM received, shutting down...");
            state.shutdown();
        });
    }
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("[beacond] Ctrl+C received, shutting down...");
                state.shutdown();
            }
        });
    }

    // The main thread drives the two periodic polling broadcasts until the
    // shutdown flag flips.
    server::run_periodic_broadcasts(Arc::clone(&state)).await;

    info!(
        "shutting down: {} packets received, {} sent, {} fence violations",
        state.metrics.packets_received(),
        state.metrics.packets_sent(),
        state.metrics.fence_violations()
    );
    server.shutdown();
    println!("[beacond] stopped.");
    Ok(())
}
