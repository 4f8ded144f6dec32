//! Huddle Signal Relay
//!
//! WebSocket signaling relay for two-peer call negotiation, with SQLite
//! persistence of call state so a peer can rejoin after a brief drop.
//!
//! # Usage
//!
//! ```bash
//! # In-memory store (state lost on restart)
//! huddle-signal --port 4070
//!
//! # With SQLite persistence
//! huddle-signal --port 4070 --db /var/lib/huddle/calls.db
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use huddle_core::Config;
use huddle_signal::{CallStore, SignalServer};

#[derive(Parser, Debug)]
#[command(name = "huddle-signal")]
#[command(about = "Huddle signaling relay for two-peer call negotiation")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// SQLite database path (uses an in-memory store if not specified)
    #[arg(short, long)]
    db: Option<PathBuf>,

    /// Sliding TTL for inactive calls, in seconds
    #[arg(long)]
    ttl_secs: Option<u64>,

    /// Config file path (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {:?}", path))?,
        None => Config::load(),
    };
    if let Some(port) = args.port {
        config.signal.port = port;
    }
    if let Some(bind) = &args.bind {
        config.signal.bind = bind.parse().context("invalid bind address")?;
    }
    if args.db.is_some() {
        config.signal.db_path = args.db.clone();
    }
    if let Some(ttl) = args.ttl_secs {
        config.signal.call_ttl_secs = ttl;
    }

    let addr: SocketAddr = SocketAddr::new(config.signal.bind, config.signal.port);

    info!("Starting Huddle signal relay");
    info!("Listening on {}", addr);

    // A store that cannot be opened is the only fatal startup condition;
    // better to abort than to serve half-initialized
    let store = match &config.signal.db_path {
        Some(db_path) => {
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {:?}", parent))?;
            }
            info!("Using SQLite persistence: {:?}", db_path);
            CallStore::open(db_path, config.signal.call_ttl_secs)
                .context("failed to open call store")?
        }
        None => {
            info!("Using in-memory store (no persistence)");
            CallStore::in_memory(config.signal.call_ttl_secs)
                .context("failed to open call store")?
        }
    };

    let surviving = store.call_count().unwrap_or(0);
    if surviving > 0 {
        info!("Loaded {} live calls from database", surviving);
    }

    let server = SignalServer::new(store, config.signal.clone());
    server.serve(addr).await?;

    Ok(())
}
