use clap::Parser;
use std::path::PathBuf;

use quire_sync::server::{ServerConfig, SyncServer};
use quire_sync::session::SessionConfig;
use quire_sync::storage::OpLogConfig;
use quire_sync::SyncError;

/// Quire sync server - sequences collaborative edits per file
#[derive(Parser, Debug)]
#[command(name = "quire-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory for snapshots (in-memory if omitted)
    #[arg(short, long)]
    storage: Option<PathBuf>,

    /// Applied operations kept per file for catch-up
    #[arg(long, default_value_t = 1000)]
    history_capacity: usize,

    /// Operations buffered before a snapshot is written
    #[arg(long, default_value_t = 64)]
    snapshot_every: usize,

    /// Seconds between idle-session sweeps
    #[arg(long, default_value_t = 30)]
    sweep_interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), SyncError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = ServerConfig {
        bind_addr: args.bind,
        session: SessionConfig {
            history_capacity: args.history_capacity.max(1),
            oplog: OpLogConfig {
                snapshot_every: args.snapshot_every.max(1),
            },
        },
        storage_path: args.storage,
        sweep_interval_secs: args.sweep_interval,
    };
    let server = SyncServer::new(config)?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down, flushing open sessions");
        }
    }
    server.directory().flush_all().await
}
