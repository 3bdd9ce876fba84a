//! Engram backend binary.
//!
//! Usage:
//!     engram-backend --bind 127.0.0.1:37840 --database ~/.engram/engram.db

use clap::Parser;
use engram_backend::BackendConfig;
use engram_logging::{init_logging, LogConfig};
use engram_protocol::defaults::DEFAULT_BACKEND_BIND_ADDR;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "engram-backend", about = "Engram memory-and-observation backend")]
struct Args {
    /// HTTP/WebSocket bind address
    #[arg(long, env = "ENGRAM_BIND", default_value = DEFAULT_BACKEND_BIND_ADDR)]
    bind: String,

    /// SQLite database path (defaults to ~/.engram/engram.db)
    #[arg(long, env = "ENGRAM_DB")]
    database: Option<PathBuf>,

    /// Bearer token required on the API (remote mode)
    #[arg(long, env = "ENGRAM_API_TOKEN")]
    api_token: Option<String>,

    /// Shared secret for hub federation
    #[arg(long, env = "ENGRAM_HUB_TOKEN")]
    hub_token: Option<String>,

    /// Verbose stderr logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(LogConfig {
        app_name: "engram-backend",
        verbose: args.verbose,
        quiet_stderr: false,
    })?;

    let db_path = args
        .database
        .unwrap_or_else(engram_logging::default_db_path);

    tracing::info!("Starting Engram backend");
    tracing::info!("  Bind: {}", args.bind);
    tracing::info!("  Database: {}", db_path.display());

    engram_backend::run(BackendConfig {
        bind_addr: args.bind,
        db_path,
        api_token: args.api_token,
        hub_token: args.hub_token,
    })
    .await
}
