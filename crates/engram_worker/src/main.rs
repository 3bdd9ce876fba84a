//! Engram worker binary.
//!
//! Usage:
//!     engram-worker --backend-url http://127.0.0.1:37840 --token egt_...

use anyhow::Context;
use clap::Parser;
use engram_logging::{init_logging, LogConfig};
use engram_protocol::defaults::{DEFAULT_BACKEND_URL, WORKER_IDLE_TIMEOUT, WORKER_MAX_RUNTIME};
use engram_worker::{
    ExitReason, HandlerRegistry, LifecycleLimits, Worker, WorkerConfig, WorkerLock,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "engram-worker", about = "Engram task worker")]
struct Args {
    /// Backend base URL
    #[arg(long, env = "ENGRAM_BACKEND_URL", default_value = DEFAULT_BACKEND_URL)]
    backend_url: String,

    /// Worker auth token
    #[arg(long, env = "ENGRAM_WORKER_TOKEN")]
    token: String,

    /// Skip the host-wide in-process worker lock (dedicated workers)
    #[arg(long)]
    no_lock: bool,

    /// Idle self-exit window in seconds
    #[arg(long, default_value_t = WORKER_IDLE_TIMEOUT.as_secs())]
    idle_timeout_secs: u64,

    /// Max runtime in seconds
    #[arg(long, default_value_t = WORKER_MAX_RUNTIME.as_secs())]
    max_runtime_secs: u64,

    /// Identity assigned by a spawning backend; the hub drains such
    /// workers after one task
    #[arg(long, env = "ENGRAM_SPAWNED_ID")]
    spawned_id: Option<String>,

    /// Verbose stderr logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(LogConfig {
        app_name: "engram-worker",
        verbose: args.verbose,
        quiet_stderr: false,
    })?;

    // In-process workers are exclusive per host; another live worker means
    // this process has nothing to do.
    let _lock = if args.no_lock {
        None
    } else {
        let lock_path = engram_logging::worker_lock_path();
        match WorkerLock::acquire(&lock_path).context("Worker lock acquisition failed")? {
            Some(lock) => Some(lock),
            None => {
                tracing::info!("Another in-process worker holds the lock; exiting");
                return Ok(());
            }
        }
    };

    let registry = Arc::new(HandlerRegistry::with_builtin_handlers());
    let metadata = match &args.spawned_id {
        Some(spawned_id) => serde_json::json!({"spawned_id": spawned_id}),
        None => serde_json::Value::Null,
    };

    let config = WorkerConfig {
        backend_url: args.backend_url,
        token: args.token,
        labels: HashMap::new(),
        metadata,
        system_id: system_id(),
    };

    let limits = LifecycleLimits {
        idle_timeout: Duration::from_secs(args.idle_timeout_secs),
        max_runtime: Duration::from_secs(args.max_runtime_secs),
    };

    let mut worker = Worker::connect(&config, registry).await?;
    let reason = worker.run(&limits).await?;
    match reason {
        ExitReason::Idle => tracing::info!("Worker exited: idle timeout"),
        ExitReason::MaxRuntime => tracing::info!("Worker exited: max runtime"),
        ExitReason::Disconnected => tracing::warn!("Worker exited: backend disconnected"),
        ExitReason::Shutdown => tracing::info!("Worker exited: server shutdown"),
    }
    Ok(())
}

/// Host+pid identity, stable for the life of this process.
fn system_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    format!("{}:{}", host, std::process::id())
}
