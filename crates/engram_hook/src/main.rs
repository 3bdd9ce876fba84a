//! Engram hook binary.
//!
//! Invoked by the editor on hook events with the event payload on stdin.
//! A failure to reach the backend is never an error exit: the event is
//! queued and the hook reports a skip so the editor proceeds.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use engram_hook::{BackendClient, ClientConfig, Delivery, OfflineQueue};
use engram_logging::{init_logging, LogConfig};
use engram_protocol::defaults::DEFAULT_BACKEND_URL;
use engram_protocol::http::{ObservationRequest, SessionInitRequest, SummarizeRequest};
use engram_protocol::TraceContext;
use std::io::Read;

#[derive(Parser, Debug)]
#[command(name = "engram-hook", about = "Engram editor hook client")]
struct Args {
    /// Backend base URL
    #[arg(long, env = "ENGRAM_BACKEND_URL", default_value = DEFAULT_BACKEND_URL)]
    backend_url: String,

    /// Bearer token for remote mode
    #[arg(long, env = "ENGRAM_API_TOKEN")]
    api_token: Option<String>,

    /// Apply the slow-host timeout multiplier
    #[arg(long, env = "ENGRAM_SLOW_HOST")]
    slow_host: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Session start / user prompt hook (payload on stdin)
    SessionInit,
    /// Tool observation hook (payload on stdin)
    Observation,
    /// Summarize / stop hook (payload on stdin)
    Summarize,
    /// Replay the offline queue without sending a new event
    Sync,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(LogConfig {
        app_name: "engram-hook",
        verbose: false,
        quiet_stderr: true,
    })?;

    let queue = OfflineQueue::open(&engram_logging::offline_queue_path())?;
    let client = BackendClient::new(
        ClientConfig {
            base_url: args.backend_url,
            api_token: args.api_token,
            slow_host: args.slow_host,
        },
        queue,
    )?;

    // Replay earlier captures before (and independently of) this event.
    // Sync failures are logged, never surfaced.
    if let Err(e) = client.sync().await {
        tracing::warn!("Offline sync failed: {}", e);
    }

    let trace = TraceContext::new_root();
    let delivery = match args.command {
        Command::SessionInit => {
            let payload: SessionInitRequest = read_stdin_payload()?;
            client
                .send_or_enqueue(
                    "session-init",
                    "/api/hooks/session-init",
                    serde_json::to_value(payload)?,
                    &trace,
                )
                .await?
        }
        Command::Observation => {
            let payload: ObservationRequest = read_stdin_payload()?;
            client
                .send_or_enqueue(
                    "observation",
                    "/api/hooks/observation",
                    serde_json::to_value(payload)?,
                    &trace,
                )
                .await?
        }
        Command::Summarize => {
            let payload: SummarizeRequest = read_stdin_payload()?;
            client
                .send_or_enqueue(
                    "summarize",
                    "/api/hooks/summarize",
                    serde_json::to_value(payload)?,
                    &trace,
                )
                .await?
        }
        Command::Sync => {
            let report = client.sync().await?;
            println!(
                "{}",
                serde_json::json!({
                    "delivered": report.delivered,
                    "failed": report.failed,
                    "evicted": report.evicted,
                    "remaining": client.queue().len(),
                })
            );
            return Ok(());
        }
    };

    // The editor reads this line; "queued" is a success from its point of
    // view.
    match delivery {
        Delivery::Sent(body) => println!("{}", body),
        Delivery::Queued(id) => {
            println!("{}", serde_json::json!({"status": "queued", "entry_id": id}))
        }
    }
    Ok(())
}

fn read_stdin_payload<T: serde::de::DeserializeOwned>() -> Result<T> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("Failed to read hook payload from stdin")?;
    serde_json::from_str(&input).context("Invalid hook payload JSON")
}
