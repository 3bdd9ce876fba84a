//! Canonical default values shared across the backend, workers, and hooks.

use std::time::Duration;

pub const DEFAULT_BACKEND_BIND_ADDR: &str = "127.0.0.1:37840";
pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:37840";
pub const DEFAULT_WORKER_WS_PATH: &str = "/ws/worker";

/// The one hub that always exists and cannot be removed.
pub const BUILTIN_HUB_ID: &str = "hub-builtin";
pub const BUILTIN_HUB_NAME: &str = "builtin";
pub const BUILTIN_HUB_PRIORITY: i64 = 100;

/// First frame on a worker socket must be `auth` within this window.
pub const AUTH_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Worker heartbeat cadence and how many misses the reaper tolerates.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const HEARTBEAT_MAX_MISSES: u32 = 3;

/// Retry backoff: min(cap, base * 2^n) + jitter in [0, base).
pub const RETRY_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_RETRIES: i64 = 3;

/// Reaper cadence for stale tasks and dead workers.
pub const REAPER_INTERVAL: Duration = Duration::from_secs(30);

/// Coalescing window for dispatcher wake-ups under bursty enqueueing.
pub const DISPATCH_COALESCE_WINDOW: Duration = Duration::from_millis(50);

/// Grace period between `task:cancel` and locally failing the task.
pub const CANCEL_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Terminal task rows older than this are deleted by cleanup.
pub const TASK_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Sessions idle longer than this are completed by the stale reaper.
pub const SESSION_STALE_AFTER: Duration = Duration::from_secs(4 * 60 * 60);

/// In-process worker self-exit thresholds.
pub const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const WORKER_MAX_RUNTIME: Duration = Duration::from_secs(2 * 60 * 60);

/// Offline hook queue bounds.
pub const OFFLINE_QUEUE_MAX_ENTRIES: usize = 1000;
pub const OFFLINE_QUEUE_RETRY_CAP: u32 = 5;
pub const OFFLINE_SYNC_BATCH: usize = 50;
pub const OFFLINE_SYNC_ENTRY_TIMEOUT: Duration = Duration::from_secs(5);

/// Hook health probe must answer within this budget.
pub const HOOK_HEALTH_TIMEOUT: Duration = Duration::from_secs(3);
/// Multiplier applied to hook HTTP timeouts on slow hosts.
pub const SLOW_HOST_TIMEOUT_MULTIPLIER: f64 = 1.5;

/// WebSocket close codes used by the hub.
pub const CLOSE_AUTH_FAILED: u16 = 4401;
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4408;
pub const CLOSE_INTERNAL_ERROR: u16 = 4500;
pub const CLOSE_NORMAL: u16 = 1000;
