//! Engram worker: a single-connection task processor.
//!
//! A worker authenticates to the hub over a WebSocket, declares its
//! capabilities, and processes one task at a time. In-process workers are
//! additionally guarded by a host-wide filesystem mutex so at most one of
//! them runs per machine.

pub mod cancel;
pub mod handlers;
pub mod lifecycle;
pub mod worker;

pub use cancel::CancellationToken;
pub use handlers::{HandlerError, HandlerRegistry, TaskHandler};
pub use lifecycle::{ExitReason, LifecycleLimits, WorkerLock};
pub use worker::{Worker, WorkerConfig};
