//! Engram hook client.
//!
//! Hook processes are ephemeral: they fire on editor events, post to the
//! backend, and exit. A backend outage must never surface to the editor,
//! so every failed delivery lands in a durable offline queue that the next
//! hook invocation replays.

pub mod client;
pub mod offline_queue;

pub use client::{BackendClient, ClientConfig, Delivery, SyncReport};
pub use offline_queue::{OfflineQueue, OfflineQueueEntry};
