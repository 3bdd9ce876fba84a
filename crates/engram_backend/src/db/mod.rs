//! Persistent store services over the Engram database.

pub mod hubs;
pub mod models;
pub mod queue;
pub mod sessions;
pub mod tokens;

pub use hubs::HubStore;
pub use queue::{FailOutcome, NewTask, TaskQueue};
pub use sessions::SessionStore;
pub use tokens::{RegistrationRecord, TokenRecord, TokenStore};
