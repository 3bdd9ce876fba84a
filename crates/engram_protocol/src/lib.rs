//! Wire grammar for the Engram control plane.
//!
//! Backend <-> Worker communication is JSON frames over a WebSocket; this
//! crate is the single source of truth for the frame shapes, the task and
//! hub vocabulary, trace propagation, and the canonical defaults shared by
//! the backend, workers, and hook clients.

pub mod dedup;
pub mod defaults;
pub mod error;
pub mod http;
pub mod ids;
pub mod messages;
pub mod trace;
pub mod types;

// Re-export the types used at nearly every call site.
pub use error::ErrorKind;
pub use ids::{HubId, SessionId, TaskId, TokenId, WorkerId};
pub use messages::{
    AuthPayload, AuthResult, HubMessage, RegistrationInfo, TaskAssignment, TaskErrorReport,
    TaskProgressReport, TaskResultReport, WorkerMessage,
};
pub use trace::TraceContext;
pub use types::{
    HubStatus, HubType, RegistrationStatus, SessionStatus, TaskStatus, TaskType, TokenScope,
};
