//! Durable session ledger: models, persistence, and the service that
//! serializes writes per session id.

mod models;
mod repository;
mod service;

pub use models::{
    ChatMessage, MessageRole, RepositoryBinding, SessionOptions, SessionRecord, SessionStatus,
};
pub use repository::SessionRepository;
pub use service::{DEFAULT_IDLE_TIMEOUT_MINUTES, SessionLedger, SessionUpdate};
