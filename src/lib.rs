//! Korvo library.
//!
//! Core components of the interactive coding-agent session service:
//! admission control, the durable session ledger, per-session compute
//! workers, git workspaces, and the SSE streaming API.

pub mod agent;
pub mod api;
pub mod db;
pub mod ledger;
pub mod pr;
pub mod quota;
pub mod secrets;
pub mod stream;
pub mod worker;
pub mod workspace;
