//! Shared application state for the HTTP API.

use std::sync::Arc;

use crate::ledger::SessionLedger;
use crate::quota::QuotaTracker;
use crate::secrets::SecretStore;
use crate::worker::WorkerHub;

/// State shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<SessionLedger>,
    pub quota: Arc<QuotaTracker>,
    pub workers: Arc<WorkerHub>,
    pub secrets: Arc<dyn SecretStore>,
}
