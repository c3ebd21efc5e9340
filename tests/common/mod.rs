//! Test utilities and common setup.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, header};
use serde_json::Value;
use tempfile::TempDir;

use korvo::agent::{AgentInvoker, AgentOutcome, PromptConfig, TokenUsage};
use korvo::api::{AppState, build_router};
use korvo::db::Database;
use korvo::ledger::{SessionLedger, SessionRepository};
use korvo::pr::{PullRequestApi, RepositoryInfo};
use korvo::quota::{QuotaLimits, QuotaTracker};
use korvo::secrets::{Credentials, StaticSecretStore};
use korvo::worker::classifier::KeywordClassifier;
use korvo::worker::{WorkerConfig, WorkerHub};
use korvo::workspace::{GitWorkspaceManager, WorkspaceConfig};

/// Scripted agent returning a fixed response with fixed usage numbers.
pub struct MockAgent {
    pub text: String,
}

impl MockAgent {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[async_trait]
impl AgentInvoker for MockAgent {
    async fn invoke(&self, _config: PromptConfig) -> Result<AgentOutcome> {
        Ok(AgentOutcome {
            text: self.text.clone(),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            },
            cost_usd: Some(0.01),
            model: Some("claude-sonnet-4".to_string()),
            hit_internal_turn_cap: false,
        })
    }
}

/// PR client that never gets called in general-chat tests; any call is
/// a test failure surfaced as an error.
pub struct UnreachablePrClient;

#[async_trait]
impl PullRequestApi for UnreachablePrClient {
    async fn get_repository(
        &self,
        _repository: &korvo::ledger::RepositoryBinding,
        _token: &str,
    ) -> Result<RepositoryInfo> {
        anyhow::bail!("pull request API should not be reached")
    }

    async fn create_pull_request(
        &self,
        _repository: &korvo::ledger::RepositoryBinding,
        _token: &str,
        _title: &str,
        _body: &str,
        _branch: &str,
        _base_branch: &str,
    ) -> Result<String> {
        anyhow::bail!("pull request API should not be reached")
    }
}

/// A fully wired test application plus handles for assertions.
pub struct TestApp {
    pub router: Router,
    pub quota: Arc<QuotaTracker>,
    pub ledger: Arc<SessionLedger>,
    pub workers: Arc<WorkerHub>,
    // Held so per-session workspaces land in a directory that outlives
    // the test body.
    _workspace_dir: TempDir,
}

/// Credentials the default builders install.
pub fn test_credentials() -> Credentials {
    Credentials {
        agent_key: Some("test-key".to_string()),
        repo_token: Some("test-token".to_string()),
    }
}

/// Build a test app with the default mock agent and generous limits.
pub async fn test_app() -> TestApp {
    test_app_with(Arc::new(MockAgent::new("All done.")), QuotaLimits::default()).await
}

/// Build a test app with a custom agent and quota limits.
pub async fn test_app_with(agent: Arc<dyn AgentInvoker>, limits: QuotaLimits) -> TestApp {
    test_app_custom(agent, limits, test_credentials()).await
}

/// Build a test app with a custom agent, quota limits, and credentials.
pub async fn test_app_custom(
    agent: Arc<dyn AgentInvoker>,
    limits: QuotaLimits,
    credentials: Credentials,
) -> TestApp {
    let db = Database::in_memory().await.unwrap();
    let ledger = Arc::new(SessionLedger::new(SessionRepository::new(db.pool().clone())));
    let quota = Arc::new(QuotaTracker::new(limits));

    let workspace_dir = TempDir::new().unwrap();
    let workspaces = Arc::new(GitWorkspaceManager::new(WorkspaceConfig {
        base_dir: workspace_dir.path().to_path_buf(),
        ..Default::default()
    }));

    let workers = Arc::new(WorkerHub::new(
        ledger.clone(),
        quota.clone(),
        workspaces,
        agent,
        Arc::new(KeywordClassifier::new()),
        Arc::new(UnreachablePrClient),
        WorkerConfig::default(),
    ));

    let state = AppState {
        ledger: ledger.clone(),
        quota: quota.clone(),
        workers: workers.clone(),
        secrets: Arc::new(StaticSecretStore::new(credentials)),
    };

    TestApp {
        router: build_router(state),
        quota,
        ledger,
        workers,
        _workspace_dir: workspace_dir,
    }
}

/// One parsed SSE frame.
#[derive(Debug, Clone)]
pub struct SseFrame {
    pub event: String,
    pub data: Value,
}

/// Parse the raw SSE body into frames, skipping keep-alive comments.
pub fn parse_sse(body: &str) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    for chunk in body.split("\n\n") {
        let mut event = None;
        let mut data = None;
        for line in chunk.lines() {
            if let Some(rest) = line.strip_prefix("event: ") {
                event = Some(rest.to_string());
            } else if let Some(rest) = line.strip_prefix("data: ") {
                data = serde_json::from_str(rest).ok();
            }
        }
        if let (Some(event), Some(data)) = (event, data) {
            frames.push(SseFrame { event, data });
        }
    }
    frames
}

/// POST a JSON body and return the response.
pub fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(method)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

/// Read the full response body (SSE streams end when the turn ends).
pub async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
