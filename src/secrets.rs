//! Credential resolution.
//!
//! Handlers never read credentials from request bodies; they resolve
//! them through a [`SecretStore`] so tests and future vault backends
//! can slot in without touching the request path.

use async_trait::async_trait;

/// Credentials for one session: the agent API key and an optional
/// repository access token. Neither value is ever logged.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub agent_key: Option<String>,
    pub repo_token: Option<String>,
}

/// Resolves credentials for a session, optionally scoped to a named
/// installation.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn resolve(&self, installation: Option<&str>) -> anyhow::Result<Credentials>;
}

/// Reads credentials from process environment variables.
pub struct EnvSecretStore;

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn resolve(&self, _installation: Option<&str>) -> anyhow::Result<Credentials> {
        Ok(Credentials {
            agent_key: std::env::var("KORVO_AGENT_KEY").ok(),
            repo_token: std::env::var("KORVO_REPO_TOKEN").ok(),
        })
    }
}

/// Fixed credentials, used by tests.
pub struct StaticSecretStore {
    credentials: Credentials,
}

impl StaticSecretStore {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn resolve(&self, _installation: Option<&str>) -> anyhow::Result<Credentials> {
        Ok(self.credentials.clone())
    }
}
