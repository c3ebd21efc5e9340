//! Per-session compute workers.
//!
//! A dispatch runs exactly one turn for one session: workspace setup,
//! one agent invocation, usage accounting, optional git persistence,
//! then teardown. Workers are session-exclusive and never reused; the
//! hub only keeps per-session turn locks and cancellation tokens.

pub mod classifier;

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use dashmap::DashMap;
use log::{error, info, warn};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentInvoker, AgentOutcome, PromptConfig};
use crate::ledger::{
    ChatMessage, MessageRole, SessionLedger, SessionRecord, SessionStatus, SessionUpdate,
};
use crate::pr::PullRequestApi;
use crate::quota::{QuotaTracker, pricing};
use crate::secrets::Credentials;
use crate::stream::{SseEvent, TurnStream, now};
use crate::worker::classifier::InputClassifier;
use crate::workspace::{GitWorkspaceManager, WorkspaceState};

/// Longest prompt preview carried in a `claude_start` frame.
const PREVIEW_MAX_CHARS: usize = 200;

/// One turn of work handed to the hub.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    pub message: String,
    pub credentials: Credentials,
}

/// Tunables shared by all workers.
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    /// Model forwarded to the agent CLI; the agent's default when absent.
    pub agent_model: Option<String>,
}

/// Dispatches and tracks per-session compute workers.
pub struct WorkerHub {
    ledger: Arc<SessionLedger>,
    quota: Arc<QuotaTracker>,
    workspaces: Arc<GitWorkspaceManager>,
    agent: Arc<dyn AgentInvoker>,
    classifier: Arc<dyn InputClassifier>,
    pr_api: Arc<dyn PullRequestApi>,
    config: WorkerConfig,
    /// No two turns of the same session may overlap.
    turn_locks: DashMap<String, Arc<Mutex<()>>>,
    cancel_tokens: DashMap<String, CancellationToken>,
}

impl WorkerHub {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<SessionLedger>,
        quota: Arc<QuotaTracker>,
        workspaces: Arc<GitWorkspaceManager>,
        agent: Arc<dyn AgentInvoker>,
        classifier: Arc<dyn InputClassifier>,
        pr_api: Arc<dyn PullRequestApi>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            ledger,
            quota,
            workspaces,
            agent,
            classifier,
            pr_api,
            config,
            turn_locks: DashMap::new(),
            cancel_tokens: DashMap::new(),
        }
    }

    fn turn_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.turn_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn cancel_token(&self, session_id: &str) -> CancellationToken {
        self.cancel_tokens
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Best-effort cancellation of a session's in-flight turn. Not
    /// awaited; the worker notices at its next suspension point.
    pub fn shutdown(&self, session_id: &str) {
        if let Some((_, token)) = self.cancel_tokens.remove(session_id) {
            token.cancel();
        }
        self.turn_locks.remove(session_id);
    }

    /// Whether the hub still holds per-session state for this id.
    pub fn is_tracking(&self, session_id: &str) -> bool {
        self.turn_locks.contains_key(session_id) || self.cancel_tokens.contains_key(session_id)
    }

    /// One housekeeping pass: reap idle sessions and release everything
    /// attached to them (quota slot, cancel token, turn lock), then
    /// reconcile quota state. Returns the reaped ids.
    pub async fn run_maintenance(&self) -> Result<Vec<String>> {
        let reaped = self.ledger.sweep_idle().await?;
        for id in &reaped {
            self.quota.end_session(id);
            self.shutdown(id);
        }

        self.quota.reap_stale();
        self.quota.prune_old_buckets();
        Ok(reaped)
    }

    /// Spawn a worker for one turn and return the event receiver to
    /// adapt into the SSE response. The session record must exist.
    pub async fn dispatch(
        self: Arc<Self>,
        request: TurnRequest,
    ) -> Result<mpsc::Receiver<SseEvent>> {
        // Existence check up front so an unknown id is a JSON error,
        // not an SSE stream.
        if self.ledger.get(&request.session_id).await?.is_none() {
            return Err(anyhow!("session {} not found", request.session_id));
        }

        let (mut stream, rx) = TurnStream::channel(request.session_id.clone());

        let hub = self;
        tokio::spawn(async move {
            let session_id = request.session_id.clone();
            stream.connected().await;

            let lock = hub.turn_lock(&session_id);
            let _guard = lock.lock().await;

            // The record is read under the turn lock: concurrent
            // dispatches for one session serialize here, so every turn
            // sees the counter its predecessor wrote and the cap cannot
            // be raced past by parallel requests.
            let record = match hub.ledger.get(&session_id).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    stream
                        .fail(format!("session {} not found", session_id))
                        .await;
                    stream.finish().await;
                    return;
                }
                Err(e) => {
                    error!("session {}: loading record failed: {:#}", session_id, e);
                    stream.fail(e.to_string()).await;
                    stream.finish().await;
                    return;
                }
            };

            // At the turn cap the dispatch still honors the stream
            // contract but never reaches the agent.
            if record.current_turn >= record.options.max_turns {
                stream
                    .emit(SseEvent::status(format!(
                        "Turn limit of {} reached for this session",
                        record.options.max_turns
                    )))
                    .await;
                stream.complete(record.current_turn).await;
                stream.finish().await;
                return;
            }

            let token = hub.cancel_token(&session_id);

            let result = tokio::select! {
                _ = token.cancelled() => Err(anyhow!("session ended during turn")),
                result = hub.run_turn(&mut stream, &record, &request) => result,
            };

            match result {
                Ok(turn) => {
                    stream.complete(turn).await;
                }
                Err(e) => {
                    error!("session {}: turn failed: {:#}", session_id, e);
                    let update = SessionUpdate {
                        status: Some(SessionStatus::Error),
                        ..Default::default()
                    };
                    if let Err(e) = hub.ledger.update(&session_id, update).await {
                        error!("session {}: failed to record error status: {:#}", session_id, e);
                    }
                    stream.fail(e.to_string()).await;
                }
            }

            stream.finish().await;
        });

        Ok(rx)
    }

    /// One full turn. Returns the new turn counter on success. The
    /// workspace, if any, is torn down on every path.
    async fn run_turn(
        &self,
        stream: &mut TurnStream,
        record: &SessionRecord,
        request: &TurnRequest,
    ) -> Result<i64> {
        let session_id = &request.session_id;

        self.ledger
            .update(
                session_id,
                SessionUpdate {
                    status: Some(SessionStatus::Processing),
                    ..Default::default()
                },
            )
            .await?;

        let mut workspace = match &record.repository {
            Some(repository) => {
                stream
                    .emit(SseEvent::status(format!(
                        "Cloning repository {}",
                        repository.name
                    )))
                    .await;
                let ws = self
                    .workspaces
                    .setup_workspace(
                        session_id,
                        repository,
                        request.credentials.repo_token.as_deref(),
                    )
                    .await?;
                self.workspaces.initialize(&ws).await?;
                Some(ws)
            }
            None => {
                stream
                    .emit(SseEvent::status(
                        "No repository configured, running in general chat mode",
                    ))
                    .await;
                None
            }
        };

        let result = self
            .execute_turn(stream, record, request, workspace.as_mut())
            .await;

        if let Some(ws) = &workspace {
            self.workspaces.teardown(ws).await;
        }

        result
    }

    async fn execute_turn(
        &self,
        stream: &mut TurnStream,
        record: &SessionRecord,
        request: &TurnRequest,
        mut workspace: Option<&mut WorkspaceState>,
    ) -> Result<i64> {
        let session_id = &request.session_id;
        let turn = record.current_turn + 1;

        self.ledger
            .update(
                session_id,
                SessionUpdate {
                    push_messages: vec![ChatMessage::new(MessageRole::User, &request.message)],
                    ..Default::default()
                },
            )
            .await?;

        stream
            .emit(SseEvent::ClaudeStart {
                preview: preview(&request.message),
                turn,
                timestamp: now(),
            })
            .await;

        let prompt = match &record.repository {
            // Minimal context: the clone itself is the context, the
            // prompt only anchors the agent to the checkout.
            Some(repository) => format!(
                "You are working in a checkout of the repository {}{}.\n\n{}",
                repository.name,
                repository
                    .branch
                    .as_deref()
                    .map(|b| format!(" on branch {b}"))
                    .unwrap_or_default(),
                request.message
            ),
            None => request.message.clone(),
        };

        let outcome = self
            .agent
            .invoke(PromptConfig {
                prompt,
                working_dir: workspace.as_ref().map(|ws| ws.path.clone()),
                max_turns: record.options.max_turns,
                permission_mode: record.options.permission_mode.clone(),
                model: self.config.agent_model.clone(),
                api_key: request.credentials.agent_key.clone(),
            })
            .await
            .context("invoking agent")?;

        self.account_usage(session_id, &outcome);

        stream
            .emit(SseEvent::ClaudeDelta {
                text: outcome.text.clone(),
                timestamp: now(),
            })
            .await;
        stream
            .emit(SseEvent::ClaudeMessage {
                role: MessageRole::Assistant.to_string(),
                content: outcome.text.clone(),
                timestamp: now(),
            })
            .await;
        stream
            .emit(SseEvent::ClaudeEnd {
                turn,
                timestamp: now(),
            })
            .await;

        if outcome.hit_internal_turn_cap {
            stream
                .emit(SseEvent::status(
                    "Agent stopped at its internal turn limit; the response may be partial",
                ))
                .await;
        }

        let status = if self.classifier.needs_input(&outcome.text) {
            stream
                .emit(SseEvent::InputRequest {
                    prompt: outcome.text.clone(),
                    timestamp: now(),
                })
                .await;
            SessionStatus::WaitingInput
        } else {
            SessionStatus::Completed
        };

        if let Some(ws) = workspace.as_deref_mut() {
            self.persist_changes(stream, record, request, ws).await?;
        }

        self.ledger
            .update(
                session_id,
                SessionUpdate {
                    status: Some(status),
                    current_turn: Some(turn),
                    push_messages: vec![ChatMessage::new(MessageRole::Assistant, &outcome.text)],
                },
            )
            .await?;

        info!("session {}: turn {} finished ({})", session_id, turn, status);
        Ok(turn)
    }

    fn account_usage(&self, session_id: &str, outcome: &AgentOutcome) {
        let tokens = if outcome.usage.total() > 0 {
            outcome.usage.total()
        } else {
            pricing::FALLBACK_TOKENS_PER_TURN
        };
        let cost = pricing::estimate_turn_cost(
            outcome.cost_usd,
            outcome.model.as_deref(),
            outcome.usage.input_tokens,
            outcome.usage.output_tokens,
        );
        self.quota.record_usage(session_id, tokens, cost, 1);
    }

    /// Dirty-check the workspace and, when the session opted in, persist
    /// the changes as a feature branch plus pull request. Git failures
    /// on the persistence path propagate; the workspace is reset to a
    /// clean tracking state whether or not a PR was requested.
    async fn persist_changes(
        &self,
        stream: &mut TurnStream,
        record: &SessionRecord,
        request: &TurnRequest,
        workspace: &mut WorkspaceState,
    ) -> Result<()> {
        if !self.workspaces.detect_changes(workspace).await {
            return Ok(());
        }

        let session_id = &request.session_id;
        let repository = record
            .repository
            .as_ref()
            .ok_or_else(|| anyhow!("workspace without repository binding"))?;

        if !record.options.create_pr {
            stream
                .emit(SseEvent::FileChange {
                    branch: None,
                    timestamp: now(),
                })
                .await;
            warn!(
                "session {}: workspace dirty but pull requests are disabled, discarding changes",
                session_id
            );
            let base = repository
                .branch
                .clone()
                .unwrap_or_else(|| workspace.base_branch.clone());
            self.workspaces.restore_clean_state(workspace, &base).await;
            return Ok(());
        }

        let branch = feature_branch_name(session_id);
        stream
            .emit(SseEvent::FileChange {
                branch: Some(branch.clone()),
                timestamp: now(),
            })
            .await;

        let commit_message = format!("korvo: {}", preview(&request.message));
        let sha = self
            .workspaces
            .branch_commit_push(workspace, &branch, &commit_message)
            .await?;
        info!("session {}: pushed {} as {}", session_id, sha, branch);

        let token = request
            .credentials
            .repo_token
            .as_deref()
            .ok_or_else(|| anyhow!("pull request requested but no repository token available"))?;

        let base_branch = match &repository.branch {
            Some(branch) => branch.clone(),
            None => {
                self.pr_api
                    .get_repository(repository, token)
                    .await
                    .context("resolving default branch")?
                    .default_branch
            }
        };

        let summary = self.workspaces.read_pr_summary(workspace).await;
        let body = summary.unwrap_or_else(|| {
            format!("Automated changes for the request:\n\n> {}", request.message)
        });

        let pr_url = self
            .pr_api
            .create_pull_request(
                repository,
                token,
                &commit_message,
                &body,
                &branch,
                &base_branch,
            )
            .await
            .context("creating pull request")?;

        stream
            .emit(SseEvent::status_with_pr(
                format!("Opened pull request for {}", branch),
                pr_url,
            ))
            .await;

        self.workspaces
            .restore_clean_state(workspace, &base_branch)
            .await;
        Ok(())
    }
}

/// Truncated prompt preview for `claude_start` frames.
fn preview(message: &str) -> String {
    if message.chars().count() <= PREVIEW_MAX_CHARS {
        message.to_string()
    } else {
        let truncated: String = message.chars().take(PREVIEW_MAX_CHARS).collect();
        format!("{}...", truncated)
    }
}

/// Branch names embed the session id and a timestamp so concurrent
/// sessions against one repository never collide.
fn feature_branch_name(session_id: &str) -> String {
    let short_id: String = session_id.chars().take(8).collect();
    format!("korvo/{}-{}", short_id, Utc::now().format("%Y%m%d%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_short_message_unchanged() {
        assert_eq!(preview("fix the bug"), "fix the bug");
    }

    #[test]
    fn test_preview_truncates_long_messages() {
        let long = "x".repeat(500);
        let p = preview(&long);
        assert_eq!(p.chars().count(), PREVIEW_MAX_CHARS + 3);
        assert!(p.ends_with("..."));
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        let long = "ß".repeat(300);
        let p = preview(&long);
        assert!(p.ends_with("..."));
        assert_eq!(p.chars().count(), PREVIEW_MAX_CHARS + 3);
    }

    #[test]
    fn test_feature_branch_embeds_short_session_id() {
        let branch = feature_branch_name("0d9a41fc-1111-2222-3333-444455556666");
        assert!(branch.starts_with("korvo/0d9a41fc-"));
    }
}
