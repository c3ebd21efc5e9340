//! Session ledger service.
//!
//! Owns the durable session records. All mutation for a given id goes
//! through a per-id async lock, so writes are serialized per session
//! (single-writer) while different sessions proceed concurrently.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::sync::Mutex;

use super::models::{ChatMessage, RepositoryBinding, SessionOptions, SessionRecord, SessionStatus};
use super::repository::SessionRepository;

/// Default idle timeout before a session is reapable.
pub const DEFAULT_IDLE_TIMEOUT_MINUTES: i64 = 30;

/// Mutable fields accepted by [`SessionLedger::update`].
#[derive(Debug, Default)]
pub struct SessionUpdate {
    pub status: Option<SessionStatus>,
    /// New turn counter; ignored when lower than the stored value.
    pub current_turn: Option<i64>,
    /// Transcript entries appended in order.
    pub push_messages: Vec<ChatMessage>,
}

/// Durable per-session record store.
pub struct SessionLedger {
    repo: SessionRepository,
    /// Per-id write locks enforcing single-writer semantics.
    locks: DashMap<String, Arc<Mutex<()>>>,
    idle_timeout_minutes: i64,
}

impl SessionLedger {
    pub fn new(repo: SessionRepository) -> Self {
        Self {
            repo,
            locks: DashMap::new(),
            idle_timeout_minutes: DEFAULT_IDLE_TIMEOUT_MINUTES,
        }
    }

    pub fn with_idle_timeout(mut self, minutes: i64) -> Self {
        self.idle_timeout_minutes = minutes;
        self
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Create a session record. Idempotent: re-creating an existing id
    /// refreshes its status and activity timestamp instead of erroring,
    /// which keeps retried start requests safe.
    pub async fn create(
        &self,
        id: &str,
        repository: Option<RepositoryBinding>,
        options: SessionOptions,
    ) -> Result<SessionRecord> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.repo.get(id).await? {
            debug!("session {}: create refreshed existing record", id);
            let mut refreshed = existing;
            refreshed.last_activity_at = Utc::now().to_rfc3339();
            self.repo.upsert(&refreshed).await?;
            return Ok(refreshed);
        }

        let record = SessionRecord::new(id, repository, options);
        self.repo.upsert(&record).await?;
        Ok(record)
    }

    /// Restore a record from a caller-supplied snapshot (continuation
    /// path where the local ledger may not know the session).
    pub async fn restore(&self, snapshot: &SessionRecord) -> Result<()> {
        let lock = self.lock_for(&snapshot.id);
        let _guard = lock.lock().await;
        self.repo.upsert(snapshot).await?;
        // The insert path leaves turn/transcript untouched on conflict;
        // write them through the monotonic update so the snapshot wins.
        self.repo.update(snapshot).await
    }

    /// Snapshot of a session record.
    pub async fn get(&self, id: &str) -> Result<Option<SessionRecord>> {
        self.repo.get(id).await
    }

    /// Apply an update under the per-id lock.
    ///
    /// The turn counter never regresses, last_activity_at is always
    /// refreshed, and updates to ended sessions are ignored with a debug
    /// log rather than rejected.
    pub async fn update(&self, id: &str, update: SessionUpdate) -> Result<Option<SessionRecord>> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let Some(mut record) = self.repo.get(id).await? else {
            return Ok(None);
        };

        if record.status == SessionStatus::Ended {
            debug!("session {}: update ignored, session already ended", id);
            return Ok(Some(record));
        }

        if let Some(status) = update.status {
            record.status = status;
        }
        if let Some(turn) = update.current_turn {
            if turn < record.current_turn {
                warn!(
                    "session {}: refusing turn regression {} -> {}",
                    id, record.current_turn, turn
                );
            } else {
                record.current_turn = turn;
            }
        }
        record.messages.extend(update.push_messages);
        record.last_activity_at = Utc::now().to_rfc3339();

        self.repo.update(&record).await?;
        Ok(Some(record))
    }

    /// Mark a session ended. Idempotent: unknown ids and already-ended
    /// sessions both return cleanly.
    pub async fn end(&self, id: &str) -> Result<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        match self.repo.get(id).await? {
            None => {
                debug!("session {}: end on unknown id, nothing to do", id);
                Ok(())
            }
            Some(record) if record.status == SessionStatus::Ended => {
                debug!("session {}: already ended", id);
                Ok(())
            }
            Some(_) => {
                let now = Utc::now().to_rfc3339();
                self.repo.end(id, SessionStatus::Ended, &now).await
            }
        }
    }

    /// Reap sessions idle past the configured timeout. Returns the ids
    /// that were ended so callers can release associated resources.
    pub async fn sweep_idle(&self) -> Result<Vec<String>> {
        let cutoff = (Utc::now() - Duration::minutes(self.idle_timeout_minutes)).to_rfc3339();
        let idle = self.repo.list_idle_before(&cutoff).await?;

        let mut reaped = Vec::new();
        for id in idle {
            self.end(&id).await?;
            self.locks.remove(&id);
            reaped.push(id);
        }

        if !reaped.is_empty() {
            info!("idle sweep ended {} session(s)", reaped.len());
        }
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::ledger::models::MessageRole;

    async fn test_ledger() -> SessionLedger {
        let db = Database::in_memory().await.unwrap();
        SessionLedger::new(SessionRepository::new(db.pool().clone()))
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let ledger = test_ledger().await;
        let first = ledger
            .create("s1", None, SessionOptions::default())
            .await
            .unwrap();
        let second = ledger
            .create("s1", None, SessionOptions::default())
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test]
    async fn test_turn_counter_never_regresses() {
        let ledger = test_ledger().await;
        ledger.create("s2", None, SessionOptions::default()).await.unwrap();

        let record = ledger
            .update(
                "s2",
                SessionUpdate {
                    current_turn: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.current_turn, 3);

        let record = ledger
            .update(
                "s2",
                SessionUpdate {
                    current_turn: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.current_turn, 3);
    }

    #[tokio::test]
    async fn test_updates_after_end_are_ignored() {
        let ledger = test_ledger().await;
        ledger.create("s3", None, SessionOptions::default()).await.unwrap();
        ledger.end("s3").await.unwrap();

        let record = ledger
            .update(
                "s3",
                SessionUpdate {
                    status: Some(SessionStatus::Processing),
                    current_turn: Some(5),
                    push_messages: vec![ChatMessage::new(MessageRole::User, "late")],
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(record.status, SessionStatus::Ended);
        assert_eq!(record.current_turn, 0);
        assert!(record.messages.is_empty());
    }

    #[tokio::test]
    async fn test_end_is_idempotent() {
        let ledger = test_ledger().await;
        // Unknown id succeeds.
        ledger.end("missing").await.unwrap();

        ledger.create("s4", None, SessionOptions::default()).await.unwrap();
        ledger.end("s4").await.unwrap();
        ledger.end("s4").await.unwrap();

        let record = ledger.get("s4").await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Ended);
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_messages_preserve_order() {
        let ledger = test_ledger().await;
        ledger.create("s5", None, SessionOptions::default()).await.unwrap();

        ledger
            .update(
                "s5",
                SessionUpdate {
                    push_messages: vec![
                        ChatMessage::new(MessageRole::User, "a"),
                        ChatMessage::new(MessageRole::Assistant, "b"),
                    ],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        ledger
            .update(
                "s5",
                SessionUpdate {
                    push_messages: vec![ChatMessage::new(MessageRole::User, "c")],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let record = ledger.get("s5").await.unwrap().unwrap();
        let contents: Vec<&str> = record.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_sweep_reaps_only_idle_sessions() {
        let db = Database::in_memory().await.unwrap();
        let ledger =
            SessionLedger::new(SessionRepository::new(db.pool().clone())).with_idle_timeout(30);

        let mut stale = SessionRecord::new("stale", None, SessionOptions::default());
        stale.last_activity_at = (Utc::now() - Duration::hours(2)).to_rfc3339();
        ledger.restore(&stale).await.unwrap();

        ledger.create("fresh", None, SessionOptions::default()).await.unwrap();

        let reaped = ledger.sweep_idle().await.unwrap();
        assert_eq!(reaped, vec!["stale".to_string()]);
        assert_eq!(
            ledger.get("fresh").await.unwrap().unwrap().status,
            SessionStatus::Starting
        );
    }
}
