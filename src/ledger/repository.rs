//! Session ledger persistence.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use super::models::{RepositoryBinding, SessionOptions, SessionRecord, SessionStatus};

/// Raw row shape; messages and options are stored as JSON text.
#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    id: String,
    status: String,
    repo_url: Option<String>,
    repo_name: Option<String>,
    repo_branch: Option<String>,
    current_turn: i64,
    messages: String,
    options: Option<String>,
    created_at: String,
    last_activity_at: String,
    completed_at: Option<String>,
}

impl SessionRow {
    fn into_record(self) -> Result<SessionRecord> {
        let status: SessionStatus = self
            .status
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
            .context("parsing session status")?;

        let repository = match (self.repo_url, self.repo_name) {
            (Some(url), Some(name)) => Some(RepositoryBinding {
                url,
                name,
                branch: self.repo_branch,
            }),
            _ => None,
        };

        let messages =
            serde_json::from_str(&self.messages).context("parsing session messages")?;
        let options = match self.options {
            Some(raw) => serde_json::from_str(&raw).context("parsing session options")?,
            None => SessionOptions::default(),
        };

        Ok(SessionRecord {
            id: self.id,
            status,
            repository,
            current_turn: self.current_turn,
            messages,
            options,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            completed_at: self.completed_at,
        })
    }
}

const SELECT_COLUMNS: &str = "id, status, repo_url, repo_name, repo_branch, current_turn, \
     messages, options, created_at, last_activity_at, completed_at";

/// Repository for durable session records.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a record, refreshing the existing row on id conflict so
    /// retried create requests do not error.
    pub async fn upsert(&self, record: &SessionRecord) -> Result<()> {
        let messages =
            serde_json::to_string(&record.messages).context("serializing session messages")?;
        let options =
            serde_json::to_string(&record.options).context("serializing session options")?;

        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, status, repo_url, repo_name, repo_branch, current_turn,
                messages, options, created_at, last_activity_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                repo_url = excluded.repo_url,
                repo_name = excluded.repo_name,
                repo_branch = excluded.repo_branch,
                last_activity_at = excluded.last_activity_at
            "#,
        )
        .bind(&record.id)
        .bind(record.status.to_string())
        .bind(record.repository.as_ref().map(|r| r.url.clone()))
        .bind(record.repository.as_ref().map(|r| r.name.clone()))
        .bind(record.repository.as_ref().and_then(|r| r.branch.clone()))
        .bind(record.current_turn)
        .bind(messages)
        .bind(options)
        .bind(&record.created_at)
        .bind(&record.last_activity_at)
        .bind(&record.completed_at)
        .execute(&self.pool)
        .await
        .context("upserting session")?;

        Ok(())
    }

    /// Fetch a session by id.
    pub async fn get(&self, id: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM sessions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching session")?;

        row.map(SessionRow::into_record).transpose()
    }

    /// Write the mutable fields of a record. The turn counter never
    /// regresses: SQLite's MAX keeps the stored value monotonic even if
    /// a stale snapshot is written back.
    pub async fn update(&self, record: &SessionRecord) -> Result<()> {
        let messages =
            serde_json::to_string(&record.messages).context("serializing session messages")?;

        sqlx::query(
            r#"
            UPDATE sessions
            SET status = ?, current_turn = MAX(current_turn, ?), messages = ?,
                last_activity_at = ?
            WHERE id = ?
            "#,
        )
        .bind(record.status.to_string())
        .bind(record.current_turn)
        .bind(messages)
        .bind(&record.last_activity_at)
        .bind(&record.id)
        .execute(&self.pool)
        .await
        .context("updating session")?;

        Ok(())
    }

    /// Set a terminal status and completion timestamp.
    pub async fn end(&self, id: &str, status: SessionStatus, completed_at: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions
            SET status = ?, completed_at = ?, last_activity_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.to_string())
        .bind(completed_at)
        .bind(completed_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("ending session")?;

        Ok(())
    }

    /// Sessions whose last activity predates the cutoff. Keyed on
    /// last_activity_at so mid-turn sessions are never reclaimed.
    pub async fn list_idle_before(&self, cutoff: &str) -> Result<Vec<String>> {
        let ids: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM sessions WHERE last_activity_at < ? AND status != 'ended'",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("listing idle sessions")?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    /// Remove a session row.
    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting session")?;

        Ok(())
    }
}
