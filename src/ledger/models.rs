//! Session ledger data models.

use serde::{Deserialize, Serialize};

/// Session status.
///
/// `starting -> processing -> {waiting_input | completed | error}`, with
/// `ended` set when the client (or the idle sweep) closes the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session record created, worker not yet processing.
    Starting,
    /// A turn is in flight.
    Processing,
    /// The agent appears to be waiting on user input.
    WaitingInput,
    /// Last turn finished cleanly.
    Completed,
    /// Last turn failed.
    Error,
    /// Session closed by the client or reaped.
    Ended,
}

impl SessionStatus {
    /// Terminal states reject further mutation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Error | SessionStatus::Ended)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Starting => write!(f, "starting"),
            SessionStatus::Processing => write!(f, "processing"),
            SessionStatus::WaitingInput => write!(f, "waiting_input"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Error => write!(f, "error"),
            SessionStatus::Ended => write!(f, "ended"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "starting" => Ok(SessionStatus::Starting),
            "processing" => Ok(SessionStatus::Processing),
            "waiting_input" => Ok(SessionStatus::WaitingInput),
            "completed" => Ok(SessionStatus::Completed),
            "error" => Ok(SessionStatus::Error),
            "ended" => Ok(SessionStatus::Ended),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// Role of a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
        }
    }
}

/// One transcript entry. Appended in strict user-then-assistant pairs
/// per turn; insertion order is preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: String,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// The repository a session is bound to, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryBinding {
    /// Clone URL.
    pub url: String,
    /// "owner/name" identifier used for the pull-request API.
    pub name: String,
    /// Base branch; the remote default is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// Per-session options supplied at start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionOptions {
    /// Upper bound on turns for this session.
    pub max_turns: i64,
    /// Permission mode forwarded to the agent CLI.
    pub permission_mode: String,
    /// Commit, push, and open a pull request when a turn changes files.
    pub create_pr: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_turns: 10,
            permission_mode: "default".to_string(),
            create_pr: false,
        }
    }
}

/// Durable per-session record.
///
/// Field names follow the persisted wire layout
/// (`currentTurn`, `createdAt`, `lastActivityAt`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<RepositoryBinding>,
    pub current_turn: i64,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub options: SessionOptions,
    pub created_at: String,
    pub last_activity_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

impl SessionRecord {
    /// Fresh record in the `starting` state.
    pub fn new(
        id: impl Into<String>,
        repository: Option<RepositoryBinding>,
        options: SessionOptions,
    ) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: id.into(),
            status: SessionStatus::Starting,
            repository,
            current_turn: 0,
            messages: Vec::new(),
            options,
            created_at: now.clone(),
            last_activity_at: now,
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            SessionStatus::Starting,
            SessionStatus::Processing,
            SessionStatus::WaitingInput,
            SessionStatus::Completed,
            SessionStatus::Error,
            SessionStatus::Ended,
        ] {
            let parsed: SessionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(SessionStatus::Ended.is_terminal());
        assert!(SessionStatus::Error.is_terminal());
        assert!(!SessionStatus::WaitingInput.is_terminal());
        assert!(!SessionStatus::Completed.is_terminal());
    }

    #[test]
    fn test_record_serde_round_trip_preserves_order_and_turn() {
        let mut record = SessionRecord::new(
            "sess-1",
            Some(RepositoryBinding {
                url: "https://example.com/acme/widgets.git".to_string(),
                name: "acme/widgets".to_string(),
                branch: Some("main".to_string()),
            }),
            SessionOptions::default(),
        );
        record.current_turn = 3;
        record.status = SessionStatus::Completed;
        record.messages.push(ChatMessage::new(MessageRole::User, "first"));
        record
            .messages
            .push(ChatMessage::new(MessageRole::Assistant, "second"));
        record.messages.push(ChatMessage::new(MessageRole::User, "third"));

        let json = serde_json::to_string(&record).unwrap();
        let back: SessionRecord = serde_json::from_str(&json).unwrap();

        assert_eq!(back.status, SessionStatus::Completed);
        assert_eq!(back.current_turn, 3);
        let contents: Vec<&str> = back.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_persisted_layout_uses_camel_case_keys() {
        let record = SessionRecord::new("sess-2", None, SessionOptions::default());
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("currentTurn").is_some());
        assert!(value.get("createdAt").is_some());
        assert!(value.get("lastActivityAt").is_some());
        assert!(value.get("repository").is_none());
    }

    #[test]
    fn test_options_defaults() {
        let options: SessionOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options.max_turns, 10);
        assert_eq!(options.permission_mode, "default");
        assert!(!options.create_pr);
    }
}
