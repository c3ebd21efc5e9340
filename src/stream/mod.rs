//! SSE protocol adapter for per-session turn streaming.
//!
//! Each dispatched turn owns exactly one [`TurnStream`] (single producer)
//! feeding exactly one client connection (single consumer). The stream
//! contract: `connected` is always the first frame, exactly one terminal
//! frame (`complete` or `error`) is emitted, followed by `end`, after which
//! nothing else is sent and the channel closes.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use chrono::Utc;
use futures::Stream;
use log::debug;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

/// Size of the per-session event buffer.
const STREAM_BUFFER_SIZE: usize = 64;

/// Grace period before the terminal `end` frame so buffered frames flush.
const END_GRACE: Duration = Duration::from_millis(100);

/// SSE keep-alive interval for long idle turns.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Events pushed to the client over a session's SSE connection.
///
/// Consumers must treat unknown event types as forward-compatible no-ops.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SseEvent {
    /// Stream established. Always the first frame.
    Connected {
        session_id: String,
        timestamp: String,
    },

    /// Informational progress notice (clone attempts, PR URLs, turn caps).
    Status {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pr_url: Option<String>,
        timestamp: String,
    },

    /// A turn started; carries a truncated prompt preview.
    ClaudeStart {
        preview: String,
        turn: i64,
        timestamp: String,
    },

    /// Extracted assistant text for the current turn.
    ClaudeDelta { text: String, timestamp: String },

    /// The agent finished producing output for this turn.
    ClaudeEnd { turn: i64, timestamp: String },

    /// Full transcript entry as appended to the session history.
    ClaudeMessage {
        role: String,
        content: String,
        timestamp: String,
    },

    /// The classifier judged the agent to be waiting on the user.
    InputRequest { prompt: String, timestamp: String },

    /// The workspace tree diverged from its clean tracking state.
    FileChange {
        #[serde(skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
        timestamp: String,
    },

    /// Terminal: the turn finished successfully.
    Complete { turns: i64, timestamp: String },

    /// Terminal: the turn failed.
    Error { message: String, timestamp: String },

    /// Stream close marker. Nothing follows.
    End { timestamp: String },
}

impl SseEvent {
    /// Wire-level `event:` field value.
    pub fn event_type(&self) -> &'static str {
        match self {
            SseEvent::Connected { .. } => "connected",
            SseEvent::Status { .. } => "status",
            SseEvent::ClaudeStart { .. } => "claude_start",
            SseEvent::ClaudeDelta { .. } => "claude_delta",
            SseEvent::ClaudeEnd { .. } => "claude_end",
            SseEvent::ClaudeMessage { .. } => "claude_message",
            SseEvent::InputRequest { .. } => "input_request",
            SseEvent::FileChange { .. } => "file_change",
            SseEvent::Complete { .. } => "complete",
            SseEvent::Error { .. } => "error",
            SseEvent::End { .. } => "end",
        }
    }

    /// True for `complete` and `error` frames.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SseEvent::Complete { .. } | SseEvent::Error { .. })
    }

    pub fn status(message: impl Into<String>) -> Self {
        SseEvent::Status {
            message: message.into(),
            pr_url: None,
            timestamp: now(),
        }
    }

    pub fn status_with_pr(message: impl Into<String>, pr_url: impl Into<String>) -> Self {
        SseEvent::Status {
            message: message.into(),
            pr_url: Some(pr_url.into()),
            timestamp: now(),
        }
    }
}

/// Current timestamp in the wire format used by all frames.
pub fn now() -> String {
    Utc::now().to_rfc3339()
}

/// Single-producer emitter for one turn's SSE stream.
///
/// Enforces the ordering contract: emission after the terminal frame is
/// dropped, and client disconnects (receiver dropped) silently stop
/// further emission rather than failing the turn.
pub struct TurnStream {
    session_id: String,
    tx: mpsc::Sender<SseEvent>,
    terminal_sent: bool,
}

impl TurnStream {
    /// Create a stream pair: the producer half and the receiver to hand
    /// to the SSE response adapter.
    pub fn channel(session_id: impl Into<String>) -> (Self, mpsc::Receiver<SseEvent>) {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER_SIZE);
        (
            Self {
                session_id: session_id.into(),
                tx,
                terminal_sent: false,
            },
            rx,
        )
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Liveness flag: false once the client has disconnected.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Emit the mandatory first frame.
    pub async fn connected(&mut self) {
        let event = SseEvent::Connected {
            session_id: self.session_id.clone(),
            timestamp: now(),
        };
        self.emit(event).await;
    }

    /// Emit a non-terminal frame. Dropped if the terminal frame was
    /// already sent or the client is gone.
    pub async fn emit(&mut self, event: SseEvent) {
        if self.terminal_sent {
            debug!(
                "session {}: dropping {} frame after terminal",
                self.session_id,
                event.event_type()
            );
            return;
        }
        if event.is_terminal() {
            self.terminal_sent = true;
        }
        if self.tx.send(event).await.is_err() {
            debug!("session {}: client disconnected, frame dropped", self.session_id);
        }
    }

    /// Emit the terminal `complete` frame.
    pub async fn complete(&mut self, turns: i64) {
        self.emit(SseEvent::Complete {
            turns,
            timestamp: now(),
        })
        .await;
    }

    /// Emit the terminal `error` frame.
    pub async fn fail(&mut self, message: impl Into<String>) {
        self.emit(SseEvent::Error {
            message: message.into(),
            timestamp: now(),
        })
        .await;
    }

    /// Flush grace period, then the `end` frame, then close the channel.
    ///
    /// Consumes the stream: nothing can be emitted afterwards.
    pub async fn finish(self) {
        tokio::time::sleep(END_GRACE).await;
        let _ = self.tx.send(SseEvent::End { timestamp: now() }).await;
    }
}

/// Adapt a turn's event receiver into an axum SSE response.
pub fn sse_response(
    rx: mpsc::Receiver<SseEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
    let stream = ReceiverStream::new(rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(Event::default().event(event.event_type()).data(data))
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEPALIVE_INTERVAL).text(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connected_is_first_frame() {
        let (mut stream, mut rx) = TurnStream::channel("sess-1");
        stream.connected().await;
        stream.emit(SseEvent::status("working")).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_type(), "connected");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.event_type(), "status");
    }

    #[tokio::test]
    async fn test_nothing_emitted_after_terminal() {
        let (mut stream, mut rx) = TurnStream::channel("sess-2");
        stream.connected().await;
        stream.complete(1).await;
        stream.emit(SseEvent::status("late")).await;
        stream.finish().await;

        let mut types = Vec::new();
        while let Some(event) = rx.recv().await {
            types.push(event.event_type());
        }
        assert_eq!(types, vec!["connected", "complete", "end"]);
    }

    #[tokio::test]
    async fn test_exactly_one_terminal() {
        let (mut stream, mut rx) = TurnStream::channel("sess-3");
        stream.connected().await;
        stream.fail("boom").await;
        stream.complete(1).await;
        stream.finish().await;

        let mut terminals = 0;
        while let Some(event) = rx.recv().await {
            if event.is_terminal() {
                terminals += 1;
            }
        }
        assert_eq!(terminals, 1);
    }

    #[tokio::test]
    async fn test_disconnect_detected() {
        let (mut stream, rx) = TurnStream::channel("sess-4");
        assert!(stream.is_connected());
        drop(rx);
        assert!(!stream.is_connected());
        // Emission after disconnect must not panic or error the turn.
        stream.emit(SseEvent::status("into the void")).await;
    }

    #[test]
    fn test_event_type_names_match_wire_vocabulary() {
        assert_eq!(
            SseEvent::ClaudeStart {
                preview: String::new(),
                turn: 1,
                timestamp: now()
            }
            .event_type(),
            "claude_start"
        );
        assert_eq!(
            SseEvent::InputRequest {
                prompt: String::new(),
                timestamp: now()
            }
            .event_type(),
            "input_request"
        );
        assert_eq!(
            SseEvent::FileChange {
                branch: None,
                timestamp: now()
            }
            .event_type(),
            "file_change"
        );
    }

    #[test]
    fn test_serialized_frame_carries_type_tag() {
        let event = SseEvent::status("cloning repository");
        let value: serde_json::Value = serde_json::from_str(
            &serde_json::to_string(&event).unwrap(),
        )
        .unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["message"], "cloning repository");
    }
}
