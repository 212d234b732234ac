//! One client connection's view of a running search.
//!
//! The orchestrator holds a [`StreamingSession`] and pushes messages into it;
//! the HTTP layer turns the matching [`SessionReceiver`] into an SSE stream.
//! Dropping the receiver (client disconnect) cancels the session.

use axum::response::sse::Event;
use futures::Stream;
use serde::Serialize;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::Lead;

/// Messages delivered to the client, in order.
///
/// Progress messages carry the full accumulated snapshot, not a delta.
/// Exactly one terminal message (`complete` or `error`) ends the stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SessionMessage {
    Progress { leads: Vec<Lead>, total: usize },
    Complete { leads: Vec<Lead>, total: usize },
    Error { message: String },
}

impl SessionMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            SessionMessage::Progress { .. } => "progress",
            SessionMessage::Complete { .. } => "complete",
            SessionMessage::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionMessage::Progress { .. })
    }

    pub fn to_event(&self) -> Event {
        let data = serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!("Failed to serialize session message: {}", e);
            r#"{"type":"error","message":"internal error"}"#.to_string()
        });
        Event::default().event(self.event_name()).data(data)
    }
}

/// Sending half, owned by the orchestrator.
///
/// The terminal methods consume the session so no message can follow them.
pub struct StreamingSession {
    tx: mpsc::Sender<SessionMessage>,
    cancel: CancellationToken,
}

/// Receiving half, owned by the transport.
pub struct SessionReceiver {
    rx: mpsc::Receiver<SessionMessage>,
    cancel: CancellationToken,
}

impl StreamingSession {
    pub fn channel(buffer: usize) -> (StreamingSession, SessionReceiver) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let cancel = CancellationToken::new();
        (
            StreamingSession {
                tx,
                cancel: cancel.clone(),
            },
            SessionReceiver { rx, cancel },
        )
    }

    /// True once the client went away or the session was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn progress(&self, leads: &[Lead]) {
        self.send(SessionMessage::Progress {
            leads: leads.to_vec(),
            total: leads.len(),
        })
        .await;
    }

    pub async fn complete(self, leads: Vec<Lead>) {
        let total = leads.len();
        self.send(SessionMessage::Complete { leads, total }).await;
    }

    pub async fn fail(self, message: impl Into<String>) {
        self.send(SessionMessage::Error {
            message: message.into(),
        })
        .await;
    }

    async fn send(&self, message: SessionMessage) {
        if self.tx.send(message).await.is_err() {
            tracing::debug!("Session receiver dropped, message discarded");
        }
    }
}

impl SessionReceiver {
    pub async fn recv(&mut self) -> Option<SessionMessage> {
        self.rx.recv().await
    }

    /// Cancels the session without dropping the receiver.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drains the channel as SSE events, ending after the terminal message.
    /// Dropping the stream cancels the session.
    pub fn into_stream(self) -> impl Stream<Item = Result<Event, Infallible>> {
        let SessionReceiver { mut rx, cancel } = self;
        async_stream::stream! {
            let _guard = cancel.drop_guard();
            while let Some(message) = rx.recv().await {
                let terminal = message.is_terminal();
                yield Ok(message.to_event());
                if terminal {
                    break;
                }
            }
        }
    }
}
