use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

/// Sender id of the broadcast status channel, never a real requester.
pub const STATUS_BROADCAST: &str = "status@broadcast";

pub const APK_MIME: &str = "application/vnd.android.package-archive";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Acknowledgment handle used for reactions.
    pub message_id: String,
    pub sender: String,
    pub text: String,
    pub from_me: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Text(String),
    Image {
        data: Vec<u8>,
        caption: String,
    },
    Document {
        data: Vec<u8>,
        file_name: String,
        mimetype: String,
    },
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Text(_) => "text",
            OutboundMessage::Image { .. } => "image",
            OutboundMessage::Document { .. } => "document",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("chat session is not connected")]
    Offline,
    #[error("chat bridge rejected the message: {0}")]
    Rejected(String),
    #[error("chat bridge request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Outbound side of the chat connection.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    fn is_live(&self) -> bool;
    async fn send(&self, to: &str, message: OutboundMessage) -> Result<(), TransportError>;
    async fn react(&self, to: &str, message_id: &str, emoji: &str) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Open,
    Close,
    /// Credentials were revoked; the process must stop.
    LoggedOut,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Close => "close",
            SessionState::LoggedOut => "logged_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::LoggedOut)
    }
}

/// Last session state reported by the chat bridge.
pub struct SessionTracker {
    state: watch::Sender<SessionState>,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTracker {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self { state }
    }

    pub fn current(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.current() == SessionState::Open
    }

    /// A logged-out session stays logged out.
    pub fn update(&self, next: SessionState) -> SessionState {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            info!(target: "pkgbot::session", from = state.as_str(), to = next.as_str(), "chat session state");
            *state = next;
            true
        });
        self.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }
}
