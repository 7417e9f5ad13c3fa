//! Protocol capability: the live connection to the remote chat service.
//!
//! A [`ProtocolConnector`] establishes one [`ProtocolSession`] per connection
//! attempt, restoring stored credentials where they exist. Each session
//! delivers its lifecycle and message events in transport order on the
//! channel returned alongside it in [`Connection`].
//!
//! [`bridge`] implements the capability against the baileys HTTP sidecar.

pub mod bridge;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Status code the service uses when the linked device was logged out.
pub const LOGGED_OUT_STATUS: u16 = 401;

/// Status code the service uses when the session was replaced elsewhere.
pub const CONNECTION_REPLACED_STATUS: u16 = 440;

/// Status code the service uses to request a restart after pairing.
pub const RESTART_REQUIRED_STATUS: u16 = 515;

/// Why a protocol session closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseReason {
    /// Status code reported by the service, if any.
    pub status_code: Option<u16>,
    /// Human-readable description.
    pub message: String,
}

impl CloseReason {
    /// Build a closure reason.
    pub fn new(status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status_code,
            message: message.into(),
        }
    }

    /// The device was logged out or deauthorized.
    pub fn logged_out() -> Self {
        Self::new(Some(LOGGED_OUT_STATUS), "logged out")
    }

    /// Whether the stored credentials are no longer valid.
    pub fn is_logged_out(&self) -> bool {
        self.status_code == Some(LOGGED_OUT_STATUS)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (status {code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Text-bearing fields of an inbound payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundContent {
    /// Plain conversation text.
    pub conversation: Option<String>,
    /// Extended (quoted / link preview) text.
    pub extended_text: Option<String>,
}

/// One raw inbound message, normalized from the transport's wire shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundItem {
    /// Routing identifier of the chat.
    pub remote_jid: Option<String>,
    /// Sender inside a group chat.
    pub participant: Option<String>,
    /// Whether this account sent the message.
    pub from_me: bool,
    /// Sender's self-chosen display name.
    pub push_name: Option<String>,
    /// Protocol timestamp in epoch seconds.
    pub timestamp: Option<i64>,
    /// Message content; `None` for stubs and protocol-only messages.
    pub content: Option<InboundContent>,
}

/// Metadata of a chat the account participates in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMetadata {
    /// Chat identifier.
    pub id: String,
    /// Display name (group subject).
    pub subject: Option<String>,
}

/// Event delivered by a live protocol session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// The service issued a QR challenge.
    Qr(String),
    /// Authentication succeeded.
    Open {
        /// Identity of the linked account (e.g. `15550001111:3@s.whatsapp.net`).
        user_id: Option<String>,
    },
    /// The connection closed.
    Closed(CloseReason),
    /// A batch of messages arrived.
    MessagesUpserted(Vec<InboundItem>),
}

/// Errors from the protocol transport.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// HTTP request to the transport failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The transport answered with an error.
    #[error("transport rejected request ({status}): {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Error body or description.
        message: String,
    },

    /// The session is no longer usable.
    #[error("protocol session closed")]
    Closed,
}

/// A freshly established session and its event stream.
pub struct Connection {
    /// Handle used for outbound calls.
    pub session: Arc<dyn ProtocolSession>,
    /// Lifecycle and message events, in transport order.
    pub events: mpsc::Receiver<ProtocolEvent>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// One live connection to the remote service.
#[async_trait]
pub trait ProtocolSession: Send + Sync {
    /// Send a text message to a fully-qualified chat identifier.
    async fn send_message(&self, chat_id: &str, body: &str) -> Result<(), ProtocolError>;

    /// All chats the account participates in, keyed by chat identifier.
    async fn group_fetch_all_participating(
        &self,
    ) -> Result<HashMap<String, ChatMetadata>, ProtocolError>;

    /// Log the linked device out of the service.
    async fn logout(&self) -> Result<(), ProtocolError>;
}

/// Establishes protocol sessions from stored credentials.
#[async_trait]
pub trait ProtocolConnector: Send + Sync {
    /// Open a new session. Credential updates are persisted by the connector.
    async fn connect(&self) -> Result<Connection, ProtocolError>;

    /// Forget stored credentials so the next session starts a QR flow.
    async fn discard_credentials(&self) -> Result<(), ProtocolError> {
        Ok(())
    }
}
