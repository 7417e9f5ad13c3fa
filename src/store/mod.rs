//! Storage collaborator: the singleton session record, contacts, and the
//! append-only message log.
//!
//! The gateway only talks to storage through the [`Storage`] trait so the
//! lifecycle and ingest code can run against fakes in tests. The production
//! implementation is [`sqlite::SqliteStore`].

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// This account's connectivity record. Exactly one exists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Phone number of the linked account, when connected.
    pub phone_number: Option<String>,
    /// Whether a protocol session is currently open.
    pub is_connected: bool,
    /// Pending QR challenge. Always `None` while connected.
    pub qr_code: Option<String>,
    /// When the session last reached the open state.
    pub last_connected_at: Option<DateTime<Utc>>,
}

/// Partial update applied to the [`Session`] record.
///
/// Each `Some` field overwrites the stored value; `None` leaves it alone.
/// The nested options on nullable fields distinguish "clear" from "keep".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionUpdate {
    /// New phone number (`Some(None)` clears it).
    pub phone_number: Option<Option<String>>,
    /// New connected flag.
    pub is_connected: Option<bool>,
    /// New QR challenge (`Some(None)` clears it).
    pub qr_code: Option<Option<String>>,
    /// New last-connected timestamp.
    pub last_connected_at: Option<DateTime<Utc>>,
}

impl SessionUpdate {
    /// A QR challenge was issued: store it and mark the session disconnected.
    pub fn awaiting_qr(qr: impl Into<String>) -> Self {
        Self {
            is_connected: Some(false),
            qr_code: Some(Some(qr.into())),
            ..Self::default()
        }
    }

    /// Authentication succeeded.
    pub fn connected(phone_number: Option<String>, at: DateTime<Utc>) -> Self {
        Self {
            phone_number: Some(phone_number),
            is_connected: Some(true),
            qr_code: Some(None),
            last_connected_at: Some(at),
        }
    }

    /// The session closed or was logged out.
    pub fn disconnected() -> Self {
        Self {
            phone_number: Some(None),
            is_connected: Some(false),
            qr_code: Some(None),
            last_connected_at: None,
        }
    }

    /// Apply this update on top of an existing record.
    pub fn apply_to(&self, session: &mut Session) {
        if let Some(phone) = &self.phone_number {
            session.phone_number.clone_from(phone);
        }
        if let Some(connected) = self.is_connected {
            session.is_connected = connected;
        }
        if let Some(qr) = &self.qr_code {
            session.qr_code.clone_from(qr);
        }
        if let Some(at) = self.last_connected_at {
            session.last_connected_at = Some(at);
        }
    }
}

/// A chat the account participates in, keyed by chat identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Fully-qualified chat identifier (primary key).
    pub chat_id: String,
    /// Display name, if known.
    pub display_name: Option<String>,
    /// Secondary name (push name or group subject), if known.
    pub alias: Option<String>,
    /// Local part of the chat identifier.
    pub number: String,
    /// Whether this is a group chat.
    pub is_group: bool,
}

/// A stored chat message. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Database row id (`None` for messages not yet persisted).
    pub id: Option<i64>,
    /// Chat the message belongs to.
    pub chat_id: String,
    /// Sender identifier.
    pub from: String,
    /// Recipient identifier.
    pub to: String,
    /// Text body (empty when the payload carried no text).
    pub body: String,
    /// When the message was sent.
    pub timestamp: DateTime<Utc>,
    /// Whether this account sent the message.
    pub is_from_me: bool,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be decoded into the domain model.
    #[error("invalid {field} value: {value:?}")]
    InvalidRow {
        /// Which column contained the bad value.
        field: &'static str,
        /// The unexpected value.
        value: String,
    },

    /// The backing store is unavailable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Narrow CRUD surface the gateway persists through.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Merge a partial update into the singleton session record.
    async fn update_session(&self, update: SessionUpdate) -> Result<(), StoreError>;

    /// Load the session record, if one was ever written.
    async fn get_session(&self) -> Result<Option<Session>, StoreError>;

    /// Insert a contact or update the existing one with the same chat id.
    async fn upsert_contact(&self, contact: &Contact) -> Result<(), StoreError>;

    /// Look up a contact by chat id.
    async fn get_contact(&self, chat_id: &str) -> Result<Option<Contact>, StoreError>;

    /// Append a message and return it with its assigned id.
    async fn create_message(&self, message: Message) -> Result<Message, StoreError>;

    /// Messages of a chat in insertion order, at most `limit`.
    async fn list_messages(&self, chat_id: &str, limit: usize)
        -> Result<Vec<Message>, StoreError>;
}
