//! SQLite-backed [`Storage`] implementation.
//!
//! Schema is applied inline via `include_str!` when the store is opened.
//! Timestamps are stored as RFC 3339 text.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, trace};

use super::{Contact, Message, Session, SessionUpdate, StoreError, Storage};

/// Row type returned by SQLite queries for contacts.
type ContactRow = (String, Option<String>, Option<String>, String, bool);

/// Row type returned by SQLite queries for messages.
type MessageRow = (i64, String, String, String, String, String, bool);

/// Gateway database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, the database
    /// cannot be opened, or the schema fails to apply.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!(
                    "failed to create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .pragma("trusted_schema", "OFF");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        debug!(path = %path.display(), "gateway database opened");
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema fails to apply.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let schema = include_str!("../../migrations/001_schema.sql");
        sqlx::raw_sql(schema).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Storage for SqliteStore {
    async fn update_session(&self, update: SessionUpdate) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(Option<String>, bool, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT phone_number, is_connected, qr_code, last_connected_at \
             FROM session WHERE id = 1",
        )
        .fetch_optional(&mut *tx)
        .await?;

        let mut session = match row {
            Some(row) => session_from_row(row)?,
            None => Session::default(),
        };
        update.apply_to(&mut session);

        sqlx::query(
            "INSERT INTO session (id, phone_number, is_connected, qr_code, last_connected_at) \
             VALUES (1, ?1, ?2, ?3, ?4) \
             ON CONFLICT(id) DO UPDATE SET \
               phone_number = excluded.phone_number, \
               is_connected = excluded.is_connected, \
               qr_code = excluded.qr_code, \
               last_connected_at = excluded.last_connected_at, \
               updated_at = datetime('now')",
        )
        .bind(&session.phone_number)
        .bind(session.is_connected)
        .bind(&session.qr_code)
        .bind(session.last_connected_at.map(|at| at.to_rfc3339()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        trace!(connected = session.is_connected, "session updated");
        Ok(())
    }

    async fn get_session(&self) -> Result<Option<Session>, StoreError> {
        let row: Option<(Option<String>, bool, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT phone_number, is_connected, qr_code, last_connected_at \
             FROM session WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(session_from_row).transpose()
    }

    async fn upsert_contact(&self, contact: &Contact) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO contacts (chat_id, display_name, alias, number, is_group) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(chat_id) DO UPDATE SET \
               display_name = COALESCE(excluded.display_name, contacts.display_name), \
               alias = COALESCE(excluded.alias, contacts.alias), \
               number = excluded.number, \
               is_group = excluded.is_group, \
               updated_at = datetime('now')",
        )
        .bind(&contact.chat_id)
        .bind(&contact.display_name)
        .bind(&contact.alias)
        .bind(&contact.number)
        .bind(contact.is_group)
        .execute(&self.pool)
        .await?;
        trace!(chat_id = %contact.chat_id, "contact upserted");
        Ok(())
    }

    async fn get_contact(&self, chat_id: &str) -> Result<Option<Contact>, StoreError> {
        let row: Option<ContactRow> = sqlx::query_as(
            "SELECT chat_id, display_name, alias, number, is_group \
             FROM contacts WHERE chat_id = ?1",
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(
            |(chat_id, display_name, alias, number, is_group)| Contact {
                chat_id,
                display_name,
                alias,
                number,
                is_group,
            },
        ))
    }

    async fn create_message(&self, mut message: Message) -> Result<Message, StoreError> {
        let result = sqlx::query(
            "INSERT INTO messages (chat_id, sender, recipient, body, timestamp, is_from_me) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&message.chat_id)
        .bind(&message.from)
        .bind(&message.to)
        .bind(&message.body)
        .bind(message.timestamp.to_rfc3339())
        .bind(message.is_from_me)
        .execute(&self.pool)
        .await?;
        let id = result.last_insert_rowid();
        trace!(message_id = id, chat_id = %message.chat_id, "message stored");
        message.id = Some(id);
        Ok(message)
    }

    async fn list_messages(
        &self,
        chat_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, chat_id, sender, recipient, body, timestamp, is_from_me FROM ( \
               SELECT * FROM messages WHERE chat_id = ?1 ORDER BY id DESC LIMIT ?2 \
             ) ORDER BY id ASC",
        )
        .bind(chat_id)
        .bind(limit_i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, chat_id, from, to, body, timestamp, is_from_me)| {
                Ok(Message {
                    id: Some(id),
                    chat_id,
                    from,
                    to,
                    body,
                    timestamp: parse_timestamp("timestamp", &timestamp)?,
                    is_from_me,
                })
            })
            .collect()
    }
}

fn session_from_row(
    (phone_number, is_connected, qr_code, last_connected_at): (
        Option<String>,
        bool,
        Option<String>,
        Option<String>,
    ),
) -> Result<Session, StoreError> {
    let last_connected_at = last_connected_at
        .as_deref()
        .map(|raw| parse_timestamp("last_connected_at", raw))
        .transpose()?;
    Ok(Session {
        phone_number,
        is_connected,
        qr_code,
        last_connected_at,
    })
}

fn parse_timestamp(field: &'static str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidRow {
            field,
            value: raw.to_owned(),
        })
}
