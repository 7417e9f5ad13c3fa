//! Inbound message normalization and write-through persistence.
//!
//! Each raw [`InboundItem`] is turned into a [`Contact`] upsert plus an
//! appended [`Message`], then announced on the [`EventSink`]. Items are
//! processed independently: a failure on one is logged and the rest of the
//! batch continues. A stop token is checked between items, never inside
//! one, so a retired session leaves no half-written item behind.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{jid, GatewayError};
use crate::events::{EventSink, GatewayEvent};
use crate::protocol::{InboundContent, InboundItem, ProtocolSession};
use crate::store::{Contact, Message, Storage};

/// Extracts a text body from inbound content, if this rule applies.
type BodyRule = fn(&InboundContent) -> Option<&str>;

fn conversation_text(content: &InboundContent) -> Option<&str> {
    content.conversation.as_deref()
}

fn extended_text(content: &InboundContent) -> Option<&str> {
    content.extended_text.as_deref()
}

/// Body extraction rules in preference order.
const BODY_RULES: &[BodyRule] = &[conversation_text, extended_text];

/// First populated text field, or an empty body.
pub fn extract_body(content: &InboundContent) -> String {
    BODY_RULES
        .iter()
        .find_map(|rule| rule(content).filter(|text| !text.is_empty()))
        .unwrap_or_default()
        .to_owned()
}

/// Convert a protocol timestamp (epoch seconds) to a point in time.
///
/// Missing or out-of-range values fall back to `now`.
pub fn timestamp_from_epoch(seconds: Option<i64>, now: DateTime<Utc>) -> DateTime<Utc> {
    seconds
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or(now)
}

/// Why an item was not ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Sent by this account; outbound dispatch already recorded it.
    FromMe,
    /// Stub or protocol-only message without content.
    NoContent,
    /// No routing identifier to attach the message to.
    NoChat,
}

/// Per-batch outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Items persisted and announced.
    pub stored: usize,
    /// Items intentionally ignored.
    pub skipped: usize,
    /// Items that failed to persist.
    pub failed: usize,
}

/// Normalizes inbound payloads and writes them through to storage.
#[derive(Clone)]
pub struct MessageIngestPipeline {
    storage: Arc<dyn Storage>,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for MessageIngestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageIngestPipeline").finish_non_exhaustive()
    }
}

impl MessageIngestPipeline {
    /// Create a pipeline writing to `storage` and announcing on `sink`.
    pub fn new(storage: Arc<dyn Storage>, sink: Arc<dyn EventSink>) -> Self {
        Self { storage, sink }
    }

    /// Ingest a batch. `self_id` is the linked account's identity, recorded
    /// as the recipient of inbound messages.
    pub async fn ingest_batch(&self, items: Vec<InboundItem>, self_id: Option<&str>) -> IngestReport {
        self.ingest_until(items, self_id, &CancellationToken::new())
            .await
    }

    /// Like [`ingest_batch`](Self::ingest_batch), but stops before the next
    /// item once `stop` is cancelled.
    pub async fn ingest_until(
        &self,
        items: Vec<InboundItem>,
        self_id: Option<&str>,
        stop: &CancellationToken,
    ) -> IngestReport {
        let mut report = IngestReport::default();
        let total = items.len();

        for (index, item) in items.into_iter().enumerate() {
            if stop.is_cancelled() {
                debug!(remaining = total.saturating_sub(index), "ingest stopped, session retired");
                break;
            }
            match self.ingest_item(item, self_id).await {
                Ok(Ok(message)) => {
                    debug!(chat_id = %message.chat_id, "inbound message stored");
                    report.stored = report.stored.saturating_add(1);
                }
                Ok(Err(reason)) => {
                    debug!(?reason, "inbound item skipped");
                    report.skipped = report.skipped.saturating_add(1);
                }
                Err(e) => {
                    warn!(error = %e, "inbound item failed");
                    report.failed = report.failed.saturating_add(1);
                }
            }
        }

        if report.failed > 0 {
            warn!(
                stored = report.stored,
                skipped = report.skipped,
                failed = report.failed,
                "inbound batch processed with failures"
            );
        } else {
            debug!(
                stored = report.stored,
                skipped = report.skipped,
                "inbound batch processed"
            );
        }
        report
    }

    /// Ingest one item. The inner `Err` is a skip, the outer one a failure.
    async fn ingest_item(
        &self,
        item: InboundItem,
        self_id: Option<&str>,
    ) -> Result<Result<Message, SkipReason>, GatewayError> {
        if item.from_me {
            return Ok(Err(SkipReason::FromMe));
        }
        let Some(content) = item.content.as_ref() else {
            return Ok(Err(SkipReason::NoContent));
        };
        let Some(chat_id) = item.remote_jid.clone().filter(|id| !id.is_empty()) else {
            return Ok(Err(SkipReason::NoChat));
        };

        let body = extract_body(content);
        let is_group = jid::is_group(&chat_id);
        // In groups the push name belongs to the sender, not the chat.
        let name = if is_group { None } else { item.push_name.clone() };

        let contact = Contact {
            number: jid::local_part(&chat_id).to_owned(),
            display_name: name.clone(),
            alias: name,
            is_group,
            chat_id: chat_id.clone(),
        };
        self.storage
            .upsert_contact(&contact)
            .await
            .map_err(|source| GatewayError::IngestItemFailed {
                chat_id: chat_id.clone(),
                source,
            })?;

        let from = item.participant.unwrap_or_else(|| chat_id.clone());
        let message = Message {
            id: None,
            chat_id: chat_id.clone(),
            from,
            to: self_id.unwrap_or_default().to_owned(),
            body,
            timestamp: timestamp_from_epoch(item.timestamp, Utc::now()),
            is_from_me: false,
        };
        let stored = self
            .storage
            .create_message(message)
            .await
            .map_err(|source| GatewayError::IngestItemFailed {
                chat_id: chat_id.clone(),
                source,
            })?;

        self.sink.emit(GatewayEvent::Message {
            chat_id,
            from: stored.from.clone(),
            body: stored.body.clone(),
        });
        Ok(Ok(stored))
    }

    /// Upsert every chat the session participates in as a contact.
    ///
    /// Returns the number of contacts written.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ContactSyncFailed`] if the chat list cannot be
    /// fetched. Per-chat write failures are logged and skipped.
    pub async fn sync_contacts(&self, session: &dyn ProtocolSession) -> Result<usize, GatewayError> {
        self.sync_contacts_until(session, &CancellationToken::new())
            .await
    }

    /// Like [`sync_contacts`](Self::sync_contacts), but stops before the
    /// next chat once `stop` is cancelled.
    ///
    /// # Errors
    ///
    /// Same as [`sync_contacts`](Self::sync_contacts).
    pub async fn sync_contacts_until(
        &self,
        session: &dyn ProtocolSession,
        stop: &CancellationToken,
    ) -> Result<usize, GatewayError> {
        let chats = session
            .group_fetch_all_participating()
            .await
            .map_err(GatewayError::ContactSyncFailed)?;
        let total = chats.len();
        let mut synced: usize = 0;

        for (chat_id, meta) in chats {
            if stop.is_cancelled() {
                debug!(synced, total, "contact sync stopped, session retired");
                return Ok(synced);
            }
            let contact = Contact {
                number: jid::local_part(&chat_id).to_owned(),
                display_name: meta.subject.clone(),
                alias: meta.subject,
                is_group: jid::is_group(&chat_id),
                chat_id,
            };
            match self.storage.upsert_contact(&contact).await {
                Ok(()) => synced = synced.saturating_add(1),
                Err(e) => warn!(chat_id = %contact.chat_id, error = %e, "contact sync failed for chat"),
            }
        }

        info!(synced, total, "contact sync complete");
        Ok(synced)
    }
}
