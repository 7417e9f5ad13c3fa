//! Outbound message dispatch with write-through persistence.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::manager::ConnectionManager;
use super::{jid, GatewayError};
use crate::store::{Contact, Message, Storage};

/// Sends user-originated messages over the open session.
#[derive(Clone)]
pub struct OutboundDispatcher {
    manager: ConnectionManager,
    storage: Arc<dyn Storage>,
}

impl std::fmt::Debug for OutboundDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundDispatcher")
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

impl OutboundDispatcher {
    /// Create a dispatcher reading connectivity from `manager`.
    pub fn new(manager: ConnectionManager, storage: Arc<dyn Storage>) -> Self {
        Self { manager, storage }
    }

    /// Send `body` to `to` and record the message.
    ///
    /// `to` may be a bare number or a fully-qualified chat identifier.
    /// Storage failures after a successful send are logged and the
    /// unpersisted message is returned; the remote send cannot be undone.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::NotConnected`] when no session is open. Nothing is
    ///   sent or written.
    /// - [`GatewayError::SendFailed`] when the transport rejects the send.
    pub async fn send(&self, to: &str, body: &str) -> Result<Message, GatewayError> {
        let open = self
            .manager
            .open_session()
            .await
            .ok_or(GatewayError::NotConnected)?;

        let chat_id = jid::normalize(to);
        open.session
            .send_message(&chat_id, body)
            .await
            .map_err(|source| GatewayError::SendFailed {
                chat_id: chat_id.clone(),
                source,
            })?;
        info!(chat_id = %chat_id, "message sent");

        self.ensure_contact(&chat_id).await;

        let message = Message {
            id: None,
            chat_id: chat_id.clone(),
            from: open.self_id.unwrap_or_default(),
            to: chat_id,
            body: body.to_owned(),
            timestamp: Utc::now(),
            is_from_me: true,
        };
        match self.storage.create_message(message.clone()).await {
            Ok(stored) => Ok(stored),
            Err(e) => {
                error!(chat_id = %message.chat_id, error = %e, "sent message could not be stored");
                Ok(message)
            }
        }
    }

    /// Record a contact for destinations seen for the first time.
    async fn ensure_contact(&self, chat_id: &str) {
        match self.storage.get_contact(chat_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                let contact = Contact {
                    chat_id: chat_id.to_owned(),
                    display_name: None,
                    alias: None,
                    number: jid::local_part(chat_id).to_owned(),
                    is_group: jid::is_group(chat_id),
                };
                match self.storage.upsert_contact(&contact).await {
                    Ok(()) => debug!(chat_id, "contact created for new destination"),
                    Err(e) => warn!(chat_id, error = %e, "failed to create contact"),
                }
            }
            Err(e) => warn!(chat_id, error = %e, "contact lookup failed"),
        }
    }
}
