//! The gateway core: connection lifecycle, reconnection, inbound ingest, and
//! outbound dispatch.
//!
//! [`Gateway`] wires the components together and exposes the user-facing
//! operations. Storage, the event sink, and the protocol connector are
//! injected at construction.

pub mod ingest;
pub mod jid;
pub mod manager;
pub mod outbound;
pub mod reconnect;

use std::sync::Arc;

use crate::events::EventSink;
use crate::protocol::{ProtocolConnector, ProtocolError, ProtocolSession};
use crate::store::{Message, StoreError, Storage};

use self::ingest::MessageIngestPipeline;
use self::manager::{ConnectionManager, ConnectionState};
use self::outbound::OutboundDispatcher;
use self::reconnect::ReconnectPolicy;

/// Errors from gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The transport could not establish a session.
    #[error("failed to establish protocol session: {0}")]
    SessionEstablishmentFailed(#[source] ProtocolError),

    /// No open session is available for sending.
    #[error("not connected")]
    NotConnected,

    /// The transport rejected an outbound message.
    #[error("failed to send message to {chat_id}: {source}")]
    SendFailed {
        /// Normalized destination.
        chat_id: String,
        /// Underlying transport error.
        #[source]
        source: ProtocolError,
    },

    /// An inbound item could not be persisted.
    #[error("failed to ingest message for {chat_id}: {source}")]
    IngestItemFailed {
        /// Chat the item belonged to.
        chat_id: String,
        /// Underlying storage error.
        #[source]
        source: StoreError,
    },

    /// The participating-chat list could not be fetched.
    #[error("contact sync failed: {0}")]
    ContactSyncFailed(#[source] ProtocolError),

    /// A storage write failed.
    #[error("persistence failed: {0}")]
    PersistenceFailed(#[from] StoreError),
}

/// Assembled gateway: lifecycle manager plus outbound dispatcher.
#[derive(Debug, Clone)]
pub struct Gateway {
    manager: ConnectionManager,
    dispatcher: OutboundDispatcher,
}

impl Gateway {
    /// Wire the gateway from its collaborators.
    pub fn new(
        connector: Arc<dyn ProtocolConnector>,
        storage: Arc<dyn Storage>,
        sink: Arc<dyn EventSink>,
        policy: ReconnectPolicy,
    ) -> Self {
        let ingest = MessageIngestPipeline::new(Arc::clone(&storage), Arc::clone(&sink));
        let manager = ConnectionManager::new(connector, Arc::clone(&storage), sink, ingest, policy);
        let dispatcher = OutboundDispatcher::new(manager.clone(), storage);
        Self {
            manager,
            dispatcher,
        }
    }

    /// Start the connection lifecycle. A no-op when already running.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::SessionEstablishmentFailed`] if the first
    /// session cannot be established.
    pub async fn initialize(&self) -> Result<(), GatewayError> {
        self.manager.initialize().await
    }

    /// Send a text message and return the stored record.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotConnected`] or [`GatewayError::SendFailed`].
    pub async fn send_message(&self, to: &str, body: &str) -> Result<Message, GatewayError> {
        self.dispatcher.send(to, body).await
    }

    /// Log out and stop the lifecycle, cancelling any pending reconnect.
    pub async fn disconnect(&self) {
        self.manager.disconnect().await;
    }

    /// Current protocol session, pending or open.
    pub async fn connection_handle(&self) -> Option<Arc<dyn ProtocolSession>> {
        self.manager.connection_handle().await
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ConnectionState {
        self.manager.state().await
    }

    /// The lifecycle manager.
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }
}
