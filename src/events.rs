//! Downstream notifications: connection state, QR challenges, and messages.
//!
//! The gateway publishes through the [`EventSink`] trait. Emission is
//! fire-and-forget; a sink must never block the caller.

use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::trace;

/// Default buffer size for [`BroadcastSink`].
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// An event published to downstream observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "lowercase")]
pub enum GatewayEvent {
    /// A QR challenge must be shown to a human.
    Qr {
        /// Pairing code payload.
        qr: String,
    },
    /// The session is authenticated and open.
    Ready,
    /// The session closed.
    Disconnected {
        /// Human-readable closure reason.
        reason: String,
    },
    /// An inbound message was stored.
    Message {
        /// Chat the message belongs to.
        #[serde(rename = "chatId")]
        chat_id: String,
        /// Sender identifier.
        from: String,
        /// Text body.
        body: String,
    },
}

impl GatewayEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Qr { .. } => "qr",
            Self::Ready => "ready",
            Self::Disconnected { .. } => "disconnected",
            Self::Message { .. } => "message",
        }
    }

    /// JSON payload of the event.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            Self::Qr { qr } => json!({ "qr": qr }),
            Self::Ready => json!({}),
            Self::Disconnected { reason } => json!({ "reason": reason }),
            Self::Message {
                chat_id,
                from,
                body,
            } => json!({ "chatId": chat_id, "from": from, "body": body }),
        }
    }
}

/// Publish-only channel to downstream observers.
pub trait EventSink: Send + Sync {
    /// Publish an event. Must not block and must not fail the caller.
    fn emit(&self, event: GatewayEvent);
}

/// Fan-out sink backed by a [`broadcast`] channel.
///
/// Subscribers that fall behind lose the oldest events. Emitting with no
/// subscribers is not an error.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<GatewayEvent>,
}

impl BroadcastSink {
    /// Create a sink buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Register a new subscriber. It only sees events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: GatewayEvent) {
        let name = event.name();
        // Err only means nobody is listening.
        let delivered = self.tx.send(event).unwrap_or(0);
        trace!(event = name, delivered, "gateway event emitted");
    }
}
