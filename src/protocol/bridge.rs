//! HTTP client for the baileys sidecar bridge.
//!
//! The sidecar owns the WhatsApp Web socket and its auth state directory
//! (credential updates are persisted there). This module starts a session
//! through `POST /session/start`, long-polls `/events/poll` for lifecycle
//! and message events, and exposes outbound calls as a [`ProtocolSession`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ChatMetadata, CloseReason, Connection, InboundContent, InboundItem, ProtocolConnector,
    ProtocolError, ProtocolEvent, ProtocolSession,
};

/// Default URL the bridge listens on.
pub const DEFAULT_BRIDGE_URL: &str = "http://127.0.0.1:3001";

/// HTTP connect timeout for the reqwest client.
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// HTTP request timeout for normal operations.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Initial event stream reconnect backoff (milliseconds).
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Maximum event stream reconnect backoff (milliseconds).
const MAX_BACKOFF_MS: u64 = 30_000;

/// Poll statuses meaning the sidecar dropped the session.
const SESSION_GONE_STATUSES: [u16; 2] = [404, 410];

/// Default number of consecutive failed polls before the stream closes.
pub const DEFAULT_MAX_STREAM_FAILURES: u32 = 5;

/// Bridge connection settings.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Base URL of the sidecar (no trailing slash).
    pub base_url: String,
    /// Bearer token sent on every request, if the sidecar requires one.
    pub token: Option<String>,
    /// Long-poll timeout for `/events/poll`.
    pub poll_timeout: Duration,
    /// Capacity of the per-session event channel.
    pub event_capacity: usize,
    /// Consecutive failed polls after which the session is reported closed.
    pub max_stream_failures: u32,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BRIDGE_URL.to_owned(),
            token: None,
            poll_timeout: Duration::from_secs(60),
            event_capacity: 256,
            max_stream_failures: DEFAULT_MAX_STREAM_FAILURES,
        }
    }
}

/// Response envelope from the bridge HTTP API.
#[derive(Deserialize)]
struct BridgeResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

/// Shared request plumbing for connector and sessions.
#[derive(Debug, Clone)]
struct BridgeHttp {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl BridgeHttp {
    fn new(settings: &BridgeSettings) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });
        Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_owned(),
            token: settings.token.clone(),
        }
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{path}", self.base_url));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<Option<T>, ProtocolError> {
        let resp = builder.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ProtocolError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        let body: BridgeResponse<T> = resp.json().await?;
        if !body.success {
            return Err(ProtocolError::Rejected {
                status: status.as_u16(),
                message: body
                    .error
                    .unwrap_or_else(|| "bridge reported failure".to_owned()),
            });
        }
        Ok(body.data)
    }
}

/// Establishes sessions through the sidecar bridge.
#[derive(Debug, Clone)]
pub struct BridgeConnector {
    http: BridgeHttp,
    settings: BridgeSettings,
}

impl BridgeConnector {
    /// Create a connector for the given bridge.
    pub fn new(settings: BridgeSettings) -> Self {
        Self {
            http: BridgeHttp::new(&settings),
            settings,
        }
    }

    /// Base URL of the sidecar.
    pub fn base_url(&self) -> &str {
        &self.http.base_url
    }
}

#[async_trait]
impl ProtocolConnector for BridgeConnector {
    async fn connect(&self) -> Result<Connection, ProtocolError> {
        self.http
            .call::<serde_json::Value>(self.http.request(Method::POST, "/session/start"))
            .await?;
        info!(url = %self.http.base_url, "bridge session started");

        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::channel(self.settings.event_capacity.max(1));
        tokio::spawn(run_event_stream(
            self.http.clone(),
            self.settings.poll_timeout,
            self.settings.max_stream_failures.max(1),
            event_tx,
            cancel.clone(),
        ));

        let session = BridgeSession {
            http: self.http.clone(),
            cancel,
        };
        Ok(Connection {
            session: Arc::new(session),
            events: event_rx,
        })
    }

    async fn discard_credentials(&self) -> Result<(), ProtocolError> {
        self.http
            .call::<serde_json::Value>(self.http.request(Method::DELETE, "/session"))
            .await?;
        info!("bridge credentials discarded");
        Ok(())
    }
}

/// One bridge-backed session. Dropping it stops the event stream.
#[derive(Debug)]
pub struct BridgeSession {
    http: BridgeHttp,
    cancel: CancellationToken,
}

impl Drop for BridgeSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl ProtocolSession for BridgeSession {
    async fn send_message(&self, chat_id: &str, body: &str) -> Result<(), ProtocolError> {
        let payload = serde_json::json!({ "jid": chat_id, "text": body });
        self.http
            .call::<serde_json::Value>(self.http.request(Method::POST, "/send").json(&payload))
            .await?;
        debug!(chat_id, "message sent via bridge");
        Ok(())
    }

    async fn group_fetch_all_participating(
        &self,
    ) -> Result<HashMap<String, ChatMetadata>, ProtocolError> {
        let groups = self
            .http
            .call::<HashMap<String, ChatMetadata>>(self.http.request(Method::GET, "/groups"))
            .await?;
        Ok(groups.unwrap_or_default())
    }

    async fn logout(&self) -> Result<(), ProtocolError> {
        self.http
            .call::<serde_json::Value>(self.http.request(Method::POST, "/logout"))
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Event stream
// ---------------------------------------------------------------------------

/// Event as serialized by the sidecar.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeEvent {
    Qr {
        qr: String,
    },
    Open {
        user_id: Option<String>,
    },
    Close {
        status_code: Option<u16>,
        message: Option<String>,
    },
    Messages {
        messages: Vec<serde_json::Value>,
    },
    /// Event types the gateway does not consume (`contacts.update`, ...).
    #[serde(other)]
    Other,
}

/// Baileys `WAMessage` subset.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    key: WireKey,
    push_name: Option<String>,
    message_timestamp: Option<WireTimestamp>,
    message: Option<WireContent>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireKey {
    remote_jid: Option<String>,
    #[serde(default)]
    from_me: bool,
    participant: Option<String>,
}

/// Baileys serializes `Long` timestamps as numbers, strings, or the raw
/// `{low, high, unsigned}` object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Number(i64),
    Text(String),
    Long { low: i64, high: i64 },
}

/// 2^32, the weight of the high word of a `Long`.
const LONG_HIGH_WORD: i64 = 4_294_967_296;

impl WireTimestamp {
    fn seconds(&self) -> Option<i64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.parse().ok(),
            // The low word arrives as a signed 32-bit value.
            Self::Long { low, high } => high
                .checked_mul(LONG_HIGH_WORD)?
                .checked_add(low & 0xFFFF_FFFF),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireContent {
    conversation: Option<String>,
    extended_text_message: Option<WireExtendedText>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireExtendedText {
    text: Option<String>,
}

impl From<WireMessage> for InboundItem {
    fn from(wire: WireMessage) -> Self {
        Self {
            remote_jid: wire.key.remote_jid,
            participant: wire.key.participant,
            from_me: wire.key.from_me,
            push_name: wire.push_name,
            timestamp: wire.message_timestamp.as_ref().and_then(WireTimestamp::seconds),
            content: wire.message.map(|content| InboundContent {
                conversation: content.conversation,
                extended_text: content.extended_text_message.and_then(|ext| ext.text),
            }),
        }
    }
}

impl BridgeEvent {
    fn into_protocol(self) -> Option<ProtocolEvent> {
        match self {
            Self::Qr { qr } => Some(ProtocolEvent::Qr(qr)),
            Self::Open { user_id } => Some(ProtocolEvent::Open { user_id }),
            Self::Close {
                status_code,
                message,
            } => Some(ProtocolEvent::Closed(CloseReason::new(
                status_code,
                message.unwrap_or_else(|| "connection closed".to_owned()),
            ))),
            Self::Messages { messages } => {
                let items = decode_messages(messages);
                (!items.is_empty()).then_some(ProtocolEvent::MessagesUpserted(items))
            }
            Self::Other => None,
        }
    }
}

/// Decode one poll batch entry by entry, dropping only what fails.
fn decode_batch(batch: Vec<serde_json::Value>) -> Vec<ProtocolEvent> {
    batch
        .into_iter()
        .filter_map(|raw| match serde_json::from_value::<BridgeEvent>(raw) {
            Ok(BridgeEvent::Other) => {
                debug!("ignoring unhandled bridge event type");
                None
            }
            Ok(event) => event.into_protocol(),
            Err(e) => {
                warn!(error = %e, "skipping undecodable bridge event");
                None
            }
        })
        .collect()
}

fn decode_messages(messages: Vec<serde_json::Value>) -> Vec<InboundItem> {
    messages
        .into_iter()
        .filter_map(|raw| match serde_json::from_value::<WireMessage>(raw) {
            Ok(wire) => Some(InboundItem::from(wire)),
            Err(e) => {
                warn!(error = %e, "skipping undecodable bridge message");
                None
            }
        })
        .collect()
}

/// Outcome of one long-poll request.
enum Poll {
    Events(Vec<serde_json::Value>),
    /// Long-poll expired with nothing to report.
    Idle,
    /// The sidecar no longer knows this session.
    SessionGone(u16),
}

/// Forward bridge events to `event_tx` until cancelled or the receiver drops.
///
/// Failed polls are retried with exponential backoff. After
/// `max_failures` consecutive failures, or once the sidecar reports the
/// session gone, a final [`ProtocolEvent::Closed`] is sent and the stream
/// ends.
async fn run_event_stream(
    http: BridgeHttp,
    poll_timeout: Duration,
    max_failures: u32,
    event_tx: mpsc::Sender<ProtocolEvent>,
    cancel: CancellationToken,
) {
    let mut backoff_ms = INITIAL_BACKOFF_MS;
    let mut failures: u32 = 0;

    let reason = loop {
        let polled = tokio::select! {
            () = cancel.cancelled() => return,
            polled = poll_once(&http, poll_timeout) => polled,
        };

        match polled {
            Ok(Poll::Events(batch)) => {
                failures = 0;
                backoff_ms = INITIAL_BACKOFF_MS;
                for event in decode_batch(batch) {
                    debug!(?event, "received bridge event");
                    if !forward(&event_tx, &cancel, event).await {
                        debug!("bridge event stream receiver dropped");
                        return;
                    }
                }
            }
            Ok(Poll::Idle) => {
                failures = 0;
                backoff_ms = INITIAL_BACKOFF_MS;
            }
            Ok(Poll::SessionGone(status)) => {
                break CloseReason::new(None, format!("bridge session gone (http {status})"));
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                if failures >= max_failures {
                    break CloseReason::new(None, format!("bridge event stream failed: {e}"));
                }
                warn!(error = %e, failures, backoff_ms, "bridge event stream error, reconnecting");
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                }
                backoff_ms = backoff_ms.saturating_mul(2).min(MAX_BACKOFF_MS);
            }
        }
    };

    warn!(%reason, "bridge event stream closed");
    forward(&event_tx, &cancel, ProtocolEvent::Closed(reason)).await;
    debug!("bridge event stream stopped");
}

/// Send one event unless cancelled first. Returns `false` when the stream
/// should stop.
async fn forward(
    event_tx: &mpsc::Sender<ProtocolEvent>,
    cancel: &CancellationToken,
    event: ProtocolEvent,
) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        sent = event_tx.send(event) => sent.is_ok(),
    }
}

/// One `/events/poll` round trip. Non-200 replies other than a gone
/// session are errors.
async fn poll_once(http: &BridgeHttp, poll_timeout: Duration) -> Result<Poll, ProtocolError> {
    let request = http.request(Method::GET, "/events/poll").timeout(poll_timeout);
    let resp = match request.send().await {
        Ok(resp) => resp,
        // Long-poll expiry.
        Err(e) if e.is_timeout() => return Ok(Poll::Idle),
        Err(e) => return Err(e.into()),
    };

    let status = resp.status();
    if SESSION_GONE_STATUSES.contains(&status.as_u16()) {
        return Ok(Poll::SessionGone(status.as_u16()));
    }
    if !status.is_success() {
        let message = resp.text().await.unwrap_or_default();
        return Err(ProtocolError::Rejected {
            status: status.as_u16(),
            message,
        });
    }

    match resp.json::<Vec<serde_json::Value>>().await {
        Ok(batch) => Ok(Poll::Events(batch)),
        Err(e) if e.is_timeout() => Ok(Poll::Idle),
        Err(e) => Err(e.into()),
    }
}
