//! Connection lifecycle state machine.
//!
//! [`ConnectionManager`] owns the single protocol session handle and the
//! in-memory [`ConnectionState`]. All transitions run under one async mutex,
//! so lifecycle reactions, reconnects, and user commands never interleave.
//!
//! Each established session gets a generation number, its own event task,
//! and a stop token. Replacing or retiring a session cancels the token and
//! bumps the generation, so events from a retired session are never
//! processed. The task notices the token between inbound items, so an item
//! already being written finishes with both its contact and its message.
//!
//! ```text
//! Idle -> Connecting -> AwaitingQr -> Open
//!            |              |          |
//!            +------> Closed(reason) <-+ --(retry timer)--> Connecting
//! Open -> Closing -> Idle   (disconnect)
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ingest::MessageIngestPipeline;
use super::reconnect::{ReconnectDecision, ReconnectPolicy};
use super::{jid, GatewayError};
use crate::events::{EventSink, GatewayEvent};
use crate::protocol::{CloseReason, InboundItem, ProtocolConnector, ProtocolEvent, ProtocolSession};
use crate::store::{SessionUpdate, Storage};

/// Reason reported when `disconnect()` ends the session.
pub const LOGOUT_REASON: &str = "logged out";

/// Lifecycle state. In-memory only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not initialized.
    Idle,
    /// A session is being established.
    Connecting,
    /// Waiting for the QR challenge to be scanned.
    AwaitingQr,
    /// Authenticated and usable.
    Open,
    /// `disconnect()` is logging out.
    Closing,
    /// The session closed.
    Closed(CloseReason),
}

/// A session that is open for outbound traffic.
#[derive(Clone)]
pub struct OpenSession {
    /// Protocol handle.
    pub session: Arc<dyn ProtocolSession>,
    /// Identity of the linked account, if known.
    pub self_id: Option<String>,
}

impl std::fmt::Debug for OpenSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenSession")
            .field("self_id", &self.self_id)
            .finish_non_exhaustive()
    }
}

/// What the event loop does after a lifecycle event.
enum Flow {
    Continue,
    SyncContacts(Arc<dyn ProtocolSession>),
    Stop,
}

struct ManagerState {
    initialized: bool,
    connection: ConnectionState,
    session: Option<Arc<dyn ProtocolSession>>,
    connected: bool,
    self_id: Option<String>,
    generation: u64,
    /// Stops the current session's event task.
    session_stop: Option<CancellationToken>,
    /// Cancelled by `disconnect()`; parent of every reconnect timer.
    lifecycle: CancellationToken,
    pending_reconnect: Option<CancellationToken>,
}

impl ManagerState {
    fn new() -> Self {
        Self {
            initialized: false,
            connection: ConnectionState::Idle,
            session: None,
            connected: false,
            self_id: None,
            generation: 0,
            session_stop: None,
            lifecycle: CancellationToken::new(),
            pending_reconnect: None,
        }
    }
}

struct Inner {
    connector: Arc<dyn ProtocolConnector>,
    storage: Arc<dyn Storage>,
    sink: Arc<dyn EventSink>,
    ingest: MessageIngestPipeline,
    policy: ReconnectPolicy,
    state: Mutex<ManagerState>,
}

/// Owns the protocol session and drives the lifecycle.
///
/// Cloning is cheap; clones share the same state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("policy", &self.inner.policy)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create an idle manager.
    pub fn new(
        connector: Arc<dyn ProtocolConnector>,
        storage: Arc<dyn Storage>,
        sink: Arc<dyn EventSink>,
        ingest: MessageIngestPipeline,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                storage,
                sink,
                ingest,
                policy,
                state: Mutex::new(ManagerState::new()),
            }),
        }
    }

    /// Establish the first session. A no-op if already initialized.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::SessionEstablishmentFailed`] when the
    /// connector fails; the manager stays uninitialized so the call can be
    /// retried.
    pub async fn initialize(&self) -> Result<(), GatewayError> {
        let mut state = self.inner.state.lock().await;
        if state.initialized {
            debug!("gateway already initialized");
            return Ok(());
        }

        state.lifecycle = CancellationToken::new();
        match self.inner.establish(&mut state).await {
            Ok(()) => {
                state.initialized = true;
                info!(generation = state.generation, "gateway initialized");
                Ok(())
            }
            Err(e) => {
                state.connection = ConnectionState::Idle;
                Err(e)
            }
        }
    }

    /// Log out, cancel any pending reconnect, and return to `Idle`.
    ///
    /// Logout failures are logged; the disconnect always completes.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        state.lifecycle.cancel();
        state.pending_reconnect = None;
        let was_initialized = std::mem::replace(&mut state.initialized, false);

        let session = state.session.clone();
        inner.retire(&mut state);

        if let Some(session) = session {
            state.connection = ConnectionState::Closing;
            if let Err(e) = session.logout().await {
                warn!(error = %e, "logout failed, disconnecting anyway");
            }
        }

        inner.persist(SessionUpdate::disconnected()).await;
        state.connection = ConnectionState::Idle;

        if was_initialized {
            inner.sink.emit(GatewayEvent::Disconnected {
                reason: LOGOUT_REASON.to_owned(),
            });
        }
        info!("gateway disconnected");
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ConnectionState {
        self.inner.state.lock().await.connection.clone()
    }

    /// Current protocol session, pending or open. Read-only diagnostics.
    pub async fn connection_handle(&self) -> Option<Arc<dyn ProtocolSession>> {
        self.inner.state.lock().await.session.clone()
    }

    /// The session, only if it is open and connected.
    pub async fn open_session(&self) -> Option<OpenSession> {
        let state = self.inner.state.lock().await;
        if !state.connected {
            return None;
        }
        state.session.clone().map(|session| OpenSession {
            session,
            self_id: state.self_id.clone(),
        })
    }

    /// Whether `initialize()` has succeeded and no disconnect followed.
    pub async fn is_initialized(&self) -> bool {
        self.inner.state.lock().await.initialized
    }

    /// Whether a reconnect timer is armed.
    pub async fn has_pending_reconnect(&self) -> bool {
        self.inner
            .state
            .lock()
            .await
            .pending_reconnect
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }
}

impl Inner {
    /// Replace the current session with a freshly established one.
    async fn establish(
        self: &Arc<Self>,
        state: &mut ManagerState,
    ) -> Result<(), GatewayError> {
        self.retire(state);
        state.connection = ConnectionState::Connecting;

        let connection = self
            .connector
            .connect()
            .await
            .map_err(GatewayError::SessionEstablishmentFailed)?;

        let generation = state.generation;
        let stop = CancellationToken::new();
        state.session = Some(connection.session);
        state.session_stop = Some(stop.clone());
        tokio::spawn(Arc::clone(self).run_events(generation, connection.events, stop));
        debug!(generation, "protocol session established");
        Ok(())
    }

    /// Signal the current session's event task to stop and drop its handle.
    fn retire(&self, state: &mut ManagerState) {
        if let Some(stop) = state.session_stop.take() {
            stop.cancel();
        }
        state.session = None;
        state.connected = false;
        state.self_id = None;
        state.generation = state.generation.wrapping_add(1);
    }

    /// Best-effort session write.
    async fn persist(&self, update: SessionUpdate) {
        if let Err(e) = self.storage.update_session(update).await {
            error!(error = %e, "failed to persist session state");
        }
    }

    /// Lock the state if `generation` is still the live session.
    async fn lock_current(&self, generation: u64) -> Option<MutexGuard<'_, ManagerState>> {
        let state = self.state.lock().await;
        if state.generation == generation {
            Some(state)
        } else {
            debug!(generation, current = state.generation, "dropping event from retired session");
            None
        }
    }

    /// Process one session's events in transport order.
    async fn run_events(
        self: Arc<Self>,
        generation: u64,
        mut events: mpsc::Receiver<ProtocolEvent>,
        stop: CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                biased;
                () = stop.cancelled() => break,
                next = events.recv() => next,
            };
            let Some(event) = next else {
                let reason = CloseReason::new(None, "event stream ended");
                self.on_closed(generation, reason).await;
                break;
            };

            let flow = match event {
                ProtocolEvent::Qr(qr) => self.on_qr(generation, qr).await,
                ProtocolEvent::Open { user_id } => self.on_open(generation, user_id).await,
                ProtocolEvent::Closed(reason) => self.on_closed(generation, reason).await,
                ProtocolEvent::MessagesUpserted(items) => {
                    self.on_messages(generation, items, &stop).await
                }
            };

            match flow {
                Flow::Continue => {}
                Flow::SyncContacts(session) => {
                    if let Err(e) = self
                        .ingest
                        .sync_contacts_until(session.as_ref(), &stop)
                        .await
                    {
                        warn!(error = %e, "contact sync failed");
                    }
                }
                Flow::Stop => break,
            }
        }
        debug!(generation, "session event loop finished");
    }

    async fn on_qr(&self, generation: u64, qr: String) -> Flow {
        let Some(mut state) = self.lock_current(generation).await else {
            return Flow::Stop;
        };
        if !matches!(
            state.connection,
            ConnectionState::Connecting | ConnectionState::AwaitingQr
        ) {
            warn!(state = ?state.connection, "QR challenge outside pairing, ignoring");
            return Flow::Continue;
        }

        state.connection = ConnectionState::AwaitingQr;
        state.connected = false;
        self.persist(SessionUpdate::awaiting_qr(qr.clone())).await;
        self.sink.emit(GatewayEvent::Qr { qr });
        info!("QR challenge received, waiting for scan");
        Flow::Continue
    }

    async fn on_open(&self, generation: u64, user_id: Option<String>) -> Flow {
        let Some(mut state) = self.lock_current(generation).await else {
            return Flow::Stop;
        };
        if !matches!(
            state.connection,
            ConnectionState::Connecting | ConnectionState::AwaitingQr
        ) {
            warn!(state = ?state.connection, "open signal in unexpected state, ignoring");
            return Flow::Continue;
        }

        let phone = user_id.as_deref().and_then(jid::phone_from_identity);
        state.connection = ConnectionState::Open;
        state.connected = true;
        state.self_id = phone
            .as_deref()
            .map(|number| format!("{number}@{}", jid::USER_DOMAIN));

        self.persist(SessionUpdate::connected(phone.clone(), Utc::now()))
            .await;
        self.sink.emit(GatewayEvent::Ready);
        info!(phone = phone.as_deref().unwrap_or("unknown"), "session open");

        match state.session.clone() {
            Some(session) => Flow::SyncContacts(session),
            None => Flow::Continue,
        }
    }

    async fn on_closed(self: &Arc<Self>, generation: u64, reason: CloseReason) -> Flow {
        let Some(mut state) = self.lock_current(generation).await else {
            return Flow::Stop;
        };
        if !matches!(
            state.connection,
            ConnectionState::Connecting | ConnectionState::AwaitingQr | ConnectionState::Open
        ) {
            debug!(state = ?state.connection, %reason, "closure in inactive state, ignoring");
            return Flow::Stop;
        }

        // This task is the event task and stops on its own.
        state.session_stop = None;
        state.session = None;
        state.connected = false;
        state.self_id = None;
        state.connection = ConnectionState::Closed(reason.clone());

        self.persist(SessionUpdate::disconnected()).await;
        self.sink.emit(GatewayEvent::Disconnected {
            reason: reason.to_string(),
        });
        warn!(%reason, "session closed");

        self.after_close(&mut state, &reason).await;
        Flow::Stop
    }

    async fn on_messages(
        &self,
        generation: u64,
        items: Vec<InboundItem>,
        stop: &CancellationToken,
    ) -> Flow {
        let self_id = match self.lock_current(generation).await {
            Some(state) => state.self_id.clone(),
            None => return Flow::Stop,
        };
        self.ingest
            .ingest_until(items, self_id.as_deref(), stop)
            .await;
        Flow::Continue
    }

    /// Apply the reconnect policy to a closure.
    async fn after_close(self: &Arc<Self>, state: &mut ManagerState, reason: &CloseReason) {
        match self.policy.decide(reason) {
            ReconnectDecision::Retry(delay) => self.schedule_reconnect(state, delay),
            ReconnectDecision::Stop => {
                state.initialized = false;
                info!("logged out, re-authentication required on next initialize");
                if let Err(e) = self.connector.discard_credentials().await {
                    warn!(error = %e, "failed to discard stored credentials");
                }
            }
        }
    }

    /// Arm a single-shot reconnect timer, replacing any pending one.
    fn schedule_reconnect(self: &Arc<Self>, state: &mut ManagerState, delay: Duration) {
        let token = state.lifecycle.child_token();
        if let Some(previous) = state.pending_reconnect.replace(token.clone()) {
            previous.cancel();
        }

        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        info!(delay_ms, "reconnect scheduled");

        let inner = Arc::clone(self);
        let cancelled = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancelled.cancelled() => debug!("pending reconnect cancelled"),
                () = tokio::time::sleep(delay) => inner.reconnect(token).await,
            }
        });
    }

    /// Timer body: re-run session establishment.
    async fn reconnect(self: Arc<Self>, token: CancellationToken) {
        let mut state = self.state.lock().await;
        if token.is_cancelled() || !state.initialized {
            debug!("reconnect skipped, lifecycle stopped");
            return;
        }
        state.pending_reconnect = None;

        info!("reconnecting");
        if let Err(e) = self.establish(&mut state).await {
            warn!(error = %e, "reconnect attempt failed");
            let reason = CloseReason::new(None, e.to_string());
            state.connection = ConnectionState::Closed(reason.clone());
            self.after_close(&mut state, &reason).await;
        }
    }
}
