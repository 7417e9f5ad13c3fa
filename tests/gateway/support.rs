//! Fakes for the gateway's collaborators: protocol transport, storage, and
//! event sink. All of them append to a shared [`Journal`] so tests can assert
//! on the ordering of writes and emissions.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use wagate::events::{EventSink, GatewayEvent};
use wagate::gateway::manager::ConnectionState;
use wagate::gateway::reconnect::ReconnectPolicy;
use wagate::protocol::{
    ChatMetadata, Connection, ProtocolConnector, ProtocolError, ProtocolEvent, ProtocolSession,
};
use wagate::store::{Contact, Message, Session, SessionUpdate, StoreError, Storage};
use wagate::Gateway;

pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub const SELF_IDENTITY: &str = "15550001111:4@s.whatsapp.net";

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

/// Ordered record of side effects.
#[derive(Default)]
pub struct Journal {
    entries: Mutex<Vec<String>>,
}

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().expect("journal lock").push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().expect("journal lock").clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// In-memory storage with injectable failures.
pub struct MemoryStore {
    journal: Arc<Journal>,
    session: Mutex<Option<Session>>,
    contacts: Mutex<BTreeMap<String, Contact>>,
    messages: Mutex<Vec<Message>>,
    failing_bodies: Mutex<Vec<String>>,
    failing_contacts: Mutex<Vec<String>>,
    fail_session: AtomicBool,
    /// `true` while message writes may proceed.
    message_gate: watch::Sender<bool>,
}

impl MemoryStore {
    pub fn new(journal: Arc<Journal>) -> Self {
        Self {
            journal,
            session: Mutex::new(None),
            contacts: Mutex::new(BTreeMap::new()),
            messages: Mutex::new(Vec::new()),
            failing_bodies: Mutex::new(Vec::new()),
            failing_contacts: Mutex::new(Vec::new()),
            fail_session: AtomicBool::new(false),
            message_gate: watch::channel(true).0,
        }
    }

    /// Make `create_message` fail for messages with this body.
    pub fn fail_messages_with_body(&self, body: &str) {
        self.failing_bodies
            .lock()
            .expect("lock")
            .push(body.to_owned());
    }

    /// Make `upsert_contact` fail for this chat id.
    pub fn fail_contact(&self, chat_id: &str) {
        self.failing_contacts
            .lock()
            .expect("lock")
            .push(chat_id.to_owned());
    }

    /// Make every session write fail.
    pub fn fail_session_writes(&self) {
        self.fail_session.store(true, Ordering::SeqCst);
    }

    /// Block `create_message` until [`release_messages`](Self::release_messages).
    pub fn hold_messages(&self) {
        self.message_gate.send_replace(false);
    }

    pub fn release_messages(&self) {
        self.message_gate.send_replace(true);
    }

    pub fn session(&self) -> Option<Session> {
        self.session.lock().expect("lock").clone()
    }

    pub fn contact(&self, chat_id: &str) -> Option<Contact> {
        self.contacts.lock().expect("lock").get(chat_id).cloned()
    }

    pub fn contact_count(&self) -> usize {
        self.contacts.lock().expect("lock").len()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().expect("lock").clone()
    }

    pub fn insert_contact(&self, contact: Contact) {
        self.contacts
            .lock()
            .expect("lock")
            .insert(contact.chat_id.clone(), contact);
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn update_session(&self, update: SessionUpdate) -> Result<(), StoreError> {
        if self.fail_session.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("session writes disabled".to_owned()));
        }
        let mut guard = self.session.lock().expect("lock");
        let session = guard.get_or_insert_with(Session::default);
        update.apply_to(session);
        self.journal.record(format!(
            "session connected={} qr={}",
            session.is_connected,
            session.qr_code.as_deref().unwrap_or("-")
        ));
        Ok(())
    }

    async fn get_session(&self) -> Result<Option<Session>, StoreError> {
        Ok(self.session())
    }

    async fn upsert_contact(&self, contact: &Contact) -> Result<(), StoreError> {
        if self
            .failing_contacts
            .lock()
            .expect("lock")
            .contains(&contact.chat_id)
        {
            return Err(StoreError::Unavailable("contact write failed".to_owned()));
        }
        let mut contacts = self.contacts.lock().expect("lock");
        let merged = match contacts.get(&contact.chat_id) {
            Some(existing) => Contact {
                display_name: contact
                    .display_name
                    .clone()
                    .or_else(|| existing.display_name.clone()),
                alias: contact.alias.clone().or_else(|| existing.alias.clone()),
                ..contact.clone()
            },
            None => contact.clone(),
        };
        contacts.insert(contact.chat_id.clone(), merged);
        self.journal.record(format!("contact {}", contact.chat_id));
        Ok(())
    }

    async fn get_contact(&self, chat_id: &str) -> Result<Option<Contact>, StoreError> {
        Ok(self.contact(chat_id))
    }

    async fn create_message(&self, mut message: Message) -> Result<Message, StoreError> {
        let mut gate = self.message_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        if self
            .failing_bodies
            .lock()
            .expect("lock")
            .contains(&message.body)
        {
            return Err(StoreError::Unavailable("message write failed".to_owned()));
        }
        let mut messages = self.messages.lock().expect("lock");
        message.id = Some(i64::try_from(messages.len()).expect("fits").saturating_add(1));
        messages.push(message.clone());
        self.journal.record(format!("message {}", message.chat_id));
        Ok(message)
    }

    async fn list_messages(
        &self,
        chat_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let messages: Vec<Message> = self
            .messages()
            .into_iter()
            .filter(|m| m.chat_id == chat_id)
            .collect();
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.into_iter().skip(skip).collect())
    }
}

// ---------------------------------------------------------------------------
// Event sink
// ---------------------------------------------------------------------------

/// Sink that remembers everything it was given.
pub struct RecordingSink {
    journal: Arc<Journal>,
    events: Mutex<Vec<GatewayEvent>>,
}

impl RecordingSink {
    pub fn new(journal: Arc<Journal>) -> Self {
        Self {
            journal,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<GatewayEvent> {
        self.events.lock().expect("lock").clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(GatewayEvent::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.names().iter().filter(|n| **n == name).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: GatewayEvent) {
        self.journal.record(format!("emit {}", event.name()));
        self.events.lock().expect("lock").push(event);
    }
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

/// Scriptable protocol session.
#[derive(Default)]
pub struct FakeSession {
    sent: Mutex<Vec<(String, String)>>,
    groups: HashMap<String, ChatMetadata>,
    fail_send: AtomicBool,
    fail_logout: AtomicBool,
    logout_calls: AtomicUsize,
}

impl FakeSession {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().expect("lock").clone()
    }

    pub fn fail_sends(&self) {
        self.fail_send.store(true, Ordering::SeqCst);
    }

    pub fn fail_logout(&self) {
        self.fail_logout.store(true, Ordering::SeqCst);
    }

    pub fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProtocolSession for FakeSession {
    async fn send_message(&self, chat_id: &str, body: &str) -> Result<(), ProtocolError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(ProtocolError::Rejected {
                status: 500,
                message: "socket closed".to_owned(),
            });
        }
        self.sent
            .lock()
            .expect("lock")
            .push((chat_id.to_owned(), body.to_owned()));
        Ok(())
    }

    async fn group_fetch_all_participating(
        &self,
    ) -> Result<HashMap<String, ChatMetadata>, ProtocolError> {
        Ok(self.groups.clone())
    }

    async fn logout(&self) -> Result<(), ProtocolError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_logout.load(Ordering::SeqCst) {
            return Err(ProtocolError::Closed);
        }
        Ok(())
    }
}

/// Connector handing out [`FakeSession`]s and keeping their event senders.
#[derive(Default)]
pub struct FakeConnector {
    attempts: AtomicUsize,
    failures_left: AtomicUsize,
    discarded: AtomicUsize,
    groups: Mutex<HashMap<String, ChatMetadata>>,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
    senders: Mutex<Vec<mpsc::Sender<ProtocolEvent>>>,
}

impl FakeConnector {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn discarded(&self) -> usize {
        self.discarded.load(Ordering::SeqCst)
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Chats reported by sessions created from now on.
    pub fn set_groups(&self, groups: &[(&str, &str)]) {
        let mut map = self.groups.lock().expect("lock");
        map.clear();
        for (id, subject) in groups {
            map.insert(
                (*id).to_owned(),
                ChatMetadata {
                    id: (*id).to_owned(),
                    subject: Some((*subject).to_owned()),
                },
            );
        }
    }

    /// Session created by the latest successful attempt.
    pub fn session(&self) -> Arc<FakeSession> {
        Arc::clone(
            self.sessions
                .lock()
                .expect("lock")
                .last()
                .expect("no session established"),
        )
    }

    /// Event sender of the `index`-th successful attempt.
    pub fn sender(&self, index: usize) -> mpsc::Sender<ProtocolEvent> {
        self.senders.lock().expect("lock")[index].clone()
    }

    /// Drop every event sender, ending the sessions' event streams.
    pub fn hang_up(&self) {
        self.senders.lock().expect("lock").clear();
    }

    /// Event sender of the latest successful attempt.
    pub fn latest(&self) -> mpsc::Sender<ProtocolEvent> {
        self.senders
            .lock()
            .expect("lock")
            .last()
            .expect("no session established")
            .clone()
    }
}

#[async_trait]
impl ProtocolConnector for FakeConnector {
    async fn connect(&self) -> Result<Connection, ProtocolError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(ProtocolError::Rejected {
                status: 503,
                message: "bridge unavailable".to_owned(),
            });
        }

        let session = Arc::new(FakeSession {
            groups: self.groups.lock().expect("lock").clone(),
            ..FakeSession::default()
        });
        let (tx, rx) = mpsc::channel(64);
        self.sessions.lock().expect("lock").push(Arc::clone(&session));
        self.senders.lock().expect("lock").push(tx);
        Ok(Connection {
            session,
            events: rx,
        })
    }

    async fn discard_credentials(&self) -> Result<(), ProtocolError> {
        self.discarded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub gateway: Gateway,
    pub connector: Arc<FakeConnector>,
    pub store: Arc<MemoryStore>,
    pub sink: Arc<RecordingSink>,
    pub journal: Arc<Journal>,
}

pub fn harness() -> Harness {
    let journal = Arc::new(Journal::default());
    let connector = Arc::new(FakeConnector::default());
    let store = Arc::new(MemoryStore::new(Arc::clone(&journal)));
    let sink = Arc::new(RecordingSink::new(Arc::clone(&journal)));
    let gateway = Gateway::new(
        Arc::clone(&connector) as Arc<dyn ProtocolConnector>,
        Arc::clone(&store) as Arc<dyn Storage>,
        Arc::clone(&sink) as Arc<dyn EventSink>,
        ReconnectPolicy::new(RECONNECT_DELAY),
    );
    Harness {
        gateway,
        connector,
        store,
        sink,
        journal,
    }
}

impl Harness {
    /// Push an event into the latest session.
    pub async fn push(&self, event: ProtocolEvent) {
        self.connector
            .latest()
            .send(event)
            .await
            .expect("event loop should be receiving");
    }

    /// Initialize and drive the session to `Open`.
    pub async fn open(&self) {
        self.gateway.initialize().await.expect("initialize");
        self.push(ProtocolEvent::Open {
            user_id: Some(SELF_IDENTITY.to_owned()),
        })
        .await;
        self.wait_for_state(ConnectionState::Open).await;
        eventually(|| self.sink.count("ready") >= 1).await;
    }

    pub async fn wait_for_state(&self, expected: ConnectionState) {
        for _ in 0..400 {
            if self.gateway.state().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "state never became {expected:?}, is {:?}",
            self.gateway.state().await
        );
    }
}

/// Poll a synchronous condition until it holds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// Let spawned tasks run without advancing time much.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Advance paused time once pending timers have been armed.
pub async fn advance(duration: Duration) {
    settle().await;
    tokio::time::advance(duration).await;
}
