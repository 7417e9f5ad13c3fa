//! Tests for `src/gateway/ingest.rs` — inbound batches and contact sync.

use std::sync::Arc;

use wagate::events::{EventSink, GatewayEvent};
use wagate::gateway::ingest::{IngestReport, MessageIngestPipeline};
use wagate::protocol::{InboundContent, InboundItem, ProtocolConnector, ProtocolEvent};
use wagate::store::Storage;

use crate::support::{eventually, harness, FakeConnector, Journal, MemoryStore, RecordingSink};

const SELF_JID: &str = "15550001111@s.whatsapp.net";
const ADA: &str = "15550002222@s.whatsapp.net";
const GROUP: &str = "120363000000@g.us";

struct Fixture {
    pipeline: MessageIngestPipeline,
    store: Arc<MemoryStore>,
    sink: Arc<RecordingSink>,
    journal: Arc<Journal>,
}

fn fixture() -> Fixture {
    let journal = Arc::new(Journal::default());
    let store = Arc::new(MemoryStore::new(Arc::clone(&journal)));
    let sink = Arc::new(RecordingSink::new(Arc::clone(&journal)));
    let pipeline = MessageIngestPipeline::new(
        Arc::clone(&store) as Arc<dyn Storage>,
        Arc::clone(&sink) as Arc<dyn EventSink>,
    );
    Fixture {
        pipeline,
        store,
        sink,
        journal,
    }
}

fn text(chat_id: &str, body: &str) -> InboundItem {
    InboundItem {
        remote_jid: Some(chat_id.to_owned()),
        push_name: Some("Ada".to_owned()),
        timestamp: Some(1_700_000_000),
        content: Some(InboundContent {
            conversation: Some(body.to_owned()),
            extended_text: None,
        }),
        ..InboundItem::default()
    }
}

#[tokio::test]
async fn failing_item_does_not_abort_batch() {
    let f = fixture();
    f.store.fail_messages_with_body("second");

    let report = f
        .pipeline
        .ingest_batch(
            vec![text(ADA, "first"), text(ADA, "second"), text(ADA, "third")],
            Some(SELF_JID),
        )
        .await;

    assert_eq!(
        report,
        IngestReport {
            stored: 2,
            skipped: 0,
            failed: 1
        }
    );
    let bodies: Vec<String> = f.store.messages().into_iter().map(|m| m.body).collect();
    assert_eq!(bodies, vec!["first", "third"]);
    assert_eq!(f.sink.count("message"), 2);
}

#[tokio::test]
async fn message_is_announced_after_it_is_stored() {
    let f = fixture();

    f.pipeline
        .ingest_batch(vec![text(ADA, "hello")], Some(SELF_JID))
        .await;

    let stored = f
        .journal
        .position(&format!("message {ADA}"))
        .expect("message stored");
    let emitted = f.journal.position("emit message").expect("message emitted");
    assert!(stored < emitted);
    assert_eq!(
        f.sink.events(),
        vec![GatewayEvent::Message {
            chat_id: ADA.to_owned(),
            from: ADA.to_owned(),
            body: "hello".to_owned(),
        }]
    );
}

#[tokio::test]
async fn direct_message_records_contact_and_metadata() {
    let f = fixture();

    f.pipeline
        .ingest_batch(vec![text(ADA, "hello")], Some(SELF_JID))
        .await;

    let contact = f.store.contact(ADA).expect("contact upserted");
    assert_eq!(contact.display_name.as_deref(), Some("Ada"));
    assert_eq!(contact.alias.as_deref(), Some("Ada"));
    assert_eq!(contact.number, "15550002222");
    assert!(!contact.is_group);

    let message = &f.store.messages()[0];
    assert_eq!(message.from, ADA);
    assert_eq!(message.to, SELF_JID);
    assert!(!message.is_from_me);
    assert_eq!(message.timestamp.timestamp(), 1_700_000_000);
}

#[tokio::test]
async fn group_message_uses_participant_as_sender() {
    let f = fixture();
    let item = InboundItem {
        participant: Some(ADA.to_owned()),
        ..text(GROUP, "hi all")
    };

    f.pipeline.ingest_batch(vec![item], Some(SELF_JID)).await;

    let contact = f.store.contact(GROUP).expect("group contact");
    assert!(contact.is_group);
    assert_eq!(contact.display_name, None);

    let message = &f.store.messages()[0];
    assert_eq!(message.chat_id, GROUP);
    assert_eq!(message.from, ADA);
}

#[tokio::test]
async fn own_and_empty_items_are_skipped() {
    let f = fixture();
    let own = InboundItem {
        from_me: true,
        ..text(ADA, "echo")
    };
    let stub = InboundItem {
        content: None,
        ..text(ADA, "ignored")
    };
    let orphan = InboundItem {
        remote_jid: None,
        ..text(ADA, "nowhere")
    };

    let report = f
        .pipeline
        .ingest_batch(vec![own, stub, orphan], Some(SELF_JID))
        .await;

    assert_eq!(report.skipped, 3);
    assert_eq!(report.stored, 0);
    assert!(f.journal.entries().is_empty());
}

#[tokio::test]
async fn body_falls_back_to_extended_text() {
    let f = fixture();
    let quoted = InboundItem {
        content: Some(InboundContent {
            conversation: None,
            extended_text: Some("see link".to_owned()),
        }),
        ..text(ADA, "")
    };
    let media = InboundItem {
        content: Some(InboundContent::default()),
        ..text(ADA, "")
    };

    let report = f
        .pipeline
        .ingest_batch(vec![quoted, media], Some(SELF_JID))
        .await;

    assert_eq!(report.stored, 2);
    let bodies: Vec<String> = f.store.messages().into_iter().map(|m| m.body).collect();
    assert_eq!(bodies, vec!["see link", ""]);
}

#[tokio::test]
async fn contact_sync_skips_failing_chats() {
    let f = fixture();
    let connector = FakeConnector::default();
    connector.set_groups(&[(GROUP, "Family"), ("120363000001@g.us", "Work")]);
    let connection = connector.connect().await.expect("connect");
    f.store.fail_contact("120363000001@g.us");

    let synced = f
        .pipeline
        .sync_contacts(connection.session.as_ref())
        .await
        .expect("sync");

    assert_eq!(synced, 1);
    assert!(f.store.contact(GROUP).is_some());
    assert!(f.store.contact("120363000001@g.us").is_none());
}

#[tokio::test]
async fn upserted_messages_flow_through_open_session() {
    let h = harness();
    h.open().await;

    h.push(ProtocolEvent::MessagesUpserted(vec![text(ADA, "ping")]))
        .await;
    eventually(|| h.sink.count("message") == 1).await;

    let messages = h.store.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].to, SELF_JID);
    assert_eq!(messages[0].body, "ping");
}
