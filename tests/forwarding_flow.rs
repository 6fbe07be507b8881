//! End-to-end forwarding tests over an in-memory store.
//!
//! A mock push transport feeds events into a real `SessionManager`,
//! routing runs through the real `Router` and `DigestScheduler`, and a
//! recording sink stands in for SMTP and live push chats.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio::time::timeout;

use msgbridge::digest::DigestScheduler;
use msgbridge::error::{DeliveryError, SessionError};
use msgbridge::media::MediaStore;
use msgbridge::model::{Account, AccountKind, ForwardMode, ForwardingRule, LogStatus};
use msgbridge::routing::{DeliverySink, OutboundMessage, ResolveSink, Router};
use msgbridge::session::{
    DialogInfo, InboundHandler, PushConnection, PushEvent, PushTransport, SessionManager,
};
use msgbridge::store::{LibSqlStore, NewAccount, NewRule, Store};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

// ── Mock transport ──────────────────────────────────────────────────

struct MockConnection {
    events: StdMutex<VecDeque<PushEvent>>,
}

#[async_trait]
impl PushConnection for MockConnection {
    async fn is_authorized(&self) -> Result<bool, SessionError> {
        Ok(true)
    }

    async fn send_code(&self, _phone: &str) -> Result<(), SessionError> {
        Ok(())
    }

    async fn sign_in(
        &self,
        _phone: &str,
        _code: &str,
        _password: Option<&str>,
    ) -> Result<(), SessionError> {
        Ok(())
    }

    async fn next_events(&self) -> Result<Vec<PushEvent>, SessionError> {
        let batch: Vec<PushEvent> = self.events.lock().unwrap().drain(..).collect();
        if batch.is_empty() {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            return Ok(vec![]);
        }
        Ok(batch)
    }

    async fn send_message(&self, _chat_id: &str, _text: &str) -> Result<(), DeliveryError> {
        Ok(())
    }

    async fn send_file(
        &self,
        _chat_id: &str,
        _path: &Path,
        _caption: Option<&str>,
    ) -> Result<(), DeliveryError> {
        Ok(())
    }

    async fn list_dialogs(&self) -> Result<Vec<DialogInfo>, SessionError> {
        Ok(vec![])
    }

    async fn logout(&self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

#[derive(Default)]
struct MockTransport {
    seed_events: StdMutex<std::collections::HashMap<i64, Vec<PushEvent>>>,
}

#[async_trait]
impl PushTransport for MockTransport {
    async fn connect(&self, account: &Account) -> Result<Arc<dyn PushConnection>, SessionError> {
        let events = self
            .seed_events
            .lock()
            .unwrap()
            .remove(&account.id)
            .unwrap_or_default();
        Ok(Arc::new(MockConnection {
            events: StdMutex::new(events.into()),
        }))
    }
}

// ── Recording sink ──────────────────────────────────────────────────

struct RecordingSink {
    delivered: StdMutex<Vec<OutboundMessage>>,
    fail: AtomicBool,
    notify: Notify,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            delivered: StdMutex::new(vec![]),
            fail: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    fn deliveries(&self) -> Vec<OutboundMessage> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliverySink for RecordingSink {
    async fn deliver(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        if self.fail.load(Ordering::Relaxed) {
            self.notify.notify_one();
            return Err(DeliveryError::SendFailed("relay refused".into()));
        }
        self.delivered.lock().unwrap().push(message.clone());
        self.notify.notify_one();
        Ok(())
    }
}

struct FixedResolver(Arc<RecordingSink>);

#[async_trait]
impl ResolveSink for FixedResolver {
    async fn resolve(
        &self,
        _rule: &ForwardingRule,
    ) -> Result<Arc<dyn DeliverySink>, DeliveryError> {
        Ok(Arc::clone(&self.0) as Arc<dyn DeliverySink>)
    }
}

// ── Fixture ─────────────────────────────────────────────────────────

struct Bridge {
    store: Arc<dyn Store>,
    sink: Arc<RecordingSink>,
    transport: Arc<MockTransport>,
    sessions: Arc<SessionManager>,
    router: Arc<Router>,
    scheduler: Arc<DigestScheduler>,
    media: Arc<MediaStore>,
    _dir: TempDir,
}

async fn bridge() -> Bridge {
    let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
    let dir = TempDir::new().unwrap();
    let media = Arc::new(MediaStore::new(
        dir.path().join("media"),
        dir.path().join("tmp"),
    ));
    media.ensure_dirs().await.unwrap();

    let sink = RecordingSink::new();
    let resolver = Arc::new(FixedResolver(Arc::clone(&sink)));
    let transport = Arc::new(MockTransport::default());
    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&store),
        Arc::clone(&transport) as Arc<dyn PushTransport>,
    ));
    let router = Arc::new(Router::new(
        Arc::clone(&store),
        Arc::clone(&resolver) as Arc<dyn ResolveSink>,
        Arc::clone(&media),
    ));
    sessions.set_inbound_handler(Arc::clone(&router) as Arc<dyn InboundHandler>);
    let scheduler = Arc::new(DigestScheduler::new(
        Arc::clone(&store),
        resolver,
        Arc::clone(&media),
    ));

    Bridge {
        store,
        sink,
        transport,
        sessions,
        router,
        scheduler,
        media,
        _dir: dir,
    }
}

async fn seed_accounts(b: &Bridge) -> (Account, i64) {
    let source_id = b
        .store
        .insert_account(&NewAccount {
            name: "personal".into(),
            kind: AccountKind::PushSession,
            credentials: serde_json::json!({"session_token": "tok"}),
            active: true,
        })
        .await
        .unwrap();
    let dest_id = b
        .store
        .insert_account(&NewAccount {
            name: "archive".into(),
            kind: AccountKind::MailboxSink,
            credentials: serde_json::json!({}),
            active: true,
        })
        .await
        .unwrap();
    let source = b.store.get_account(source_id).await.unwrap().unwrap();
    (source, dest_id)
}

async fn seed_rule(b: &Bridge, source: i64, dest: i64, mode: ForwardMode, filters: &[&str]) -> i64 {
    b.store
        .insert_rule(&NewRule {
            name: Some("work chat".into()),
            source_account_id: source,
            destination_account_id: dest,
            filter_set: filters.iter().map(|s| s.to_string()).collect(),
            destination_config: serde_json::json!({"email": "me@example.com"}),
            mode,
            interval_minutes: 30,
            enabled: true,
        })
        .await
        .unwrap()
}

fn event(origin: &str, id: &str, text: &str) -> PushEvent {
    PushEvent {
        origin_id: origin.into(),
        external_id: id.into(),
        sender_label: "Alice".into(),
        text: text.into(),
        attachment: None,
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn push_event_is_forwarded_instantly() {
    let b = bridge().await;
    let (source, dest) = seed_accounts(&b).await;
    let rule_id = seed_rule(&b, source.id, dest, ForwardMode::Instant, &["-1001"]).await;

    b.transport
        .seed_events
        .lock()
        .unwrap()
        .insert(source.id, vec![event("-1001", "m1", "ship it")]);
    b.sessions.start_account(&source).await.unwrap();

    timeout(TEST_TIMEOUT, b.sink.notify.notified())
        .await
        .expect("delivery never happened");

    let delivered = b.sink.deliveries();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].body, "ship it");

    let sent = b
        .store
        .query_log_entries(rule_id, LogStatus::Sent)
        .await
        .unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].external_message_id, "m1");
}

#[tokio::test]
async fn filtered_out_events_are_dropped() {
    let b = bridge().await;
    let (source, dest) = seed_accounts(&b).await;
    let rule_id = seed_rule(&b, source.id, dest, ForwardMode::Instant, &["-1001"]).await;

    b.transport.seed_events.lock().unwrap().insert(
        source.id,
        vec![event("-9999", "m1", "noise"), event("-1001", "m2", "signal")],
    );
    b.sessions.start_account(&source).await.unwrap();

    timeout(TEST_TIMEOUT, b.sink.notify.notified())
        .await
        .expect("delivery never happened");

    let delivered = b.sink.deliveries();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].body, "signal");
    let sent = b
        .store
        .query_log_entries(rule_id, LogStatus::Sent)
        .await
        .unwrap();
    assert_eq!(sent.len(), 1);
}

#[tokio::test]
async fn digest_accumulates_then_delivers_once() {
    let b = bridge().await;
    let (source, dest) = seed_accounts(&b).await;
    let rule_id = seed_rule(&b, source.id, dest, ForwardMode::Digest, &[]).await;

    // Three messages arrive over time; none should be delivered yet.
    for (id, text) in [("m1", "one"), ("m2", "two"), ("m3", "three")] {
        b.router
            .handle_push_event(source.id, event("-1001", id, text))
            .await;
    }
    assert!(b.sink.deliveries().is_empty());
    assert_eq!(
        b.store
            .query_log_entries(rule_id, LogStatus::Pending)
            .await
            .unwrap()
            .len(),
        3
    );

    // The scheduled fire sends one digest covering the batch.
    let sent = b.scheduler.run_rule(rule_id).await.unwrap();
    assert_eq!(sent, 3);
    let delivered = b.sink.deliveries();
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].subject.starts_with("Digest:"));
    assert!(delivered[0].body.contains("one"));
    assert!(delivered[0].body.contains("three"));

    // A second fire with nothing queued is a no-op.
    assert_eq!(b.scheduler.run_rule(rule_id).await.unwrap(), 0);
    assert_eq!(b.sink.deliveries().len(), 1);
}

#[tokio::test]
async fn digest_attachment_survives_until_sent() {
    let b = bridge().await;
    let (source, dest) = seed_accounts(&b).await;
    let rule_id = seed_rule(&b, source.id, dest, ForwardMode::Digest, &[]).await;

    let temp_file = b.media.temp_path(&source.id.to_string(), "report.pdf");
    tokio::fs::write(&temp_file, b"pdf bytes").await.unwrap();
    let mut ev = event("-1001", "m1", "see attached");
    ev.attachment = Some(temp_file.clone());
    b.router.handle_push_event(source.id, ev).await;

    let pending = b
        .store
        .query_log_entries(rule_id, LogStatus::Pending)
        .await
        .unwrap();
    let durable = pending[0].attachment_path.clone().unwrap();
    assert!(durable.exists());
    assert!(!temp_file.exists());

    b.scheduler.run_rule(rule_id).await.unwrap();
    assert_eq!(b.sink.deliveries()[0].attachments, vec![durable.clone()]);
    // Consumed after the digest went out.
    assert!(!durable.exists());
}

#[tokio::test]
async fn failed_instant_delivery_is_terminal() {
    let b = bridge().await;
    let (source, dest) = seed_accounts(&b).await;
    let rule_id = seed_rule(&b, source.id, dest, ForwardMode::Instant, &["*"]).await;
    b.sink.fail.store(true, Ordering::Relaxed);

    b.router
        .handle_push_event(source.id, event("-1001", "m1", "doomed"))
        .await;

    let failed = b
        .store
        .query_log_entries(rule_id, LogStatus::Failed)
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert!(b.sink.deliveries().is_empty());

    // Recovery affects only later messages.
    b.sink.fail.store(false, Ordering::Relaxed);
    b.router
        .handle_push_event(source.id, event("-1001", "m2", "fine"))
        .await;
    assert_eq!(b.sink.deliveries().len(), 1);
    assert_eq!(
        b.store
            .query_log_entries(rule_id, LogStatus::Failed)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn failed_digest_rolls_into_next_run() {
    let b = bridge().await;
    let (source, dest) = seed_accounts(&b).await;
    let rule_id = seed_rule(&b, source.id, dest, ForwardMode::Digest, &[]).await;

    b.router
        .handle_push_event(source.id, event("-1001", "m1", "hold on"))
        .await;

    b.sink.fail.store(true, Ordering::Relaxed);
    assert!(b.scheduler.run_rule(rule_id).await.is_err());
    assert_eq!(
        b.store
            .query_log_entries(rule_id, LogStatus::Pending)
            .await
            .unwrap()
            .len(),
        1
    );

    b.sink.fail.store(false, Ordering::Relaxed);
    assert_eq!(b.scheduler.run_rule(rule_id).await.unwrap(), 1);
    assert!(b
        .store
        .query_log_entries(rule_id, LogStatus::Pending)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn rule_toggle_reshapes_digest_jobs() {
    let b = bridge().await;
    let (source, dest) = seed_accounts(&b).await;
    let rule_id = seed_rule(&b, source.id, dest, ForwardMode::Digest, &[]).await;

    assert_eq!(b.scheduler.sync_all().await, 1);

    b.store.set_rule_enabled(rule_id, false).await.unwrap();
    assert_eq!(b.scheduler.sync_all().await, 0);

    b.store.set_rule_enabled(rule_id, true).await.unwrap();
    assert_eq!(b.scheduler.sync_all().await, 1);

    b.scheduler.stop().await;
}
