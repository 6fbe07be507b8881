//! Per-message routing flow.
//!
//! The router is the single writer of new message-log entries. Instant
//! rules are delivered inline with a PROCESSING -> SENT/FAILED lifecycle;
//! digest rules only persist a PENDING entry (plus a durable attachment
//! copy) and leave delivery to the scheduler.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::media::MediaStore;
use crate::model::{ForwardMode, ForwardingRule, InboundMessage, LogStatus, NewLogEntry, snippet};
use crate::routing::matcher::match_rules;
use crate::routing::sink::{OutboundMessage, ResolveSink};
use crate::session::{InboundHandler, PushEvent};
use crate::store::Store;

pub struct Router {
    store: Arc<dyn Store>,
    resolver: Arc<dyn ResolveSink>,
    media: Arc<MediaStore>,
}

impl Router {
    pub fn new(
        store: Arc<dyn Store>,
        resolver: Arc<dyn ResolveSink>,
        media: Arc<MediaStore>,
    ) -> Self {
        Self {
            store,
            resolver,
            media,
        }
    }

    /// Match the message against its source's enabled rules and forward on
    /// each hit. One rule's failure never blocks the remaining rules; each
    /// failed attempt is already recorded as a FAILED log entry.
    pub async fn dispatch(&self, message: &InboundMessage) {
        let rules = match self
            .store
            .list_rules_for_source(message.source_account_id)
            .await
        {
            Ok(rules) => rules,
            Err(e) => {
                warn!(
                    source_account_id = message.source_account_id,
                    "Cannot load rules: {e}"
                );
                // Temp attachments must not outlive the dispatch attempt.
                self.discard_transient(message).await;
                return;
            }
        };

        let matched = match_rules(&rules, message.source_account_id, &message.origin_id);
        if matched.is_empty() {
            debug!(
                source_account_id = message.source_account_id,
                origin = %message.origin_id,
                "No rule matched"
            );
            self.discard_transient(message).await;
            return;
        }

        for rule in matched {
            if let Err(e) = self.route(rule, message).await {
                warn!(rule_id = rule.id, "Forwarding failed: {e}");
            }
        }
        self.discard_transient(message).await;
    }

    /// Forward one message under one rule.
    async fn route(&self, rule: &ForwardingRule, message: &InboundMessage) -> Result<()> {
        match rule.mode {
            ForwardMode::Digest => self.enqueue_digest(rule, message).await,
            ForwardMode::Instant => self.deliver_instant(rule, message).await,
        }
    }

    /// Digest path: persist a PENDING entry. Each matching rule gets its own
    /// durable copy of the first attachment, since the scheduler deletes the
    /// file when it marks the entry SENT.
    async fn enqueue_digest(&self, rule: &ForwardingRule, message: &InboundMessage) -> Result<()> {
        let attachment_path = match message.attachments.first() {
            Some(src) => Some(
                self.media
                    .store_durable(src, &message.source_account_id.to_string())
                    .await?,
            ),
            None => None,
        };

        let id = self
            .store
            .insert_log_entry(&NewLogEntry {
                rule_id: rule.id,
                source_account_id: message.source_account_id,
                external_message_id: message.external_id.clone(),
                sender_label: message.sender_label.clone(),
                content_snippet: snippet(&message.text),
                attachment_path,
                status: LogStatus::Pending,
            })
            .await?;

        debug!(rule_id = rule.id, entry_id = id, "Queued for digest");
        Ok(())
    }

    /// Instant path: the entry is written PROCESSING before the send, so a
    /// crash mid-delivery leaves an inspectable record instead of a silent
    /// drop. Exactly one delivery attempt; FAILED is terminal.
    async fn deliver_instant(
        &self,
        rule: &ForwardingRule,
        message: &InboundMessage,
    ) -> Result<()> {
        let entry_id = self
            .store
            .insert_log_entry(&NewLogEntry {
                rule_id: rule.id,
                source_account_id: message.source_account_id,
                external_message_id: message.external_id.clone(),
                sender_label: message.sender_label.clone(),
                content_snippet: snippet(&message.text),
                attachment_path: None,
                status: LogStatus::Processing,
            })
            .await?;

        let outcome = self.attempt_instant(rule, message).await;
        match outcome {
            Ok(()) => {
                self.store
                    .update_log_status(entry_id, LogStatus::Sent)
                    .await?;
                info!(rule_id = rule.id, entry_id, "Forwarded");
                Ok(())
            }
            Err(e) => {
                if let Err(update_err) = self
                    .store
                    .update_log_status(entry_id, LogStatus::Failed)
                    .await
                {
                    warn!(entry_id, "Cannot mark entry failed: {update_err}");
                }
                Err(e.into())
            }
        }
    }

    async fn attempt_instant(
        &self,
        rule: &ForwardingRule,
        message: &InboundMessage,
    ) -> std::result::Result<(), crate::error::DeliveryError> {
        let sink = self.resolver.resolve(rule).await?;
        let outbound = OutboundMessage {
            subject: format!("Forwarded message from {}", message.sender_label),
            body: message.text.clone(),
            html_body: None,
            attachments: message.attachments.clone(),
        };
        sink.deliver(&outbound).await
    }

    /// Drop the message's temp attachments. Digest rules have already taken
    /// durable copies; instant rules have already sent the bytes.
    async fn discard_transient(&self, message: &InboundMessage) {
        for path in &message.attachments {
            self.media.remove(path).await;
        }
    }
}

#[async_trait]
impl InboundHandler for Router {
    async fn handle_push_event(&self, source_account_id: i64, event: PushEvent) {
        let message = InboundMessage {
            source_account_id,
            origin_id: event.origin_id,
            external_id: event.external_id,
            sender_label: event.sender_label,
            text: event.text,
            attachments: event.attachment.into_iter().collect(),
        };
        self.dispatch(&message).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use tempfile::TempDir;

    use chrono::{DateTime, Utc};

    use super::*;
    use crate::config::RelaySettings;
    use crate::error::{DatabaseError, DeliveryError};
    use crate::model::{Account, AccountKind, MessageLogEntry};
    use crate::routing::sink::DeliverySink;
    use crate::store::LibSqlStore;
    use crate::store::traits::{NewAccount, NewRule};

    type DbResult<T> = std::result::Result<T, DatabaseError>;

    pub(crate) struct RecordingSink {
        pub delivered: StdMutex<Vec<OutboundMessage>>,
        pub fail: bool,
    }

    #[async_trait]
    impl DeliverySink for RecordingSink {
        async fn deliver(&self, message: &OutboundMessage) -> std::result::Result<(), DeliveryError> {
            if self.fail {
                return Err(DeliveryError::SendFailed("relay refused".into()));
            }
            self.delivered.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    pub(crate) struct FixedResolver(pub Arc<RecordingSink>);

    #[async_trait]
    impl ResolveSink for FixedResolver {
        async fn resolve(
            &self,
            _rule: &ForwardingRule,
        ) -> std::result::Result<Arc<dyn DeliverySink>, DeliveryError> {
            Ok(Arc::clone(&self.0) as Arc<dyn DeliverySink>)
        }
    }

    /// Store whose every query fails, as when the database file is gone.
    struct UnavailableStore;

    fn down() -> DatabaseError {
        DatabaseError::Pool("database unavailable".into())
    }

    #[async_trait]
    impl Store for UnavailableStore {
        async fn insert_account(&self, _account: &NewAccount) -> DbResult<i64> {
            Err(down())
        }
        async fn get_account(&self, _id: i64) -> DbResult<Option<Account>> {
            Err(down())
        }
        async fn list_active_accounts(&self) -> DbResult<Vec<Account>> {
            Err(down())
        }
        async fn set_account_active(&self, _id: i64, _active: bool) -> DbResult<()> {
            Err(down())
        }
        async fn insert_rule(&self, _rule: &NewRule) -> DbResult<i64> {
            Err(down())
        }
        async fn get_rule(&self, _id: i64) -> DbResult<Option<ForwardingRule>> {
            Err(down())
        }
        async fn list_rules_for_source(&self, _source: i64) -> DbResult<Vec<ForwardingRule>> {
            Err(down())
        }
        async fn list_enabled_rules(&self) -> DbResult<Vec<ForwardingRule>> {
            Err(down())
        }
        async fn set_rule_enabled(&self, _id: i64, _enabled: bool) -> DbResult<()> {
            Err(down())
        }
        async fn set_rule_interval(&self, _id: i64, _interval_minutes: u32) -> DbResult<()> {
            Err(down())
        }
        async fn touch_rule_last_run(&self, _id: i64, _at: DateTime<Utc>) -> DbResult<()> {
            Err(down())
        }
        async fn insert_log_entry(&self, _entry: &NewLogEntry) -> DbResult<i64> {
            Err(down())
        }
        async fn get_log_entry(&self, _id: i64) -> DbResult<Option<MessageLogEntry>> {
            Err(down())
        }
        async fn query_log_entries(
            &self,
            _rule_id: i64,
            _status: LogStatus,
        ) -> DbResult<Vec<MessageLogEntry>> {
            Err(down())
        }
        async fn update_log_status(&self, _id: i64, _status: LogStatus) -> DbResult<()> {
            Err(down())
        }
        async fn relay_settings(&self) -> DbResult<Option<RelaySettings>> {
            Err(down())
        }
        async fn put_relay_settings(&self, _settings: &RelaySettings) -> DbResult<()> {
            Err(down())
        }
    }

    async fn fixture(
        sink_fails: bool,
        mode: ForwardMode,
        filter_set: &[&str],
    ) -> (Arc<dyn Store>, Arc<RecordingSink>, Router, i64, i64, TempDir) {
        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let source_id = store
            .insert_account(&NewAccount {
                name: "source".into(),
                kind: AccountKind::PushSession,
                credentials: serde_json::json!({}),
                active: true,
            })
            .await
            .unwrap();
        let dest_id = store
            .insert_account(&NewAccount {
                name: "dest".into(),
                kind: AccountKind::MailboxSink,
                credentials: serde_json::json!({}),
                active: true,
            })
            .await
            .unwrap();
        let rule_id = store
            .insert_rule(&NewRule {
                name: Some("test rule".into()),
                source_account_id: source_id,
                destination_account_id: dest_id,
                filter_set: filter_set.iter().map(|s| s.to_string()).collect(),
                destination_config: serde_json::json!({"email": "dest@example.com"}),
                mode,
                interval_minutes: 30,
                enabled: true,
            })
            .await
            .unwrap();

        let dir = TempDir::new().unwrap();
        let media = Arc::new(MediaStore::new(
            dir.path().join("media"),
            dir.path().join("tmp"),
        ));
        media.ensure_dirs().await.unwrap();

        let sink = Arc::new(RecordingSink {
            delivered: StdMutex::new(vec![]),
            fail: sink_fails,
        });
        let router = Router::new(
            Arc::clone(&store),
            Arc::new(FixedResolver(Arc::clone(&sink))),
            media,
        );
        (store, sink, router, source_id, rule_id, dir)
    }

    fn inbound(source_account_id: i64, origin: &str, text: &str) -> InboundMessage {
        InboundMessage {
            source_account_id,
            origin_id: origin.into(),
            external_id: "ext-1".into(),
            sender_label: "Alice".into(),
            text: text.into(),
            attachments: vec![],
        }
    }

    #[tokio::test]
    async fn instant_rule_delivers_and_marks_sent() {
        let (store, sink, router, source_id, rule_id, _dir) =
            fixture(false, ForwardMode::Instant, &["-1001"]).await;

        router.dispatch(&inbound(source_id, "-1001", "hello")).await;

        let delivered = sink.delivered.lock().unwrap().clone();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].body, "hello");
        assert_eq!(delivered[0].subject, "Forwarded message from Alice");

        let sent = store
            .query_log_entries(rule_id, LogStatus::Sent)
            .await
            .unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content_snippet, "hello");
    }

    #[tokio::test]
    async fn instant_failure_is_terminal() {
        let (store, sink, router, source_id, rule_id, _dir) =
            fixture(true, ForwardMode::Instant, &["*"]).await;

        router.dispatch(&inbound(source_id, "-1001", "hello")).await;
        assert!(sink.delivered.lock().unwrap().is_empty());

        let failed = store
            .query_log_entries(rule_id, LogStatus::Failed)
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        // No retry: dispatching again creates a fresh entry, never reopens
        // the failed one.
        router.dispatch(&inbound(source_id, "-1001", "again")).await;
        let failed = store
            .query_log_entries(rule_id, LogStatus::Failed)
            .await
            .unwrap();
        assert_eq!(failed.len(), 2);
    }

    #[tokio::test]
    async fn digest_rule_queues_without_delivering() {
        let (store, sink, router, source_id, rule_id, _dir) =
            fixture(false, ForwardMode::Digest, &[]).await;

        router.dispatch(&inbound(source_id, "-1001", "for later")).await;

        assert!(sink.delivered.lock().unwrap().is_empty());
        let pending = store
            .query_log_entries(rule_id, LogStatus::Pending)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sender_label, "Alice");
    }

    #[tokio::test]
    async fn digest_attachment_is_copied_durably() {
        let (store, _sink, router, source_id, rule_id, dir) =
            fixture(false, ForwardMode::Digest, &[]).await;

        let temp_file = dir.path().join("tmp").join("photo.jpg");
        tokio::fs::write(&temp_file, b"jpeg bytes").await.unwrap();

        let mut message = inbound(source_id, "-1001", "see photo");
        message.attachments = vec![temp_file.clone()];
        router.dispatch(&message).await;

        let pending = store
            .query_log_entries(rule_id, LogStatus::Pending)
            .await
            .unwrap();
        let durable = pending[0].attachment_path.clone().unwrap();
        assert!(durable.exists());
        assert!(durable.starts_with(dir.path().join("media")));
        // Temp copy is gone once routing completes.
        assert!(!temp_file.exists());
    }

    #[tokio::test]
    async fn unmatched_origin_writes_nothing() {
        let (store, sink, router, source_id, rule_id, _dir) =
            fixture(false, ForwardMode::Instant, &["-1001"]).await;

        router.dispatch(&inbound(source_id, "-9999", "hello")).await;

        assert!(sink.delivered.lock().unwrap().is_empty());
        for status in [LogStatus::Pending, LogStatus::Processing, LogStatus::Sent] {
            assert!(store.query_log_entries(rule_id, status).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn rules_load_failure_still_discards_temp_attachment() {
        let dir = TempDir::new().unwrap();
        let media = Arc::new(MediaStore::new(
            dir.path().join("media"),
            dir.path().join("tmp"),
        ));
        media.ensure_dirs().await.unwrap();
        let sink = Arc::new(RecordingSink {
            delivered: StdMutex::new(vec![]),
            fail: false,
        });
        let router = Router::new(
            Arc::new(UnavailableStore),
            Arc::new(FixedResolver(Arc::clone(&sink))),
            media,
        );

        let temp_file = dir.path().join("tmp").join("doc.pdf");
        tokio::fs::write(&temp_file, b"pdf bytes").await.unwrap();
        let mut message = inbound(1, "-1001", "see doc");
        message.attachments = vec![temp_file.clone()];

        router.dispatch(&message).await;

        assert!(sink.delivered.lock().unwrap().is_empty());
        assert!(!temp_file.exists());
    }

    #[tokio::test]
    async fn push_events_flow_through_handler() {
        let (store, _sink, router, source_id, rule_id, _dir) =
            fixture(false, ForwardMode::Instant, &["*"]).await;

        router
            .handle_push_event(
                source_id,
                PushEvent {
                    origin_id: "-42".into(),
                    external_id: "m9".into(),
                    sender_label: "Bob".into(),
                    text: "via push".into(),
                    attachment: None,
                },
            )
            .await;

        let sent = store
            .query_log_entries(rule_id, LogStatus::Sent)
            .await
            .unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].external_message_id, "m9");
    }
}
