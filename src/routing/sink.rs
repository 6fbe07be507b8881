//! Delivery sinks — the outbound side of a forwarding rule.
//!
//! `DeliverySink` is the seam between routing logic and real transports, so
//! the router and digest scheduler can be tested with a recording sink.
//! Production resolution goes through `KindSinkResolver`, which picks a sink
//! implementation from the destination account's kind.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::{debug, info};

use crate::config::RelaySettings;
use crate::error::DeliveryError;
use crate::model::{AccountKind, ForwardingRule};
use crate::session::{PushConnection, SessionManager};
use crate::store::Store;

/// A fully composed outbound message, transport-agnostic.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub subject: String,
    pub body: String,
    pub html_body: Option<String>,
    pub attachments: Vec<PathBuf>,
}

#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, message: &OutboundMessage) -> Result<(), DeliveryError>;
}

/// Resolves a rule's destination into a live sink at delivery time, so a
/// sink is never held across the window where a session could drop or relay
/// settings could change.
#[async_trait]
pub trait ResolveSink: Send + Sync {
    async fn resolve(&self, rule: &ForwardingRule) -> Result<Arc<dyn DeliverySink>, DeliveryError>;
}

// ── SMTP ────────────────────────────────────────────────────────────

/// Sends over the operator-configured SMTP relay.
pub struct MailSink {
    settings: RelaySettings,
    to: String,
}

impl MailSink {
    pub fn new(settings: RelaySettings, to: impl Into<String>) -> Self {
        Self {
            settings,
            to: to.into(),
        }
    }
}

#[async_trait]
impl DeliverySink for MailSink {
    async fn deliver(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        // Read attachment bytes here; the blocking send must not touch
        // async IO.
        let mut attachments = Vec::with_capacity(message.attachments.len());
        for path in &message.attachments {
            let bytes = tokio::fs::read(path).await.map_err(|e| {
                DeliveryError::BuildFailed(format!("Cannot read {}: {e}", path.display()))
            })?;
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("attachment")
                .to_string();
            attachments.push((name, bytes));
        }

        let settings = self.settings.clone();
        let to = self.to.clone();
        let message = message.clone();

        let sent = tokio::task::spawn_blocking(move || send_mail(&settings, &to, &message, attachments))
            .await
            .map_err(|e| DeliveryError::SendFailed(format!("Send task panicked: {e}")))?;
        sent?;

        info!(to = %self.to, "Mail delivered");
        Ok(())
    }
}

/// Build and send one email over SMTP (blocking, run in spawn_blocking).
fn send_mail(
    settings: &RelaySettings,
    to: &str,
    message: &OutboundMessage,
    attachments: Vec<(String, Vec<u8>)>,
) -> Result<(), DeliveryError> {
    let creds = Credentials::new(
        settings.smtp_username.clone(),
        settings.smtp_password.expose_secret().to_string(),
    );

    let transport = SmtpTransport::relay(&settings.smtp_host)
        .map_err(|e| DeliveryError::SendFailed(format!("SMTP relay error: {e}")))?
        .port(settings.smtp_port)
        .credentials(creds)
        .build();

    let mut multipart = match &message.html_body {
        Some(html) => MultiPart::mixed().multipart(
            MultiPart::alternative()
                .singlepart(SinglePart::plain(message.body.clone()))
                .singlepart(SinglePart::html(html.clone())),
        ),
        None => MultiPart::mixed().singlepart(SinglePart::plain(message.body.clone())),
    };
    for (name, bytes) in attachments {
        multipart = multipart.singlepart(
            Attachment::new(name).body(bytes, ContentType::parse("application/octet-stream")
                .map_err(|e| DeliveryError::BuildFailed(format!("Content type: {e}")))?),
        );
    }

    let email = Message::builder()
        .from(settings
            .smtp_username
            .parse()
            .map_err(|e| DeliveryError::BuildFailed(format!("Invalid from address: {e}")))?)
        .to(to
            .parse()
            .map_err(|e| DeliveryError::BuildFailed(format!("Invalid to address: {e}")))?)
        .subject(&message.subject)
        .multipart(multipart)
        .map_err(|e| DeliveryError::BuildFailed(format!("Failed to build email: {e}")))?;

    transport
        .send(&email)
        .map_err(|e| DeliveryError::SendFailed(format!("SMTP send failed: {e}")))?;
    Ok(())
}

// ── Push ────────────────────────────────────────────────────────────

/// Sends into a chat through a live push connection.
pub struct PushSink {
    connection: Arc<dyn PushConnection>,
    chat_id: String,
}

impl PushSink {
    pub fn new(connection: Arc<dyn PushConnection>, chat_id: impl Into<String>) -> Self {
        Self {
            connection,
            chat_id: chat_id.into(),
        }
    }
}

#[async_trait]
impl DeliverySink for PushSink {
    async fn deliver(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        if !message.body.is_empty() {
            self.connection
                .send_message(&self.chat_id, &message.body)
                .await?;
        }
        for path in &message.attachments {
            self.connection
                .send_file(&self.chat_id, path, None)
                .await?;
        }
        debug!(chat_id = %self.chat_id, "Push delivery complete");
        Ok(())
    }
}

// ── Production resolver ─────────────────────────────────────────────

/// Picks a sink from the destination account's kind: mailbox sinks get a
/// `MailSink` over the stored relay settings, push sessions get a
/// `PushSink` over their live connection.
pub struct KindSinkResolver {
    store: Arc<dyn Store>,
    sessions: Arc<SessionManager>,
}

impl KindSinkResolver {
    pub fn new(store: Arc<dyn Store>, sessions: Arc<SessionManager>) -> Self {
        Self { store, sessions }
    }
}

#[async_trait]
impl ResolveSink for KindSinkResolver {
    async fn resolve(
        &self,
        rule: &ForwardingRule,
    ) -> Result<Arc<dyn DeliverySink>, DeliveryError> {
        let account_id = rule.destination_account_id;
        let account = self
            .store
            .get_account(account_id)
            .await
            .map_err(|e| DeliveryError::SinkUnavailable {
                account_id,
                reason: e.to_string(),
            })?
            .ok_or_else(|| DeliveryError::SinkUnavailable {
                account_id,
                reason: "account not found".into(),
            })?;

        match account.kind {
            AccountKind::MailboxSink => {
                let settings = self
                    .store
                    .relay_settings()
                    .await
                    .map_err(|e| DeliveryError::SinkUnavailable {
                        account_id,
                        reason: e.to_string(),
                    })?
                    .ok_or_else(|| DeliveryError::SinkUnavailable {
                        account_id,
                        reason: "mail relay not configured".into(),
                    })?;
                let to = rule
                    .destination_config
                    .get("email")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| DeliveryError::DestinationMissing {
                        key: "email".into(),
                    })?;
                Ok(Arc::new(MailSink::new(settings, to)))
            }
            AccountKind::PushSession => {
                let connection = self.sessions.connection(account_id).await.ok_or_else(|| {
                    DeliveryError::SinkUnavailable {
                        account_id,
                        reason: "session not connected".into(),
                    }
                })?;
                let chat_id = match rule.destination_config.get("chat_id") {
                    Some(serde_json::Value::String(s)) => s.clone(),
                    Some(serde_json::Value::Number(n)) => n.to_string(),
                    _ => {
                        return Err(DeliveryError::DestinationMissing {
                            key: "chat_id".into(),
                        });
                    }
                };
                Ok(Arc::new(PushSink::new(connection, chat_id)))
            }
            AccountKind::MailboxSource => Err(DeliveryError::SinkUnavailable {
                account_id,
                reason: "mailbox sources cannot receive deliveries".into(),
            }),
        }
    }
}
