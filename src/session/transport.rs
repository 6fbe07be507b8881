//! Push-messaging transport — opaque capability behind a trait.
//!
//! The engine never speaks the push protocol itself; it consumes a
//! `PushTransport` that can open per-account connections, drive the login
//! flow, long-poll inbound events, and send outbound messages/files. The
//! concrete `HttpPushTransport` talks to an HTTP gateway via long-polling.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use secrecy::ExposeSecret;

use crate::config::RelaySettings;
use crate::error::{DeliveryError, SessionError};
use crate::media::MediaStore;
use crate::model::Account;

/// One inbound event from a live push session.
#[derive(Debug, Clone)]
pub struct PushEvent {
    /// Chat/channel identifier the message arrived in. Compared against rule
    /// filter sets as a string, format-preserving.
    pub origin_id: String,
    /// Transport-native message identifier.
    pub external_id: String,
    /// Display name of the message sender.
    pub sender_label: String,
    pub text: String,
    /// Media downloaded by the transport into the temp area, if any.
    pub attachment: Option<PathBuf>,
}

/// A dialog (chat/channel) visible to an authorized session. Consumed by the
/// out-of-scope UI when building filter sets.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct DialogInfo {
    pub origin_id: String,
    pub name: String,
    pub kind: String,
}

/// Factory for per-account push connections.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Open a connection for the account. Connecting succeeds even for
    /// unauthorized accounts — authorization is checked separately so the
    /// login flow can run over the same connection.
    async fn connect(&self, account: &Account) -> Result<Arc<dyn PushConnection>, SessionError>;
}

/// A live (possibly not yet authorized) push connection.
#[async_trait]
pub trait PushConnection: Send + Sync {
    async fn is_authorized(&self) -> Result<bool, SessionError>;

    /// Request a login code for the phone number.
    async fn send_code(&self, phone: &str) -> Result<(), SessionError>;

    /// Complete sign-in. Returns `SessionError::TwoFactorRequired` when the
    /// account has a 2FA password and none was given.
    async fn sign_in(
        &self,
        phone: &str,
        code: &str,
        password: Option<&str>,
    ) -> Result<(), SessionError>;

    /// Long-poll the next batch of inbound events. An empty batch is a
    /// normal poll timeout, not an error.
    async fn next_events(&self) -> Result<Vec<PushEvent>, SessionError>;

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), DeliveryError>;

    async fn send_file(
        &self,
        chat_id: &str,
        path: &Path,
        caption: Option<&str>,
    ) -> Result<(), DeliveryError>;

    async fn list_dialogs(&self) -> Result<Vec<DialogInfo>, SessionError>;

    /// Invalidate the stored authorization.
    async fn logout(&self) -> Result<(), SessionError>;

    /// Close the connection, keeping the authorization.
    async fn disconnect(&self) -> Result<(), SessionError>;
}

// ── HTTP gateway implementation ─────────────────────────────────────

/// Push transport backed by an HTTP gateway, one long-poll loop per session.
pub struct HttpPushTransport {
    base_url: String,
    client: reqwest::Client,
    poll_timeout: Duration,
    media: MediaStore,
    api_id: Option<String>,
    api_hash: Option<String>,
}

impl HttpPushTransport {
    pub fn new(base_url: String, poll_timeout: Duration, media: MediaStore) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
            poll_timeout,
            media,
            api_id: None,
            api_hash: None,
        }
    }

    /// Attach the operator's push app credentials from the settings store.
    pub fn with_app_credentials(mut self, settings: &RelaySettings) -> Self {
        self.api_id = settings.push_api_id.clone();
        self.api_hash = settings
            .push_api_hash
            .as_ref()
            .map(|s| s.expose_secret().to_string());
        self
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    async fn connect(&self, account: &Account) -> Result<Arc<dyn PushConnection>, SessionError> {
        let session_token = account
            .credentials
            .get("session_token")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let conn = HttpPushConnection {
            account_id: account.id,
            base_url: self.base_url.clone(),
            client: self.client.clone(),
            poll_timeout: self.poll_timeout,
            media: self.media.clone(),
            session_token,
            api_id: self.api_id.clone(),
            api_hash: self.api_hash.clone(),
            offset: AtomicI64::new(0),
        };

        // A connect-time probe so DNS/transport failures surface here, not
        // on the first poll.
        conn.call("status", serde_json::json!({}))
            .await
            .map_err(|e| SessionError::ConnectFailed {
                account_id: account.id,
                reason: e.to_string(),
            })?;

        Ok(Arc::new(conn))
    }
}

struct HttpPushConnection {
    account_id: i64,
    base_url: String,
    client: reqwest::Client,
    poll_timeout: Duration,
    media: MediaStore,
    session_token: String,
    api_id: Option<String>,
    api_hash: Option<String>,
    /// Event cursor, advanced past each delivered batch.
    offset: AtomicI64,
}

impl HttpPushConnection {
    fn url(&self, method: &str) -> String {
        format!(
            "{}/sessions/{}/{method}",
            self.base_url.trim_end_matches('/'),
            self.account_id
        )
    }

    async fn call(
        &self,
        method: &str,
        mut body: serde_json::Value,
    ) -> Result<serde_json::Value, SessionError> {
        body["session_token"] = serde_json::Value::String(self.session_token.clone());
        if let Some(ref id) = self.api_id {
            body["api_id"] = serde_json::Value::String(id.clone());
        }
        if let Some(ref hash) = self.api_hash {
            body["api_hash"] = serde_json::Value::String(hash.clone());
        }

        let resp = self
            .client
            .post(self.url(method))
            .json(&body)
            .send()
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        let status = resp.status();
        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| SessionError::Transport(format!("bad response: {e}")))?;

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SessionError::AuthRequired {
                account_id: self.account_id,
            });
        }
        if !status.is_success() {
            let message = data
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("gateway error")
                .to_string();
            if message.contains("2fa") || message.contains("password") {
                return Err(SessionError::TwoFactorRequired);
            }
            return Err(SessionError::Transport(message));
        }
        Ok(data)
    }

    /// Download a media reference into the temp area.
    async fn fetch_media(&self, media_url: &str, name: &str) -> Option<PathBuf> {
        let resp = match self.client.get(media_url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                tracing::warn!(status = %r.status(), "Media download refused");
                return None;
            }
            Err(e) => {
                tracing::warn!("Media download failed: {e}");
                return None;
            }
        };
        let bytes = resp.bytes().await.ok()?;
        let path = self
            .media
            .temp_path(&format!("acct{}", self.account_id), name);
        if let Err(e) = tokio::fs::write(&path, &bytes).await {
            tracing::warn!(path = %path.display(), "Failed to save media: {e}");
            return None;
        }
        Some(path)
    }
}

#[async_trait]
impl PushConnection for HttpPushConnection {
    async fn is_authorized(&self) -> Result<bool, SessionError> {
        let data = self.call("status", serde_json::json!({})).await?;
        Ok(data
            .get("authorized")
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    async fn send_code(&self, phone: &str) -> Result<(), SessionError> {
        self.call("sendCode", serde_json::json!({ "phone": phone }))
            .await?;
        Ok(())
    }

    async fn sign_in(
        &self,
        phone: &str,
        code: &str,
        password: Option<&str>,
    ) -> Result<(), SessionError> {
        let mut body = serde_json::json!({ "phone": phone, "code": code });
        if let Some(pw) = password {
            body["password"] = serde_json::Value::String(pw.to_string());
        }
        self.call("signIn", body).await?;
        Ok(())
    }

    async fn next_events(&self) -> Result<Vec<PushEvent>, SessionError> {
        let offset = self.offset.load(Ordering::Relaxed);
        let data = self
            .call(
                "events",
                serde_json::json!({
                    "offset": offset,
                    "timeout_secs": self.poll_timeout.as_secs(),
                }),
            )
            .await?;

        let mut events = Vec::new();
        if let Some(items) = data.get("events").and_then(|v| v.as_array()) {
            for item in items {
                if let Some(cursor) = item.get("cursor").and_then(|v| v.as_i64()) {
                    self.offset.store(cursor + 1, Ordering::Relaxed);
                }
                let Some(origin_id) = item.get("chat_id").and_then(|v| v.as_str()) else {
                    continue;
                };
                let external_id = item
                    .get("message_id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("push-{}", uuid::Uuid::new_v4()));
                let sender_label = item
                    .get("sender_name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Unknown")
                    .to_string();
                let text = item
                    .get("text")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();

                let attachment = match (
                    item.get("media_url").and_then(|v| v.as_str()),
                    item.get("media_name").and_then(|v| v.as_str()),
                ) {
                    (Some(url), name) => {
                        self.fetch_media(url, name.unwrap_or("attachment")).await
                    }
                    _ => None,
                };

                events.push(PushEvent {
                    origin_id: origin_id.to_string(),
                    external_id,
                    sender_label,
                    text,
                    attachment,
                });
            }
        }
        Ok(events)
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), DeliveryError> {
        self.call(
            "sendMessage",
            serde_json::json!({ "chat_id": chat_id, "text": text }),
        )
        .await
        .map_err(|e| DeliveryError::SendFailed(e.to_string()))?;
        Ok(())
    }

    async fn send_file(
        &self,
        chat_id: &str,
        path: &Path,
        caption: Option<&str>,
    ) -> Result<(), DeliveryError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| DeliveryError::BuildFailed(format!("read {}: {e}", path.display())))?;

        let mut form = Form::new()
            .text("chat_id", chat_id.to_string())
            .text("session_token", self.session_token.clone())
            .part("file", Part::bytes(bytes).file_name(file_name));
        if let Some(cap) = caption {
            form = form.text("caption", cap.to_string());
        }

        let resp = self
            .client
            .post(self.url("sendFile"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| DeliveryError::SendFailed(e.to_string()))?;

        if !resp.status().is_success() {
            let err = resp.text().await.unwrap_or_default();
            return Err(DeliveryError::SendFailed(format!("sendFile failed: {err}")));
        }
        Ok(())
    }

    async fn list_dialogs(&self) -> Result<Vec<DialogInfo>, SessionError> {
        let data = self.call("dialogs", serde_json::json!({})).await?;
        let dialogs = data
            .get("dialogs")
            .cloned()
            .unwrap_or(serde_json::Value::Array(vec![]));
        serde_json::from_value(dialogs)
            .map_err(|e| SessionError::Transport(format!("bad dialogs payload: {e}")))
    }

    async fn logout(&self) -> Result<(), SessionError> {
        self.call("logout", serde_json::json!({})).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        // The gateway holds no per-connection server state beyond the event
        // cursor; dropping the client is enough.
        Ok(())
    }
}
