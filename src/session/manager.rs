//! Session manager — owns at most one live connection per push account.
//!
//! Each live session runs two tasks: a long-poll task feeding an inbound
//! queue, and a drain task handing each event to the routing layer. The
//! queue keeps one account's processing from running inline with another's
//! and gives both tasks a uniform cancellation point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::error::SessionError;
use crate::model::{Account, AccountKind};
use crate::session::transport::{DialogInfo, PushConnection, PushEvent, PushTransport};
use crate::store::Store;

/// Outcome of a login-flow step, shaped for the out-of-scope HTTP layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoginState {
    CodeSent,
    Success,
    #[serde(rename = "2fa_required")]
    TwoFactorRequired,
    Error {
        message: String,
    },
}

/// Receives decoded inbound events from live sessions.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle_push_event(&self, source_account_id: i64, event: PushEvent);
}

struct LiveSession {
    connection: Arc<dyn PushConnection>,
    shutdown: Arc<AtomicBool>,
    poll_handle: JoinHandle<()>,
    drain_handle: JoinHandle<()>,
}

/// Connection waiting on the login flow. Holds the phone between
/// `send_code` and `sign_in`.
struct PendingLogin {
    connection: Arc<dyn PushConnection>,
    phone: Option<String>,
}

/// Manages push-session lifecycles. Explicitly constructed and owned by the
/// bridge service; its maps live and die with the service, never with module
/// load.
pub struct SessionManager {
    store: Arc<dyn Store>,
    transport: Arc<dyn PushTransport>,
    sessions: RwLock<HashMap<i64, LiveSession>>,
    pending: RwLock<HashMap<i64, PendingLogin>>,
    // Per-account start gates: serialize the check-connect-register span so
    // concurrent starts for the same account can't race to two connections.
    starting: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
    handler: OnceLock<Arc<dyn InboundHandler>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn Store>, transport: Arc<dyn PushTransport>) -> Self {
        Self {
            store,
            transport,
            sessions: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            starting: Mutex::new(HashMap::new()),
            handler: OnceLock::new(),
        }
    }

    /// Wire the routing layer in. Must happen before any session starts;
    /// events arriving without a handler are dropped with a warning.
    pub fn set_inbound_handler(&self, handler: Arc<dyn InboundHandler>) {
        let _ = self.handler.set(handler);
    }

    /// Start a push session for the account. Idempotent: an account with a
    /// live connection gets that handle back, no second connection is made.
    /// Concurrent callers for the same account share one connect.
    pub async fn start_account(
        &self,
        account: &Account,
    ) -> Result<Arc<dyn PushConnection>, SessionError> {
        let gate = {
            let mut starting = self.starting.lock().await;
            Arc::clone(starting.entry(account.id).or_default())
        };
        let _guard = gate.lock().await;

        if let Some(existing) = self.connection(account.id).await {
            debug!(account_id = account.id, "Session already live");
            return Ok(existing);
        }

        let connection = self.transport.connect(account).await?;

        if !connection.is_authorized().await? {
            info!(account_id = account.id, "Account not authorized, login flow required");
            self.pending.write().await.insert(
                account.id,
                PendingLogin {
                    connection,
                    phone: None,
                },
            );
            return Err(SessionError::AuthRequired {
                account_id: account.id,
            });
        }

        let live = self.register_live(account.id, connection).await;
        info!(account_id = account.id, "Push session started");
        Ok(live)
    }

    /// Start every active push-kind account, isolating failures: one
    /// account's ConnectFailed never prevents the others from starting.
    /// Returns the number of live sessions after the sweep.
    pub async fn start_all_active(&self) -> usize {
        let accounts = match self.store.list_active_accounts().await {
            Ok(accounts) => accounts,
            Err(e) => {
                error!("Failed to list active accounts: {e}");
                return self.live_count().await;
            }
        };

        for account in accounts
            .iter()
            .filter(|a| a.kind == AccountKind::PushSession)
        {
            if let Err(e) = self.start_account(account).await {
                warn!(account_id = account.id, "Session start skipped: {e}");
            }
        }

        let count = self.live_count().await;
        info!(sessions = count, "Started all active push accounts");
        count
    }

    /// Live connection handle for an account, if any.
    pub async fn connection(&self, account_id: i64) -> Option<Arc<dyn PushConnection>> {
        self.sessions
            .read()
            .await
            .get(&account_id)
            .map(|s| Arc::clone(&s.connection))
    }

    pub async fn live_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Stop one account's session, tolerating disconnect errors.
    pub async fn stop_account(&self, account_id: i64) {
        self.pending.write().await.remove(&account_id);
        let Some(session) = self.sessions.write().await.remove(&account_id) else {
            return;
        };
        session.shutdown.store(true, Ordering::Relaxed);
        if let Err(e) = session.connection.disconnect().await {
            warn!(account_id, "Disconnect error (ignored): {e}");
        }
        session.poll_handle.abort();
        session.drain_handle.abort();
        info!(account_id, "Push session stopped");
    }

    /// Stop every session and drop pending logins.
    pub async fn stop_all(&self) {
        let ids: Vec<i64> = self.sessions.read().await.keys().copied().collect();
        for id in ids {
            self.stop_account(id).await;
        }
        self.pending.write().await.clear();
    }

    // ── Login flow ──────────────────────────────────────────────────

    /// Request a login code. Opens a connection first if the account has
    /// neither a live session nor a pending login.
    pub async fn send_code(&self, account_id: i64, phone: &str) -> LoginState {
        let connection = match self.login_connection(account_id).await {
            Ok(conn) => conn,
            Err(e) => return LoginState::Error { message: e.to_string() },
        };

        match connection.send_code(phone).await {
            Ok(()) => {
                if let Some(pending) = self.pending.write().await.get_mut(&account_id) {
                    pending.phone = Some(phone.to_string());
                }
                LoginState::CodeSent
            }
            Err(e) => LoginState::Error { message: e.to_string() },
        }
    }

    /// Complete sign-in with the received code (and 2FA password if needed).
    /// On success the account is marked active and its session goes live.
    pub async fn sign_in(
        &self,
        account_id: i64,
        code: &str,
        password: Option<&str>,
    ) -> LoginState {
        let (connection, phone) = {
            let pending = self.pending.read().await;
            match pending.get(&account_id) {
                Some(p) => (Arc::clone(&p.connection), p.phone.clone()),
                None => {
                    return LoginState::Error {
                        message: format!("No login in progress for account {account_id}"),
                    };
                }
            }
        };
        let phone = phone.unwrap_or_default();

        match connection.sign_in(&phone, code, password).await {
            Ok(()) => {
                if let Err(e) = self.store.set_account_active(account_id, true).await {
                    warn!(account_id, "Failed to mark account active: {e}");
                }
                self.pending.write().await.remove(&account_id);
                self.register_live(account_id, connection).await;
                info!(account_id, "Sign-in complete, session live");
                LoginState::Success
            }
            Err(SessionError::TwoFactorRequired) => LoginState::TwoFactorRequired,
            Err(e) => LoginState::Error { message: e.to_string() },
        }
    }

    /// Invalidate the account's authorization and tear the session down.
    pub async fn logout(&self, account_id: i64) -> LoginState {
        let Some(connection) = self.connection(account_id).await else {
            return LoginState::Error {
                message: format!("Account {account_id} is not connected"),
            };
        };
        match connection.logout().await {
            Ok(()) => {
                self.stop_account(account_id).await;
                LoginState::Success
            }
            Err(e) => LoginState::Error { message: e.to_string() },
        }
    }

    /// Dialogs visible to a live session (for the out-of-scope UI).
    pub async fn list_dialogs(&self, account_id: i64) -> Result<Vec<DialogInfo>, SessionError> {
        let connection = self
            .connection(account_id)
            .await
            .ok_or(SessionError::NotConnected { account_id })?;
        connection.list_dialogs().await
    }

    // ── Internals ───────────────────────────────────────────────────

    /// Connection to run the login flow over: live, pending, or fresh.
    async fn login_connection(
        &self,
        account_id: i64,
    ) -> Result<Arc<dyn PushConnection>, SessionError> {
        if let Some(conn) = self.connection(account_id).await {
            return Ok(conn);
        }
        if let Some(pending) = self.pending.read().await.get(&account_id) {
            return Ok(Arc::clone(&pending.connection));
        }

        let account = self
            .store
            .get_account(account_id)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?
            .ok_or(SessionError::NotConnected { account_id })?;
        let connection = self.transport.connect(&account).await?;
        self.pending.write().await.insert(
            account_id,
            PendingLogin {
                connection: Arc::clone(&connection),
                phone: None,
            },
        );
        Ok(connection)
    }

    /// Spawn the poll + drain task pair and track the session. Never
    /// replaces a session that is already live: the extra connection is
    /// disconnected and the surviving handle returned.
    async fn register_live(
        &self,
        account_id: i64,
        connection: Arc<dyn PushConnection>,
    ) -> Arc<dyn PushConnection> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&account_id) {
            warn!(account_id, "Session already live, dropping the extra connection");
            let survivor = Arc::clone(&existing.connection);
            drop(sessions);
            if let Err(e) = connection.disconnect().await {
                debug!(account_id, "Extra connection disconnect failed: {e}");
            }
            return survivor;
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<PushEvent>(256);

        // Long-poll task: transport -> queue.
        let poll_conn = Arc::clone(&connection);
        let poll_shutdown = Arc::clone(&shutdown);
        let poll_handle = tokio::spawn(async move {
            loop {
                if poll_shutdown.load(Ordering::Relaxed) {
                    debug!(account_id, "Session poll loop shutting down");
                    return;
                }
                match poll_conn.next_events().await {
                    Ok(events) => {
                        for event in events {
                            if tx.send(event).await.is_err() {
                                debug!(account_id, "Inbound queue closed");
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(account_id, "Event poll failed: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    }
                }
            }
        });

        // Drain task: queue -> routing. Runs per-account so one account's
        // slow handler never blocks another account's events.
        let handler = self.handler.get().cloned();
        let drain_handle = tokio::spawn(async move {
            let mut stream = ReceiverStream::new(rx);
            while let Some(event) = stream.next().await {
                match handler {
                    Some(ref h) => h.handle_push_event(account_id, event).await,
                    None => warn!(account_id, "Inbound event dropped: no handler wired"),
                }
            }
        });

        sessions.insert(
            account_id,
            LiveSession {
                connection: Arc::clone(&connection),
                shutdown,
                poll_handle,
                drain_handle,
            },
        );
        connection
    }
}
