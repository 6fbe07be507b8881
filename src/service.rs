//! Top-level bridge service — wires the store, session manager, router,
//! mailbox poller, and digest scheduler together and owns their lifecycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::BridgeConfig;
use crate::digest::DigestScheduler;
use crate::error::{Result, SessionError};
use crate::mailbox::spawn_mailbox_poller;
use crate::media::MediaStore;
use crate::routing::{KindSinkResolver, Router};
use crate::session::{DialogInfo, LoginState, SessionManager};
use crate::store::Store;

/// Point-in-time view of what is running, for logs and the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub live_push_sessions: usize,
    pub digest_jobs: usize,
    pub poller_running: bool,
    pub scheduler_running: bool,
}

pub struct BridgeService {
    store: Arc<dyn Store>,
    config: BridgeConfig,
    media: Arc<MediaStore>,
    sessions: Arc<SessionManager>,
    scheduler: Arc<DigestScheduler>,
    poller: Mutex<Option<(JoinHandle<()>, Arc<AtomicBool>)>>,
    router: Arc<Router>,
}

impl BridgeService {
    /// Wire all components. Nothing runs until `start`.
    pub fn new(
        config: BridgeConfig,
        store: Arc<dyn Store>,
        transport: Arc<dyn crate::session::PushTransport>,
    ) -> Self {
        let media = Arc::new(MediaStore::new(
            config.media_dir.clone(),
            config.temp_dir.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(Arc::clone(&store), transport));
        let resolver = Arc::new(KindSinkResolver::new(
            Arc::clone(&store),
            Arc::clone(&sessions),
        ));
        let router = Arc::new(Router::new(
            Arc::clone(&store),
            resolver.clone() as Arc<dyn crate::routing::ResolveSink>,
            Arc::clone(&media),
        ));
        sessions.set_inbound_handler(Arc::clone(&router) as Arc<dyn crate::session::InboundHandler>);
        let scheduler = Arc::new(DigestScheduler::new(
            Arc::clone(&store),
            resolver,
            Arc::clone(&media),
        ));

        Self {
            store,
            config,
            media,
            sessions,
            scheduler,
            poller: Mutex::new(None),
            router,
        }
    }

    /// Bring everything up: push sessions, digest jobs, mailbox poller.
    pub async fn start(&self) -> Result<()> {
        self.media
            .ensure_dirs()
            .await
            .map_err(crate::error::ConfigError::Io)?;

        let sessions = self.sessions.start_all_active().await;
        let jobs = self.scheduler.sync_all().await;

        let mut poller = self.poller.lock().await;
        if poller.is_none() {
            *poller = Some(spawn_mailbox_poller(
                Arc::clone(&self.store),
                Arc::clone(&self.router),
                Arc::clone(&self.media),
                self.config.poll_interval,
            ));
        }

        info!(sessions, digest_jobs = jobs, "Bridge service started");
        Ok(())
    }

    /// Stop everything, in the reverse order of start.
    pub async fn stop(&self) {
        if let Some((handle, shutdown)) = self.poller.lock().await.take() {
            shutdown.store(true, Ordering::Relaxed);
            handle.abort();
        }
        self.scheduler.stop().await;
        self.sessions.stop_all().await;
        info!("Bridge service stopped");
    }

    pub async fn health(&self) -> Health {
        Health {
            live_push_sessions: self.sessions.live_count().await,
            digest_jobs: self.scheduler.job_count().await,
            poller_running: self.poller.lock().await.is_some(),
            scheduler_running: self.scheduler.is_running(),
        }
    }

    // ── Collaborator surface ────────────────────────────────────────

    /// Re-reconcile all digest jobs after bulk rule changes.
    pub async fn resync_digests(&self) -> usize {
        self.scheduler.sync_all().await
    }

    /// Re-reconcile one rule's digest job after it was edited.
    pub async fn resync_digest_rule(&self, rule_id: i64) {
        self.scheduler.resync(rule_id).await;
    }

    pub async fn send_code(&self, account_id: i64, phone: &str) -> LoginState {
        self.sessions.send_code(account_id, phone).await
    }

    pub async fn sign_in(
        &self,
        account_id: i64,
        code: &str,
        password: Option<&str>,
    ) -> LoginState {
        self.sessions.sign_in(account_id, code, password).await
    }

    pub async fn logout(&self, account_id: i64) -> LoginState {
        self.sessions.logout(account_id).await
    }

    pub async fn list_dialogs(
        &self,
        account_id: i64,
    ) -> std::result::Result<Vec<DialogInfo>, SessionError> {
        self.sessions.list_dialogs(account_id).await
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }
}
