//! Background poller for mailbox source accounts.
//!
//! One task covers every active mailbox source; accounts are scanned
//! serially inside a tick so a slow server delays, but never starves, the
//! others. Messages are marked \Seen only after the routing pass for the
//! batch finishes, and marked regardless of per-rule outcomes: a failed
//! forward is a FAILED log entry, not a redelivery.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::MailboxError;
use crate::mailbox::imap::{self, FetchedMail, MailboxCredentials};
use crate::media::MediaStore;
use crate::model::{Account, AccountKind, InboundMessage};
use crate::routing::Router;
use crate::store::Store;

/// Blocking mailbox access behind the poll loop. The sweep logic only
/// sees this surface, so tests can drive it with scripted mailboxes.
trait FetchMailbox: Send + Sync {
    fn fetch_unseen(&self, creds: &MailboxCredentials) -> Result<Vec<FetchedMail>, MailboxError>;
    fn mark_seen(&self, creds: &MailboxCredentials, uids: &[String]) -> Result<(), MailboxError>;
}

struct ImapFetcher;

impl FetchMailbox for ImapFetcher {
    fn fetch_unseen(&self, creds: &MailboxCredentials) -> Result<Vec<FetchedMail>, MailboxError> {
        imap::fetch_unseen(creds)
    }

    fn mark_seen(&self, creds: &MailboxCredentials, uids: &[String]) -> Result<(), MailboxError> {
        imap::mark_seen(creds, uids)
    }
}

/// Spawn the mailbox poll loop. Returns the task handle and a shutdown
/// flag; set the flag to stop at the next tick.
pub fn spawn_mailbox_poller(
    store: Arc<dyn Store>,
    router: Arc<Router>,
    media: Arc<MediaStore>,
    poll_interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    let fetcher: Arc<dyn FetchMailbox> = Arc::new(ImapFetcher);

    let handle = tokio::spawn(async move {
        info!(
            "Mailbox poller started, polling every {}s",
            poll_interval.as_secs()
        );

        let mut tick = tokio::time::interval(poll_interval);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Mailbox poller shutting down");
                return;
            }

            poll_once(&store, &router, &media, &fetcher).await;
        }
    });

    (handle, shutdown_flag)
}

/// Run one poll cycle over every active mailbox source account. A bad
/// account (unreachable host, rejected login, garbage credentials) is
/// logged and skipped; the sweep continues.
async fn poll_once(
    store: &Arc<dyn Store>,
    router: &Arc<Router>,
    media: &Arc<MediaStore>,
    fetcher: &Arc<dyn FetchMailbox>,
) {
    let accounts = match store.list_active_accounts().await {
        Ok(accounts) => accounts,
        Err(e) => {
            error!("Cannot list mailbox accounts: {e}");
            return;
        }
    };

    for account in accounts
        .iter()
        .filter(|a| a.kind == AccountKind::MailboxSource)
    {
        if let Err(e) = scan_account(account, router, media, fetcher).await {
            warn!(account_id = account.id, "Mailbox scan failed: {e}");
        }
    }
}

async fn scan_account(
    account: &Account,
    router: &Arc<Router>,
    media: &Arc<MediaStore>,
    fetcher: &Arc<dyn FetchMailbox>,
) -> crate::error::Result<()> {
    let creds = MailboxCredentials::from_account(account)?;

    let fetch_creds = creds.clone();
    let fetch_with = Arc::clone(fetcher);
    let fetched = tokio::task::spawn_blocking(move || fetch_with.fetch_unseen(&fetch_creds))
        .await
        .map_err(|e| MailboxError::Protocol(format!("fetch task panicked: {e}")))??;

    if fetched.is_empty() {
        return Ok(());
    }
    debug!(
        account_id = account.id,
        count = fetched.len(),
        "Fetched unseen messages"
    );

    let mut seen_uids = Vec::with_capacity(fetched.len());
    for mail in fetched {
        seen_uids.push(mail.uid.clone());

        // Attachment bytes land in the temp area; routing decides which
        // get a durable copy.
        let source_tag = account.id.to_string();
        let mut attachments = Vec::with_capacity(mail.attachments.len());
        for (name, bytes) in &mail.attachments {
            let path = media.temp_path(&source_tag, name);
            match tokio::fs::write(&path, bytes).await {
                Ok(()) => attachments.push(path),
                Err(e) => warn!(
                    account_id = account.id,
                    name = %name,
                    "Cannot stage attachment: {e}"
                ),
            }
        }

        let message = InboundMessage {
            source_account_id: account.id,
            origin_id: mail.sender.clone(),
            external_id: mail.external_id,
            sender_label: mail.sender_label,
            text: format!("Subject: {}\n\n{}", mail.subject, mail.body),
            attachments,
        };
        router.dispatch(&message).await;
    }

    let mark_creds = creds;
    let mark_with = Arc::clone(fetcher);
    tokio::task::spawn_blocking(move || mark_with.mark_seen(&mark_creds, &seen_uids))
        .await
        .map_err(|e| MailboxError::Protocol(format!("mark task panicked: {e}")))??;

    Ok(())
}
