//! Digest scheduler — one timer task per enabled digest rule.
//!
//! Jobs are reconciled against the rule table rather than mutated ad hoc:
//! `sync_all` compares the running job set with the rules that currently
//! want one and starts, replaces, or stops jobs to match. Collaborators
//! that edit rules only need to trigger a resync afterwards.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::digest::compose::{compose_digest_html, compose_digest_text, digest_subject};
use crate::error::Result;
use crate::media::MediaStore;
use crate::model::LogStatus;
use crate::routing::sink::{OutboundMessage, ResolveSink};
use crate::store::Store;

struct DigestJob {
    interval_minutes: u32,
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct DigestScheduler {
    store: Arc<dyn Store>,
    resolver: Arc<dyn ResolveSink>,
    media: Arc<MediaStore>,
    jobs: RwLock<HashMap<i64, DigestJob>>,
    running: AtomicBool,
}

impl DigestScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        resolver: Arc<dyn ResolveSink>,
        media: Arc<MediaStore>,
    ) -> Self {
        Self {
            store,
            resolver,
            media,
            jobs: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Reconcile running jobs with the rules that currently want one.
    /// Safe to call at any time; returns the job count afterwards.
    pub async fn sync_all(self: &Arc<Self>) -> usize {
        let rules = match self.store.list_enabled_rules().await {
            Ok(rules) => rules,
            Err(e) => {
                error!("Cannot list rules for digest sync: {e}");
                return self.job_count().await;
            }
        };

        let mut wanted: HashMap<i64, u32> = HashMap::new();
        for rule in rules.iter().filter(|r| r.wants_digest_job()) {
            wanted.insert(rule.id, rule.interval_minutes);
        }

        let mut jobs = self.jobs.write().await;

        // Drop jobs whose rule is gone, disabled, or rescheduled.
        let stale: Vec<i64> = jobs
            .iter()
            .filter(|(id, job)| wanted.get(id) != Some(&job.interval_minutes))
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some(job) = jobs.remove(&id) {
                job.shutdown.store(true, Ordering::Relaxed);
                job.handle.abort();
                debug!(rule_id = id, "Digest job removed");
            }
        }

        let running_ids: HashSet<i64> = jobs.keys().copied().collect();
        for (rule_id, interval_minutes) in wanted {
            if !running_ids.contains(&rule_id) {
                jobs.insert(rule_id, self.spawn_job(rule_id, interval_minutes));
            }
        }

        self.running.store(true, Ordering::Relaxed);
        let count = jobs.len();
        info!(jobs = count, "Digest jobs synced");
        count
    }

    /// Reconcile a single rule's job immediately, without sweeping the
    /// whole table. Used after one rule is edited.
    pub async fn resync(self: &Arc<Self>, rule_id: i64) {
        let rule = match self.store.get_rule(rule_id).await {
            Ok(rule) => rule,
            Err(e) => {
                error!(rule_id, "Cannot load rule for digest resync: {e}");
                return;
            }
        };

        let mut jobs = self.jobs.write().await;
        let wanted = rule.as_ref().filter(|r| r.wants_digest_job());

        let unchanged = matches!(
            (jobs.get(&rule_id), wanted),
            (Some(job), Some(r)) if r.interval_minutes == job.interval_minutes
        );
        if unchanged {
            return;
        }
        if let Some(job) = jobs.remove(&rule_id) {
            job.shutdown.store(true, Ordering::Relaxed);
            job.handle.abort();
            debug!(rule_id, "Digest job removed");
        }
        if let Some(r) = wanted {
            jobs.insert(rule_id, self.spawn_job(rule_id, r.interval_minutes));
            debug!(rule_id, "Digest job scheduled");
        }
    }

    /// Stop every job. A later `sync_all` starts fresh.
    pub async fn stop(&self) {
        let mut jobs = self.jobs.write().await;
        for (rule_id, job) in jobs.drain() {
            job.shutdown.store(true, Ordering::Relaxed);
            job.handle.abort();
            debug!(rule_id, "Digest job stopped");
        }
        self.running.store(false, Ordering::Relaxed);
        info!("Digest scheduler stopped");
    }

    fn spawn_job(self: &Arc<Self>, rule_id: i64, interval_minutes: u32) -> DigestJob {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);
        let scheduler = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let period = Duration::from_secs(u64::from(interval_minutes.max(1)) * 60);
            let mut tick = tokio::time::interval(period);
            // The first interval tick fires immediately; a digest should
            // wait a full period first.
            tick.tick().await;

            loop {
                tick.tick().await;
                if shutdown_flag.load(Ordering::Relaxed) {
                    debug!(rule_id, "Digest job shutting down");
                    return;
                }
                match scheduler.run_rule(rule_id).await {
                    Ok(0) => {}
                    Ok(sent) => info!(rule_id, sent, "Digest delivered"),
                    Err(e) => warn!(rule_id, "Digest run failed, entries stay queued: {e}"),
                }
            }
        });

        DigestJob {
            interval_minutes,
            shutdown,
            handle,
        }
    }

    /// Deliver one rule's queued entries now. Re-reads the rule so a rule
    /// disabled or switched to instant since the job was scheduled becomes
    /// a no-op. Returns how many entries were sent.
    ///
    /// On delivery failure the entries stay PENDING and roll into the next
    /// run; nothing is marked, no attachment is deleted.
    pub async fn run_rule(&self, rule_id: i64) -> Result<usize> {
        let Some(rule) = self.store.get_rule(rule_id).await? else {
            warn!(rule_id, "Digest rule vanished");
            return Ok(0);
        };
        if !rule.wants_digest_job() {
            debug!(rule_id, "Rule no longer wants digests, skipping run");
            return Ok(0);
        }

        let entries = self
            .store
            .query_log_entries(rule_id, LogStatus::Pending)
            .await?;
        if entries.is_empty() {
            return Ok(0);
        }

        let sink = self.resolver.resolve(&rule).await?;
        let outbound = OutboundMessage {
            subject: digest_subject(&rule),
            body: compose_digest_text(&entries),
            html_body: Some(compose_digest_html(&entries)),
            attachments: entries
                .iter()
                .filter_map(|e| e.attachment_path.clone())
                .collect(),
        };
        sink.deliver(&outbound).await?;

        // One send covered the whole batch; now consume it.
        for entry in &entries {
            self.store
                .update_log_status(entry.id, LogStatus::Sent)
                .await?;
            if let Some(path) = &entry.attachment_path {
                self.media.remove(path).await;
            }
        }
        self.store.touch_rule_last_run(rule_id, Utc::now()).await?;

        Ok(entries.len())
    }
}
