//! libSQL backend — async `Store` trait implementation.
//!
//! Local file databases in production, in-memory for tests. A single
//! connection is reused for all operations; `libsql::Connection` is
//! `Send + Sync` and safe for concurrent async use.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::config::RelaySettings;
use crate::error::DatabaseError;
use crate::model::{
    Account, AccountKind, ForwardMode, ForwardingRule, LogStatus, MessageLogEntry, NewLogEntry,
};
use crate::store::traits::{NewAccount, NewRule, Store};

/// libSQL store backend.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and initialize the schema.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to create in-memory database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS accounts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    credentials TEXT NOT NULL DEFAULT '{}',
                    active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS forwarding_rules (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT,
                    source_account_id INTEGER NOT NULL REFERENCES accounts(id),
                    destination_account_id INTEGER NOT NULL REFERENCES accounts(id),
                    filter_set TEXT NOT NULL DEFAULT '[]',
                    destination_config TEXT NOT NULL DEFAULT '{}',
                    mode TEXT NOT NULL DEFAULT 'instant',
                    interval_minutes INTEGER NOT NULL DEFAULT 5,
                    enabled INTEGER NOT NULL DEFAULT 1,
                    last_run_at TEXT,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_rules_source
                    ON forwarding_rules(source_account_id, enabled);

                CREATE TABLE IF NOT EXISTS message_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    rule_id INTEGER NOT NULL REFERENCES forwarding_rules(id),
                    source_account_id INTEGER NOT NULL,
                    external_message_id TEXT NOT NULL,
                    sender_label TEXT NOT NULL,
                    content_snippet TEXT NOT NULL,
                    attachment_path TEXT,
                    status TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_logs_rule_status
                    ON message_logs(rule_id, status);

                CREATE TABLE IF NOT EXISTS relay_settings (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    smtp_host TEXT NOT NULL,
                    smtp_port INTEGER NOT NULL,
                    smtp_username TEXT NOT NULL,
                    smtp_password TEXT NOT NULL,
                    push_api_id TEXT,
                    push_api_hash TEXT,
                    updated_at TEXT NOT NULL
                );",
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Schema init failed: {e}")))?;
        Ok(())
    }
}

// ── Row mapping helpers ─────────────────────────────────────────────

/// Parse an RFC 3339 datetime string written by this store.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn parse_json(s: &str) -> serde_json::Value {
    serde_json::from_str(s).unwrap_or(serde_json::Value::Null)
}

fn row_to_account(row: &libsql::Row) -> Result<Account, DatabaseError> {
    let kind_str: String = row.get(2).map_err(to_query_err)?;
    let kind = AccountKind::parse(&kind_str).ok_or_else(|| {
        DatabaseError::Serialization(format!("Unknown account kind {kind_str:?}"))
    })?;
    let credentials: String = row.get(3).map_err(to_query_err)?;
    let created: String = row.get(5).map_err(to_query_err)?;

    Ok(Account {
        id: row.get(0).map_err(to_query_err)?,
        name: row.get(1).map_err(to_query_err)?,
        kind,
        credentials: parse_json(&credentials),
        active: row.get::<i64>(4).map_err(to_query_err)? != 0,
        created_at: parse_datetime(&created),
    })
}

fn row_to_rule(row: &libsql::Row) -> Result<ForwardingRule, DatabaseError> {
    let filter_raw: String = row.get(4).map_err(to_query_err)?;
    let filter_set: Vec<String> = serde_json::from_str(&filter_raw)
        .map_err(|e| DatabaseError::Serialization(format!("Bad filter_set: {e}")))?;
    let config_raw: String = row.get(5).map_err(to_query_err)?;
    let mode_str: String = row.get(6).map_err(to_query_err)?;
    let mode = ForwardMode::parse(&mode_str)
        .ok_or_else(|| DatabaseError::Serialization(format!("Unknown mode {mode_str:?}")))?;
    let created: String = row.get(10).map_err(to_query_err)?;

    Ok(ForwardingRule {
        id: row.get(0).map_err(to_query_err)?,
        name: row.get::<String>(1).ok(),
        source_account_id: row.get(2).map_err(to_query_err)?,
        destination_account_id: row.get(3).map_err(to_query_err)?,
        filter_set,
        destination_config: parse_json(&config_raw),
        mode,
        interval_minutes: row.get::<i64>(7).map_err(to_query_err)?.max(0) as u32,
        enabled: row.get::<i64>(8).map_err(to_query_err)? != 0,
        last_run_at: row.get::<String>(9).ok().map(|s| parse_datetime(&s)),
        created_at: parse_datetime(&created),
    })
}

fn row_to_log(row: &libsql::Row) -> Result<MessageLogEntry, DatabaseError> {
    let status_str: String = row.get(7).map_err(to_query_err)?;
    let status = LogStatus::parse(&status_str)
        .ok_or_else(|| DatabaseError::Serialization(format!("Unknown status {status_str:?}")))?;
    let created: String = row.get(8).map_err(to_query_err)?;

    Ok(MessageLogEntry {
        id: row.get(0).map_err(to_query_err)?,
        rule_id: row.get(1).map_err(to_query_err)?,
        source_account_id: row.get(2).map_err(to_query_err)?,
        external_message_id: row.get(3).map_err(to_query_err)?,
        sender_label: row.get(4).map_err(to_query_err)?,
        content_snippet: row.get(5).map_err(to_query_err)?,
        attachment_path: row.get::<String>(6).ok().map(PathBuf::from),
        status,
        created_at: parse_datetime(&created),
    })
}

fn to_query_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

const RULE_COLUMNS: &str = "id, name, source_account_id, destination_account_id, filter_set, \
     destination_config, mode, interval_minutes, enabled, last_run_at, created_at";

const LOG_COLUMNS: &str = "id, rule_id, source_account_id, external_message_id, sender_label, \
     content_snippet, attachment_path, status, created_at";

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlStore {
    async fn insert_account(&self, account: &NewAccount) -> Result<i64, DatabaseError> {
        self.conn
            .execute(
                "INSERT INTO accounts (name, kind, credentials, active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    account.name.clone(),
                    account.kind.as_str(),
                    account.credentials.to_string(),
                    account.active as i64,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(to_query_err)?;
        Ok(self.conn.last_insert_rowid())
    }

    async fn get_account(&self, id: i64) -> Result<Option<Account>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, kind, credentials, active, created_at
                 FROM accounts WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(to_query_err)?;
        match rows.next().await.map_err(to_query_err)? {
            Some(row) => Ok(Some(row_to_account(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_active_accounts(&self) -> Result<Vec<Account>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, kind, credentials, active, created_at
                 FROM accounts WHERE active = 1 ORDER BY id ASC",
                (),
            )
            .await
            .map_err(to_query_err)?;
        let mut accounts = Vec::new();
        while let Some(row) = rows.next().await.map_err(to_query_err)? {
            accounts.push(row_to_account(&row)?);
        }
        Ok(accounts)
    }

    async fn set_account_active(&self, id: i64, active: bool) -> Result<(), DatabaseError> {
        let changed = self
            .conn
            .execute(
                "UPDATE accounts SET active = ?2 WHERE id = ?1",
                params![id, active as i64],
            )
            .await
            .map_err(to_query_err)?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "account".into(),
                id,
            });
        }
        Ok(())
    }

    async fn insert_rule(&self, rule: &NewRule) -> Result<i64, DatabaseError> {
        let filter_json = serde_json::to_string(&rule.filter_set)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO forwarding_rules
                   (name, source_account_id, destination_account_id, filter_set,
                    destination_config, mode, interval_minutes, enabled, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    rule.name.clone(),
                    rule.source_account_id,
                    rule.destination_account_id,
                    filter_json,
                    rule.destination_config.to_string(),
                    rule.mode.as_str(),
                    rule.interval_minutes as i64,
                    rule.enabled as i64,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(to_query_err)?;
        Ok(self.conn.last_insert_rowid())
    }

    async fn get_rule(&self, id: i64) -> Result<Option<ForwardingRule>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {RULE_COLUMNS} FROM forwarding_rules WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(to_query_err)?;
        match rows.next().await.map_err(to_query_err)? {
            Some(row) => Ok(Some(row_to_rule(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_rules_for_source(
        &self,
        source_account_id: i64,
    ) -> Result<Vec<ForwardingRule>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM forwarding_rules
                     WHERE source_account_id = ?1 AND enabled = 1 ORDER BY id ASC"
                ),
                params![source_account_id],
            )
            .await
            .map_err(to_query_err)?;
        let mut rules = Vec::new();
        while let Some(row) = rows.next().await.map_err(to_query_err)? {
            rules.push(row_to_rule(&row)?);
        }
        Ok(rules)
    }

    async fn list_enabled_rules(&self) -> Result<Vec<ForwardingRule>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM forwarding_rules
                     WHERE enabled = 1 ORDER BY id ASC"
                ),
                (),
            )
            .await
            .map_err(to_query_err)?;
        let mut rules = Vec::new();
        while let Some(row) = rows.next().await.map_err(to_query_err)? {
            rules.push(row_to_rule(&row)?);
        }
        Ok(rules)
    }

    async fn set_rule_enabled(&self, id: i64, enabled: bool) -> Result<(), DatabaseError> {
        let changed = self
            .conn
            .execute(
                "UPDATE forwarding_rules SET enabled = ?2 WHERE id = ?1",
                params![id, enabled as i64],
            )
            .await
            .map_err(to_query_err)?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "forwarding_rule".into(),
                id,
            });
        }
        Ok(())
    }

    async fn set_rule_interval(
        &self,
        id: i64,
        interval_minutes: u32,
    ) -> Result<(), DatabaseError> {
        let changed = self
            .conn
            .execute(
                "UPDATE forwarding_rules SET interval_minutes = ?2 WHERE id = ?1",
                params![id, interval_minutes as i64],
            )
            .await
            .map_err(to_query_err)?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "forwarding_rule".into(),
                id,
            });
        }
        Ok(())
    }

    async fn touch_rule_last_run(
        &self,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "UPDATE forwarding_rules SET last_run_at = ?2 WHERE id = ?1",
                params![id, at.to_rfc3339()],
            )
            .await
            .map_err(to_query_err)?;
        Ok(())
    }

    async fn insert_log_entry(&self, entry: &NewLogEntry) -> Result<i64, DatabaseError> {
        self.conn
            .execute(
                "INSERT INTO message_logs
                   (rule_id, source_account_id, external_message_id, sender_label,
                    content_snippet, attachment_path, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.rule_id,
                    entry.source_account_id,
                    entry.external_message_id.clone(),
                    entry.sender_label.clone(),
                    entry.content_snippet.clone(),
                    entry
                        .attachment_path
                        .as_ref()
                        .map(|p| p.display().to_string()),
                    entry.status.as_str(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(to_query_err)?;
        Ok(self.conn.last_insert_rowid())
    }

    async fn get_log_entry(&self, id: i64) -> Result<Option<MessageLogEntry>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {LOG_COLUMNS} FROM message_logs WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(to_query_err)?;
        match rows.next().await.map_err(to_query_err)? {
            Some(row) => Ok(Some(row_to_log(&row)?)),
            None => Ok(None),
        }
    }

    async fn query_log_entries(
        &self,
        rule_id: i64,
        status: LogStatus,
    ) -> Result<Vec<MessageLogEntry>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM message_logs
                     WHERE rule_id = ?1 AND status = ?2 ORDER BY id ASC"
                ),
                params![rule_id, status.as_str()],
            )
            .await
            .map_err(to_query_err)?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(to_query_err)? {
            entries.push(row_to_log(&row)?);
        }
        Ok(entries)
    }

    async fn update_log_status(&self, id: i64, status: LogStatus) -> Result<(), DatabaseError> {
        let current = self
            .get_log_entry(id)
            .await?
            .ok_or(DatabaseError::NotFound {
                entity: "message_log".into(),
                id,
            })?;
        if !current.status.can_transition_to(status) {
            return Err(DatabaseError::Query(format!(
                "Illegal status transition {} -> {} for log entry {id}",
                current.status, status
            )));
        }
        self.conn
            .execute(
                "UPDATE message_logs SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )
            .await
            .map_err(to_query_err)?;
        Ok(())
    }

    async fn relay_settings(&self) -> Result<Option<RelaySettings>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT smtp_host, smtp_port, smtp_username, smtp_password,
                        push_api_id, push_api_hash
                 FROM relay_settings WHERE id = 1",
                (),
            )
            .await
            .map_err(to_query_err)?;
        let Some(row) = rows.next().await.map_err(to_query_err)? else {
            return Ok(None);
        };
        Ok(Some(RelaySettings {
            smtp_host: row.get(0).map_err(to_query_err)?,
            smtp_port: row.get::<i64>(1).map_err(to_query_err)?.clamp(0, 65535) as u16,
            smtp_username: row.get(2).map_err(to_query_err)?,
            smtp_password: SecretString::from(row.get::<String>(3).map_err(to_query_err)?),
            push_api_id: row.get::<String>(4).ok(),
            push_api_hash: row.get::<String>(5).ok().map(SecretString::from),
        }))
    }

    async fn put_relay_settings(&self, settings: &RelaySettings) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "INSERT INTO relay_settings
                   (id, smtp_host, smtp_port, smtp_username, smtp_password,
                    push_api_id, push_api_hash, updated_at)
                 VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                   smtp_host = excluded.smtp_host,
                   smtp_port = excluded.smtp_port,
                   smtp_username = excluded.smtp_username,
                   smtp_password = excluded.smtp_password,
                   push_api_id = excluded.push_api_id,
                   push_api_hash = excluded.push_api_hash,
                   updated_at = excluded.updated_at",
                params![
                    settings.smtp_host.clone(),
                    settings.smtp_port as i64,
                    settings.smtp_username.clone(),
                    settings.smtp_password.expose_secret(),
                    settings.push_api_id.clone(),
                    settings
                        .push_api_hash
                        .as_ref()
                        .map(|s| s.expose_secret().to_string()),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(to_query_err)?;
        Ok(())
    }
}
