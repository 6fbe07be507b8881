//! Unified `Store` trait — single async interface for all persistence.
//!
//! Account and rule records are created/edited by out-of-scope collaborators
//! (the settings CRUD); the engine reads them and owns only the message-log
//! mutations. Insert/update methods for accounts and rules are still part of
//! this trait because they are the collaborator surface and the tests' setup
//! path.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::RelaySettings;
use crate::error::DatabaseError;
use crate::model::{Account, AccountKind, ForwardingRule, LogStatus, MessageLogEntry, NewLogEntry};

/// Fields for a new account; the store assigns id and created_at.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub name: String,
    pub kind: AccountKind,
    pub credentials: serde_json::Value,
    pub active: bool,
}

/// Fields for a new forwarding rule.
#[derive(Debug, Clone)]
pub struct NewRule {
    pub name: Option<String>,
    pub source_account_id: i64,
    pub destination_account_id: i64,
    pub filter_set: Vec<String>,
    pub destination_config: serde_json::Value,
    pub mode: crate::model::ForwardMode,
    pub interval_minutes: u32,
    pub enabled: bool,
}

/// Backend-agnostic persistence trait covering accounts, rules, and logs.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Accounts ────────────────────────────────────────────────────

    async fn insert_account(&self, account: &NewAccount) -> Result<i64, DatabaseError>;

    async fn get_account(&self, id: i64) -> Result<Option<Account>, DatabaseError>;

    /// All accounts with `active = true`, id ascending.
    async fn list_active_accounts(&self) -> Result<Vec<Account>, DatabaseError>;

    async fn set_account_active(&self, id: i64, active: bool) -> Result<(), DatabaseError>;

    // ── Forwarding rules ────────────────────────────────────────────

    async fn insert_rule(&self, rule: &NewRule) -> Result<i64, DatabaseError>;

    async fn get_rule(&self, id: i64) -> Result<Option<ForwardingRule>, DatabaseError>;

    /// Enabled rules scoped to a source account, id ascending.
    async fn list_rules_for_source(
        &self,
        source_account_id: i64,
    ) -> Result<Vec<ForwardingRule>, DatabaseError>;

    /// All enabled rules, id ascending.
    async fn list_enabled_rules(&self) -> Result<Vec<ForwardingRule>, DatabaseError>;

    async fn set_rule_enabled(&self, id: i64, enabled: bool) -> Result<(), DatabaseError>;

    async fn set_rule_interval(&self, id: i64, interval_minutes: u32)
        -> Result<(), DatabaseError>;

    async fn touch_rule_last_run(
        &self,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // ── Message logs ────────────────────────────────────────────────

    /// Insert a log entry. Returns the assigned id.
    async fn insert_log_entry(&self, entry: &NewLogEntry) -> Result<i64, DatabaseError>;

    async fn get_log_entry(&self, id: i64) -> Result<Option<MessageLogEntry>, DatabaseError>;

    /// Entries for a rule with the given status, id ascending.
    async fn query_log_entries(
        &self,
        rule_id: i64,
        status: LogStatus,
    ) -> Result<Vec<MessageLogEntry>, DatabaseError>;

    /// Transition one entry's status. A single atomic store write; rejects
    /// transitions `LogStatus::can_transition_to` forbids.
    async fn update_log_status(&self, id: i64, status: LogStatus) -> Result<(), DatabaseError>;

    // ── Settings ────────────────────────────────────────────────────

    /// Mail-relay and push app credentials, if the operator has set them.
    async fn relay_settings(&self) -> Result<Option<RelaySettings>, DatabaseError>;

    async fn put_relay_settings(&self, settings: &RelaySettings) -> Result<(), DatabaseError>;
}
