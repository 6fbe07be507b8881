//! Core domain records: accounts, forwarding rules, message-log entries.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Filter-set token matching every origin.
pub const WILDCARD: &str = "*";

/// Maximum stored length of a log entry's content snippet.
pub const SNIPPET_MAX: usize = 1000;

/// Kind of a bridged account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    /// Persistent connection receiving inbound events in real time.
    PushSession,
    /// Polled periodically for new inbound mail.
    MailboxSource,
    /// Outbound mail destination only.
    MailboxSink,
}

impl AccountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PushSession => "push_session",
            Self::MailboxSource => "mailbox_source",
            Self::MailboxSink => "mailbox_sink",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "push_session" => Some(Self::PushSession),
            "mailbox_source" => Some(Self::MailboxSource),
            "mailbox_sink" => Some(Self::MailboxSink),
            _ => None,
        }
    }
}

impl std::fmt::Display for AccountKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A connected account. Credentials are an opaque blob interpreted by the
/// transport for the account's kind.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub kind: AccountKind,
    pub credentials: serde_json::Value,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Delivery mode of a forwarding rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardMode {
    /// Deliver each matched message synchronously, one attempt.
    Instant,
    /// Accumulate matched messages as PENDING entries, deliver batched.
    Digest,
}

impl ForwardMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instant => "instant",
            Self::Digest => "digest",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "instant" => Some(Self::Instant),
            "digest" => Some(Self::Digest),
            _ => None,
        }
    }
}

/// An operator-defined forwarding rule between two accounts.
#[derive(Debug, Clone)]
pub struct ForwardingRule {
    pub id: i64,
    pub name: Option<String>,
    pub source_account_id: i64,
    pub destination_account_id: i64,
    /// Ordered allow-list of origin identifiers. Empty or containing the
    /// wildcard token means every origin matches.
    pub filter_set: Vec<String>,
    /// Opaque blob interpreted per destination kind, e.g. `{"email": ...}`
    /// for mail sinks or `{"chat_id": ...}` for push sinks.
    pub destination_config: serde_json::Value,
    pub mode: ForwardMode,
    /// Digest period in minutes. Ignored for instant rules.
    pub interval_minutes: u32,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ForwardingRule {
    /// Label used in digest subjects and log lines.
    pub fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("Rule {}", self.id))
    }

    /// Whether a digest job should exist for this rule.
    pub fn wants_digest_job(&self) -> bool {
        self.enabled && self.mode == ForwardMode::Digest
    }
}

/// Status of a message-log entry.
///
/// Legal transitions: `Pending → {Sent, Failed}` and
/// `Processing → {Sent, Failed}`. Sent and Failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogStatus {
    /// Awaiting a digest tick.
    Pending,
    /// Instant delivery in flight.
    Processing,
    Sent,
    Failed,
}

impl LogStatus {
    /// Check if this status allows transitioning to another.
    pub fn can_transition_to(&self, target: LogStatus) -> bool {
        use LogStatus::*;

        matches!(
            (*self, target),
            (Pending, Sent) | (Pending, Failed) | (Processing, Sent) | (Processing, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PROCESSING" => Some(Self::Processing),
            "SENT" => Some(Self::Sent),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logged message, owned by exactly one rule.
#[derive(Debug, Clone)]
pub struct MessageLogEntry {
    pub id: i64,
    pub rule_id: i64,
    pub source_account_id: i64,
    pub external_message_id: String,
    pub sender_label: String,
    pub content_snippet: String,
    /// Durable attachment path. The writer of the file sets this; whoever
    /// marks the entry SENT deletes the file.
    pub attachment_path: Option<PathBuf>,
    pub status: LogStatus,
    pub created_at: DateTime<Utc>,
}

/// Fields for a new log entry; the store assigns id and created_at.
#[derive(Debug, Clone)]
pub struct NewLogEntry {
    pub rule_id: i64,
    pub source_account_id: i64,
    pub external_message_id: String,
    pub sender_label: String,
    pub content_snippet: String,
    pub attachment_path: Option<PathBuf>,
    pub status: LogStatus,
}

/// A decoded inbound message, ready for matching and routing.
///
/// Produced by the push-session drain task or the mailbox poller; attachment
/// paths point into the transient temp area at this stage.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub source_account_id: i64,
    /// Origin identifier the filter set is compared against: a chat id for
    /// push sources, a cleaned sender address for mailbox sources.
    pub origin_id: String,
    pub external_id: String,
    pub sender_label: String,
    pub text: String,
    pub attachments: Vec<PathBuf>,
}

/// Truncate message text to the stored snippet bound, on a char boundary.
pub fn snippet(text: &str) -> String {
    if text.len() <= SNIPPET_MAX {
        return text.to_string();
    }
    let mut end = SNIPPET_MAX;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn pending_transitions() {
        assert!(LogStatus::Pending.can_transition_to(LogStatus::Sent));
        assert!(LogStatus::Pending.can_transition_to(LogStatus::Failed));
        assert!(!LogStatus::Pending.can_transition_to(LogStatus::Processing));
        assert!(!LogStatus::Pending.can_transition_to(LogStatus::Pending));
    }

    #[test]
    fn processing_transitions() {
        assert!(LogStatus::Processing.can_transition_to(LogStatus::Sent));
        assert!(LogStatus::Processing.can_transition_to(LogStatus::Failed));
        assert!(!LogStatus::Processing.can_transition_to(LogStatus::Pending));
    }

    #[test]
    fn terminal_statuses_admit_nothing() {
        for terminal in [LogStatus::Sent, LogStatus::Failed] {
            assert!(terminal.is_terminal());
            for target in [
                LogStatus::Pending,
                LogStatus::Processing,
                LogStatus::Sent,
                LogStatus::Failed,
            ] {
                assert!(!terminal.can_transition_to(target));
            }
        }
    }

    #[test]
    fn status_round_trips_through_db_string() {
        for status in [
            LogStatus::Pending,
            LogStatus::Processing,
            LogStatus::Sent,
            LogStatus::Failed,
        ] {
            assert_eq!(LogStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(LogStatus::parse("sent"), None);
    }

    #[test]
    fn snippet_bounds_long_text() {
        let long = "x".repeat(SNIPPET_MAX + 500);
        assert_eq!(snippet(&long).len(), SNIPPET_MAX);
        assert_eq!(snippet("short"), "short");
    }

    #[test]
    fn snippet_respects_char_boundaries() {
        let long = "é".repeat(SNIPPET_MAX); // 2 bytes each
        let cut = snippet(&long);
        assert!(cut.len() <= SNIPPET_MAX);
        assert!(cut.chars().all(|c| c == 'é'));
    }

    #[test]
    fn digest_job_wanted_iff_enabled_and_digest() {
        let mut rule = ForwardingRule {
            id: 1,
            name: None,
            source_account_id: 1,
            destination_account_id: 2,
            filter_set: vec![],
            destination_config: serde_json::json!({}),
            mode: ForwardMode::Digest,
            interval_minutes: 5,
            enabled: true,
            last_run_at: None,
            created_at: Utc::now(),
        };
        assert!(rule.wants_digest_job());
        rule.enabled = false;
        assert!(!rule.wants_digest_job());
        rule.enabled = true;
        rule.mode = ForwardMode::Instant;
        assert!(!rule.wants_digest_job());
    }

    #[test]
    fn rule_label_falls_back_to_id() {
        let rule = ForwardingRule {
            id: 7,
            name: None,
            source_account_id: 1,
            destination_account_id: 2,
            filter_set: vec![],
            destination_config: serde_json::json!({}),
            mode: ForwardMode::Instant,
            interval_minutes: 5,
            enabled: true,
            last_run_at: None,
            created_at: Utc::now(),
        };
        assert_eq!(rule.label(), "Rule 7");
    }
}
