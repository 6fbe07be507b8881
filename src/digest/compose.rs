//! Digest body composition.
//!
//! Entries are grouped by sender label in first-seen order, so a digest
//! reads as "everything from Alice, then everything from Bob" rather than
//! interleaved by arrival.

use crate::model::{ForwardingRule, MessageLogEntry};

/// Group entries by sender label, preserving the order senders first
/// appear and the entry order within each sender.
pub fn group_by_sender(entries: &[MessageLogEntry]) -> Vec<(String, Vec<&MessageLogEntry>)> {
    let mut groups: Vec<(String, Vec<&MessageLogEntry>)> = Vec::new();
    for entry in entries {
        match groups.iter_mut().find(|(label, _)| *label == entry.sender_label) {
            Some((_, bucket)) => bucket.push(entry),
            None => groups.push((entry.sender_label.clone(), vec![entry])),
        }
    }
    groups
}

pub fn digest_subject(rule: &ForwardingRule) -> String {
    format!("Digest: {}", rule.label())
}

/// Plain-text digest body.
pub fn compose_digest_text(entries: &[MessageLogEntry]) -> String {
    let mut out = String::new();
    for (sender, bucket) in group_by_sender(entries) {
        out.push_str(&format!("From {sender} ({} message{}):\n", bucket.len(),
            if bucket.len() == 1 { "" } else { "s" }));
        for entry in bucket {
            out.push_str("  - ");
            out.push_str(&entry.content_snippet.replace('\n', " "));
            if entry.attachment_path.is_some() {
                out.push_str(" [attachment]");
            }
            out.push('\n');
        }
        out.push('\n');
    }
    out
}

/// HTML digest body, one section per sender.
pub fn compose_digest_html(entries: &[MessageLogEntry]) -> String {
    let mut out = String::from("<html><body>");
    for (sender, bucket) in group_by_sender(entries) {
        out.push_str(&format!(
            "<h3>From {} ({} message{})</h3><ul>",
            escape_html(&sender),
            bucket.len(),
            if bucket.len() == 1 { "" } else { "s" }
        ));
        for entry in bucket {
            out.push_str("<li>");
            out.push_str(&escape_html(&entry.content_snippet).replace('\n', "<br>"));
            if entry.attachment_path.is_some() {
                out.push_str(" <i>[attachment]</i>");
            }
            out.push_str("</li>");
        }
        out.push_str("</ul>");
    }
    out.push_str("</body></html>");
    out
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
