//! Pure rule matching over origin identifiers.

use crate::model::{ForwardingRule, WILDCARD};

/// Whether a rule's filter set admits the given origin.
///
/// An empty filter set matches everything, as does one containing the
/// wildcard token. Otherwise the origin must appear verbatim; comparisons
/// are case-sensitive, so mailbox pollers are expected to lowercase sender
/// addresses before they get here.
pub fn filter_matches(filter_set: &[String], origin_id: &str) -> bool {
    filter_set.is_empty()
        || filter_set
            .iter()
            .any(|token| token == WILDCARD || token == origin_id)
}

/// All enabled rules for the source whose filter set admits the origin, in
/// id order so a message hitting several rules is forwarded
/// deterministically.
pub fn match_rules<'a>(
    rules: &'a [ForwardingRule],
    source_account_id: i64,
    origin_id: &str,
) -> Vec<&'a ForwardingRule> {
    rules
        .iter()
        .filter(|rule| {
            rule.enabled
                && rule.source_account_id == source_account_id
                && filter_matches(&rule.filter_set, origin_id)
        })
        .collect()
}
