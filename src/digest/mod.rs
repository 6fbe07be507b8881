//! Periodic digest delivery: composition helpers and the scheduler.

pub mod compose;
pub mod scheduler;

pub use compose::{compose_digest_html, compose_digest_text, digest_subject, group_by_sender};
pub use scheduler::DigestScheduler;
