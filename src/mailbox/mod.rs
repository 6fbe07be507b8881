//! Polled mailbox sources: raw IMAP fetch plus the background poller.

pub mod imap;
pub mod poller;

pub use imap::{FetchedMail, MailboxCredentials, clean_sender};
pub use poller::spawn_mailbox_poller;
