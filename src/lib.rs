//! msgbridge — forwarding-rule engine bridging push-messaging sessions and
//! polled mailboxes into instant or digest deliveries.

pub mod config;
pub mod digest;
pub mod error;
pub mod mailbox;
pub mod media;
pub mod model;
pub mod routing;
pub mod service;
pub mod session;
pub mod store;
