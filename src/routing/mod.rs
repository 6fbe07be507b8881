//! Rule matching and message routing.
//!
//! The matcher is a pure function over rule filter sets; the router drives
//! the per-message forwarding flow and writes the message log; sinks are the
//! delivery seam so routing logic stays testable without SMTP or a live
//! push gateway.

pub mod matcher;
pub mod router;
pub mod sink;

pub use matcher::{filter_matches, match_rules};
pub use router::Router;
pub use sink::{DeliverySink, KindSinkResolver, MailSink, OutboundMessage, PushSink, ResolveSink};
