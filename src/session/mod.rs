//! Push-session lifecycle: transport abstraction and session manager.

pub mod manager;
pub mod transport;

pub use manager::{InboundHandler, LoginState, SessionManager};
pub use transport::{DialogInfo, HttpPushTransport, PushConnection, PushEvent, PushTransport};
