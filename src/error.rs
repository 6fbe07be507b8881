//! Error types for msgbridge.

/// Top-level error type for the bridge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid credentials for account {account_id}: {reason}")]
    CredentialInvalid { account_id: i64, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: i64 },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Push-session errors.
///
/// `AuthRequired` is non-fatal — the account needs the login flow.
/// `ConnectFailed` is not retried in the background; it surfaces again at the
/// next explicit start attempt.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Account {account_id} has no valid authorization")]
    AuthRequired { account_id: i64 },

    #[error("Account {account_id} failed to connect: {reason}")]
    ConnectFailed { account_id: i64, reason: String },

    #[error("Account {account_id} has no live connection")]
    NotConnected { account_id: i64 },

    #[error("Two-factor password required")]
    TwoFactorRequired,

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Destination delivery errors. Recorded on the log entry: terminal for
/// instant mode, retried by the next digest tick for digest mode.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Destination account {account_id} is unusable: {reason}")]
    SinkUnavailable { account_id: i64, reason: String },

    #[error("Destination config is missing '{key}'")]
    DestinationMissing { key: String },

    #[error("Failed to build outbound message: {0}")]
    BuildFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Mailbox polling errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Mailbox connect failed: {0}")]
    ConnectFailed(String),

    #[error("Mailbox login failed: {0}")]
    AuthFailed(String),

    #[error("Malformed message: {0}")]
    ParseFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the bridge.
pub type Result<T> = std::result::Result<T, Error>;
