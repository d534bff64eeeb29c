//! Error types for the frame daemon.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Notifier error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Display error: {0}")]
    Display(#[from] DisplayError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cursor store errors.
///
/// Read-side problems (missing or corrupt state file) are not errors at
/// all — the store falls back to defaults. These cover the write path only.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to write state file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Atomic replace of state file failed: {0}")]
    Replace(String),
}

/// Mailbox collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Connection to {host}:{port} failed: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Authentication failed for {user}: {reason}")]
    Auth { user: String, reason: String },

    #[error("{command} failed: {reason}")]
    Command { command: String, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server does not advertise IDLE")]
    IdleUnsupported,

    #[error("Message {uid} not found in mailbox")]
    NotFound { uid: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outbound mail errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build reply: {0}")]
    Build(String),

    #[error("SMTP transport error: {0}")]
    Transport(String),
}

/// Image preparation and panel errors.
#[derive(Debug, thiserror::Error)]
pub enum DisplayError {
    #[error("Failed to read image {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to decode image {path}: {reason}")]
    Decode { path: String, reason: String },

    #[error("Failed to encode preview: {0}")]
    Encode(String),

    #[error("Panel rejected frame: {0}")]
    Panel(String),

    #[error("No image available to display")]
    NoImage,
}

/// Result type alias for the frame daemon.
pub type Result<T> = std::result::Result<T, Error>;
