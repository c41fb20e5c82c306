//! Error types for the reply pipeline.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("IMAP error: {0}")]
    Imap(#[from] ImapError),

    #[error("Send error: {0}")]
    Send(#[from] SendError),

    #[error("Poll error: {0}")]
    Poll(#[from] PollError),

    #[error("Reply error: {0}")]
    Reply(#[from] ReplyError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid tenant record {tenant}: {reason}")]
    InvalidTenant { tenant: String, reason: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Mailbox connection errors. Fatal to the fetch or mark-read call they occur in.
#[derive(Debug, thiserror::Error)]
pub enum ImapError {
    #[error("Failed to connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("TLS setup failed for {host}: {reason}")]
    Tls { host: String, reason: String },

    #[error("Authentication failed for {username}: {reason}")]
    Auth { username: String, reason: String },

    #[error("Protocol error during {command}: {reason}")]
    Protocol { command: String, reason: String },

    #[error("Mailbox operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed by server")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single fetched message that could not be read at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Message body is empty")]
    Empty,

    #[error("Message body could not be parsed as MIME")]
    Unreadable,

    #[error("Server returned no body for message {seq}")]
    MissingBody { seq: u32 },
}

/// SMTP send errors, surfaced verbatim to the caller.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Invalid {field} address '{value}': {reason}")]
    Address {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Failed to build email: {0}")]
    Build(String),

    #[error("SMTP transport failed: {0}")]
    Transport(String),
}

/// Errors that abort a whole poll for one tenant.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] ImapError),
}

/// Non-fatal problems recorded against one poll. Processing continues past each.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PollIssue {
    Parse { reason: String },
    MissingMessageId { from: String },
    Match { message_id: String, reason: String },
    Persist { message_id: String, conversation_id: i64, reason: String },
    MarkRead { reason: String },
}

impl std::fmt::Display for PollIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse { reason } => write!(f, "parse failed: {reason}"),
            Self::MissingMessageId { from } => {
                write!(f, "email from {from} has no Message-Id; left unseen")
            }
            Self::Match { message_id, reason } => {
                write!(f, "lookup failed for {message_id}: {reason}")
            }
            Self::Persist {
                message_id,
                conversation_id,
                reason,
            } => write!(
                f,
                "failed to save reply from {message_id} to conversation {conversation_id}: {reason}"
            ),
            Self::MarkRead { reason } => write!(f, "failed to mark emails as read: {reason}"),
        }
    }
}

/// Operator reply errors.
#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    #[error("Reply not sent: {0}")]
    Send(#[from] SendError),

    #[error("Reply sent but not recorded: {0}")]
    Persist(#[from] DatabaseError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
