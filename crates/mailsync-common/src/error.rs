//! Error types for mailsync

use thiserror::Error;

/// Main error type for mailsync
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Stale message position: {0}")]
    StalePosition(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Internal invariant violated: {0}")]
    Invariant(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for mailsync
pub type Result<T> = std::result::Result<T, Error>;

/// How far a failure reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// One message is affected; it is retried on the next run
    Message,
    /// The current mailbox is skipped; the run continues
    Mailbox,
    /// The whole run is aborted
    Run,
}

impl Error {
    /// Returns how far this error reaches
    pub fn severity(&self) -> Severity {
        match self {
            Error::NotFound(_) | Error::Protocol(_) | Error::Storage(_) => Severity::Message,
            Error::Timeout(_) | Error::StalePosition(_) => Severity::Mailbox,
            Error::Config(_)
            | Error::Connection(_)
            | Error::Auth(_)
            | Error::Checkpoint(_)
            | Error::Invariant(_)
            | Error::Internal(_)
            | Error::Other(_) => Severity::Run,
        }
    }

    /// Whether this error must terminate the run
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Run
    }

    /// Returns the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 2,
            Error::Connection(_) | Error::Auth(_) => 3,
            Error::Checkpoint(_) => 4,
            Error::Invariant(_) => 70,
            _ => 1,
        }
    }

    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Connection(_) => "CONNECTION_ERROR",
            Error::Auth(_) => "UNAUTHORIZED",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Protocol(_) => "PROTOCOL_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Timeout(_) => "TIMEOUT",
            Error::StalePosition(_) => "STALE_POSITION",
            Error::Checkpoint(_) => "CHECKPOINT_ERROR",
            Error::Invariant(_) => "INVARIANT_VIOLATION",
            Error::Internal(_) | Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}
