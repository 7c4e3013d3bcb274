use thiserror::Error;

/// Errors produced by the Conductor protocol and transport layers.
#[derive(Debug, Error)]
pub enum ConductorError {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("discovery error: {0}")]
    Discovery(String),

    #[error("rejected by relay: {0}")]
    Rejected(String),

    #[error("timeout")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type ConductorResult<T> = Result<T, ConductorError>;

/// Reasons a client command is refused by the relay.
///
/// The `Display` text is sent verbatim as the `error` field of the
/// structured failure response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("Message is not valid JSON")]
    NotJson,

    #[error("Message is not valid")]
    InvalidMessage,

    #[error("No command found")]
    NoCommand,

    #[error("A secret is required!")]
    SecretRequired,

    #[error("Invalid secret! Are you a hacker?")]
    InvalidSecret,

    #[error("Not connected to Steam")]
    NotConnected,

    #[error("Conductor is shutting down")]
    ShuttingDown,

    #[error("Request was evicted before Steam replied")]
    Evicted,
}
