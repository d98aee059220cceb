//! Error types for the task dispatch worker.

use thiserror::Error;

use crate::envelope::TaskEnvelope;

/// Failure talking to the broker, on either substrate.
///
/// The broker client never retries; callers decide what to do with this.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Native protocol error (connection refused, protocol violation, ...).
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// HTTP transport error from the REST substrate.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The REST endpoint answered with a non-2xx status.
    #[error("Broker returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The broker accepted the request but rejected the command.
    #[error("Broker command failed: {0}")]
    Command(String),

    /// The response body did not have the expected shape.
    #[error("Malformed broker response: {0}")]
    MalformedResponse(String),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A queue payload that could not be turned into a [`TaskEnvelope`].
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Failed to decode task payload: {reason}")]
pub struct DecodeError {
    /// Why decoding failed.
    pub reason: String,
    /// Best-effort textual form of the original payload.
    pub raw: String,
}

impl DecodeError {
    pub fn new(reason: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            raw: raw.into(),
        }
    }
}

/// Relational store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database driver error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The store could not serve the request.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// What went wrong inside a task handler.
#[derive(Error, Debug)]
pub enum HandlerFailure {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("missing field `{0}`")]
    MissingField(String),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: String, reason: String },
}

/// A handler failed; carries the task it was running.
#[derive(Error, Debug)]
#[error("Handler for `{kind}` failed: {source}")]
pub struct HandlerError {
    pub kind: String,
    pub task: TaskEnvelope,
    #[source]
    pub source: HandlerFailure,
}

impl HandlerError {
    pub fn new(task: &TaskEnvelope, source: impl Into<HandlerFailure>) -> Self {
        Self {
            kind: task.kind.clone(),
            task: task.clone(),
            source: source.into(),
        }
    }
}

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing configuration: {0}")]
    Missing(String),

    #[error("Invalid value for {var}: {reason}")]
    Invalid { var: String, reason: String },
}

/// Top-level error for the worker process.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Broker unreachable at process start. Fatal, never retried.
    #[error("Startup failed: {0}")]
    Startup(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias using WorkerError.
pub type Result<T> = std::result::Result<T, WorkerError>;
