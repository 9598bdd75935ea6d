//! Error types for graph-herder
//!
//! Comprehensive error hierarchy covering:
//! - Credential pool errors
//! - Rate limiter backend errors
//! - Distributed lock and request-tracker errors
//! - Queue transport errors
//! - Configuration and loop-lifecycle errors

use thiserror::Error;

/// Top-level error type for graph-herder
#[derive(Error, Debug)]
pub enum HerderError {
    /// Credential pool errors
    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    /// Rate limiter errors
    #[error("Limiter error: {0}")]
    Limiter(#[from] LimiterError),

    /// Distributed lock errors
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Request tracker errors
    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    /// Queue transport errors
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Worker loop errors
    #[error("Loop error: {0}")]
    Loop(#[from] LoopError),

    /// Processing failure reported by the crawl driver
    #[error("Processing failed for '{key}': {reason}")]
    Processing { key: String, reason: String },
}

/// Credential pool errors
#[derive(Error, Debug)]
pub enum TokenError {
    /// A token spec segment could not be parsed
    #[error("Invalid token spec segment '{segment}': {reason}")]
    InvalidSpec { segment: String, reason: String },

    /// The pool was configured with no tokens at all
    #[error("Token pool is empty")]
    EmptyPool,
}

/// Rate limiter backend errors
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Backend unreachable or misbehaving
    #[error("Rate limiter backend error: {0}")]
    Backend(String),

    /// Baseline probe failed
    #[error("Baseline probe failed: {0}")]
    Probe(String),
}

impl From<redis::RedisError> for LimiterError {
    fn from(err: redis::RedisError) -> Self {
        LimiterError::Backend(err.to_string())
    }
}

/// Distributed lock errors
#[derive(Error, Debug)]
pub enum LockError {
    /// Another holder owns the lock
    #[error("Lock contended: '{key}'")]
    Contended { key: String },

    /// Lock backend unreachable
    #[error("Lock backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        LockError::Backend(err.to_string())
    }
}

/// Request tracker errors
#[derive(Error, Debug)]
pub enum TrackerError {
    /// Lock acquisition or release failed
    #[error("Tracker lock error: {0}")]
    Lock(#[from] LockError),

    /// Tag read failed; the guarded operation was not invoked
    #[error("Tag read failed for '{key}': {reason}")]
    TagRead { key: String, reason: String },

    /// Tag removal failed; a stale tag now blocks this key until TTL expiry
    #[error("Tag removal failed for '{key}': {reason}")]
    TagRemove { key: String, reason: String },

    /// Bulk flush failed
    #[error("Tag flush failed: {0}")]
    Flush(String),

    /// Raw tag store backend failure
    #[error("Tag store error: {0}")]
    Store(String),
}

impl From<redis::RedisError> for TrackerError {
    fn from(err: redis::RedisError) -> Self {
        TrackerError::Store(err.to_string())
    }
}

/// Queue transport errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// Connection to the transport backend failed
    #[error("Failed to connect to queue backend at '{url}': {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// A transport operation failed
    #[error("Queue operation failed: {0}")]
    OperationFailed(String),

    /// Request could not be encoded or decoded
    #[error("Failed to serialize/deserialize request: {0}")]
    Serialization(String),

    /// No queue with the requested name exists in the set
    #[error("Unknown queue '{name}'")]
    UnknownQueue { name: String },

    /// Tracker failure surfaced through a queue completion path
    #[error("Tracker failure during queue completion: {0}")]
    Tracking(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::OperationFailed(err.to_string())
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid loop count
    #[error("Invalid loop count {count}: must be between 1 and {max}")]
    InvalidLoopCount { count: usize, max: usize },

    /// Invalid queue weight entry
    #[error("Invalid queue weight '{entry}': {reason}")]
    InvalidQueueWeight { entry: String, reason: String },

    /// No provider registered under the requested name
    #[error("Unknown provider '{name}' (registered: {available})")]
    UnknownProvider { name: String, available: String },

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    /// A live-reconfiguration patch could not be applied
    #[error("Invalid patch for subsystem '{subsystem}': {reason}")]
    InvalidPatch { subsystem: String, reason: String },

    /// Token spec rejected at startup
    #[error("Invalid token configuration: {0}")]
    TokenSpec(#[from] TokenError),
}

/// Worker loop lifecycle errors
#[derive(Error, Debug)]
pub enum LoopError {
    /// `run` was called on a loop that already left the unstarted state
    #[error("Loop '{name}' has already been started")]
    AlreadyStarted { name: String },

    /// The loop task panicked or was torn down abnormally
    #[error("Loop '{name}' terminated abnormally: {reason}")]
    Terminated { name: String, reason: String },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, HerderError>;

/// Result type for queue operations
pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Result type for lock operations
pub type LockResult<T> = std::result::Result<T, LockError>;
