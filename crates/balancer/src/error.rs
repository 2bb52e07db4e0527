//! Error types for the load-balancing engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BalancerError>;

/// Errors surfaced by the engine's public API.
///
/// Anomalies on the dispatch path (NaN means, zero-sample windows) are
/// recovered internally and never appear here; see the strategy modules.
#[derive(Error, Debug)]
pub enum BalancerError {
    #[error("Unknown load-balancing algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("Invalid profile parameter '{name}': {reason}")]
    InvalidProfile { name: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Persistence failure: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Failure of a persistence backend operation, carrying the original cause.
///
/// These are logged with the failing key and never reach the dispatch path.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("State serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("State encoding error: {0}")]
    Encoding(#[from] hex::FromHexError),

    #[error("Persistence queue is closed")]
    QueueClosed,

    #[error("Persistence queue is full")]
    QueueFull,
}
