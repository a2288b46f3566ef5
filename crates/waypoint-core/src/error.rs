//! Error types for Waypoint Core

use crate::chunk::QueryId;
use thiserror::Error;

/// Result type alias using Waypoint Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the execution engine
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors (configuration files, chunk sources)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Chunk construction or access errors
    #[error("Chunk error: {0}")]
    Chunk(String),

    /// Wire encoding errors
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Token pool errors
    #[error("Token error: {0}")]
    Token(String),

    /// Hash table errors (exhausted segments, bad masks)
    #[error("Hash table error: {0}")]
    HashTable(String),

    /// Malformed join record
    #[error("Record error: {0}")]
    Record(String),

    /// The plan handed to the engine is internally inconsistent
    #[error("Plan invariant violated at waypoint {waypoint}{}: {detail}", query_suffix(.query))]
    PlanInvariant {
        /// Waypoint that detected the violation
        waypoint: String,
        /// Query involved, if any
        query: Option<QueryId>,
        /// Description of the violation
        detail: String,
    },

    /// A type-erased operator state did not carry the expected type tag
    #[error("State type mismatch: expected {expected}, got {actual}")]
    StateType {
        /// Expected state type
        expected: String,
        /// Actual state type
        actual: String,
    },

    /// Dispatcher / worker pool errors
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn query_suffix(query: &Option<QueryId>) -> String {
    match query {
        Some(q) => format!(" (query {q})"),
        None => String::new(),
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a chunk error
    pub fn chunk(msg: impl Into<String>) -> Self {
        Self::Chunk(msg.into())
    }

    /// Create an encoding error
    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::Encoding(msg.into())
    }

    /// Create a token error
    pub fn token(msg: impl Into<String>) -> Self {
        Self::Token(msg.into())
    }

    /// Create a hash table error
    pub fn hash_table(msg: impl Into<String>) -> Self {
        Self::HashTable(msg.into())
    }

    /// Create a record error
    pub fn record(msg: impl Into<String>) -> Self {
        Self::Record(msg.into())
    }

    /// Create a plan invariant violation
    pub fn plan(waypoint: impl Into<String>, query: Option<QueryId>, detail: impl Into<String>) -> Self {
        Self::PlanInvariant {
            waypoint: waypoint.into(),
            query,
            detail: detail.into(),
        }
    }

    /// Create a state type mismatch error
    pub fn state_type(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::StateType {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a dispatch error
    pub fn dispatch(msg: impl Into<String>) -> Self {
        Self::Dispatch(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Self::Encoding(err.to_string())
    }
}
