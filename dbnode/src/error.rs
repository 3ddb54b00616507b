//! Node lifecycle error types

use thiserror::Error;

/// Errors that can occur while managing a database node
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Shutting down")]
    ShuttingDown,

    #[error("Connection error: {0}")]
    Connection(String),

    /// A failure the retry strategy is allowed to absorb (busy/locked database)
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Cluster error: {0}")]
    Cluster(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl NodeError {
    /// Get the error type as a string for metrics labeling
    pub fn error_type(&self) -> &'static str {
        match self {
            NodeError::Config(_) => "config",
            NodeError::NotFound(_) => "not_found",
            NodeError::AlreadyExists(_) => "already_exists",
            NodeError::ShuttingDown => "shutting_down",
            NodeError::Connection(_) => "connection",
            NodeError::Transient(_) => "transient",
            NodeError::Database(_) => "database",
            NodeError::Cluster(_) => "cluster",
            NodeError::Timeout(_) => "timeout",
            NodeError::Io(_) => "io",
            NodeError::Serialization(_) => "serialization",
            NodeError::Internal(_) => "internal",
        }
    }

    /// Whether a retry may succeed without outside intervention
    pub fn is_transient(&self) -> bool {
        matches!(self, NodeError::Transient(_))
    }
}

impl From<rusqlite::Error> for NodeError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                NodeError::Transient(err.to_string())
            }
            _ => NodeError::Database(err.to_string()),
        }
    }
}

impl From<r2d2::Error> for NodeError {
    fn from(err: r2d2::Error) -> Self {
        NodeError::Connection(err.to_string())
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Io(err.to_string())
    }
}

impl From<serde_yaml::Error> for NodeError {
    fn from(err: serde_yaml::Error) -> Self {
        NodeError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for NodeError {
    fn from(err: toml::de::Error) -> Self {
        NodeError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for NodeError {
    fn from(err: toml::ser::Error) -> Self {
        NodeError::Serialization(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for NodeError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        NodeError::Timeout(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;
