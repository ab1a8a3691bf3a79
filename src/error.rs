use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::chain::State;

/// Errors raised while compiling sequence specs into a graph.
///
/// Compilation either yields a complete graph or one of these; partial
/// graphs are never surfaced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Unknown dependency: {node} depends on {dependency}")]
    UnknownDependency { node: String, dependency: String },

    #[error("Cyclic graph: {node} is part of a cycle")]
    CyclicGraph { node: String },
}

impl CompileError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    pub fn validation_field(msg: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }
}

/// Chain repository errors.
#[derive(Error, Debug)]
pub enum RepoError {
    #[error("Chain not found: {0}")]
    NotFound(String),

    #[error("Chain already exists: {0}")]
    Conflict(String),

    /// More than one record went away for a single key. Storage is corrupt.
    #[error("Multiple chains deleted for key {key} (count: {count})")]
    MultipleDeleted { key: String, count: u64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Compression error: {0}")]
    Compression(#[from] io::Error),

    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl RepoError {
    /// Fatal errors signal storage corruption and must never be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::MultipleDeleted { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum ChainError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Repo(#[from] RepoError),

    // Runtime errors
    #[error("Invalid transition for node {node}: {from:?} -> {to:?}")]
    InvalidTransition { node: String, from: State, to: State },

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    #[error("Job create failed: {node} - {reason}")]
    JobCreate { node: String, reason: String },

    #[error("Job log not found: request {request_id}, job {job_id}")]
    JobLogNotFound { request_id: String, job_id: String },

    #[error("Chain not running: {0}")]
    NotRunning(String),

    // Configuration errors
    #[error("Configuration invalid: {0}")]
    Configuration(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChainError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True for a missing file or a missing repository record.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Io(e) => e.kind() == io::ErrorKind::NotFound,
            Self::Repo(e) => e.is_not_found(),
            Self::JobLogNotFound { .. } => true,
            _ => false,
        }
    }

    /// Storage corruption or a broken state machine invariant.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Repo(e) => e.is_fatal(),
            Self::InvalidTransition { .. } => true,
            _ => false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Repo(RepoError::Sled(_))
            | Self::Repo(RepoError::Redis(_))
            | Self::Repo(RepoError::Compression(_))
            | Self::Io(_) => true,

            // Duplicate submission is a rejection, not a transient fault
            Self::Repo(RepoError::Conflict(_)) => false,

            _ => false,
        }
    }

    pub fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            Self::Repo(RepoError::Redis(_)) => Some(Duration::from_millis(500)),
            Self::Repo(RepoError::Sled(_)) | Self::Io(_) => Some(Duration::from_secs(1)),
            _ if self.is_retryable() => Some(Duration::from_secs(2)),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChainError>;
