//! Error types for the ingestion core.
//!
//! Errors fall into the classes the writer treats differently:
//!
//! - capacity errors are returned before any buffer state changes,
//! - document errors are recovered locally by marking the batch deleted,
//! - aborting errors discard the whole in-memory segment and are reported
//!   as tragic events,
//! - closed errors are returned by components that no longer accept work.

use std::io;

use thiserror::Error;

/// Main error type for iris-ingest operations.
#[derive(Error, Debug)]
pub enum IrisError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    #[error("Document rejected: {0}")]
    Document(String),

    #[error("Aborting error: {0}")]
    Aborting(String),

    #[error("Already closed: {0}")]
    AlreadyClosed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for iris-ingest operations.
pub type Result<T> = std::result::Result<T, IrisError>;

impl IrisError {
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        IrisError::Storage(msg.into())
    }

    pub fn index<S: Into<String>>(msg: S) -> Self {
        IrisError::Index(msg.into())
    }

    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        IrisError::InvalidArgument(msg.into())
    }

    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        IrisError::InvalidConfig(msg.into())
    }

    pub fn invalid_operation<S: Into<String>>(msg: S) -> Self {
        IrisError::InvalidOperation(msg.into())
    }

    pub fn capacity<S: Into<String>>(msg: S) -> Self {
        IrisError::Capacity(msg.into())
    }

    pub fn document<S: Into<String>>(msg: S) -> Self {
        IrisError::Document(msg.into())
    }

    pub fn aborting<S: Into<String>>(msg: S) -> Self {
        IrisError::Aborting(msg.into())
    }

    pub fn already_closed<S: Into<String>>(msg: S) -> Self {
        IrisError::AlreadyClosed(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        IrisError::NotFound(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        IrisError::Internal(msg.into())
    }

    /// Whether this error must discard the in-memory segment it was raised in.
    ///
    /// Document and argument errors only reject the batch that caused them;
    /// everything touching storage or flagged as aborting is fatal for the buffer.
    pub fn is_aborting(&self) -> bool {
        matches!(
            self,
            IrisError::Io(_) | IrisError::Storage(_) | IrisError::Aborting(_) | IrisError::Internal(_)
        )
    }

    /// Whether the caller can retry after fixing its input or waiting for capacity.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            IrisError::Capacity(_) | IrisError::Document(_) | IrisError::InvalidArgument(_)
        )
    }
}

impl Clone for IrisError {
    fn clone(&self) -> Self {
        match self {
            IrisError::Io(e) => IrisError::Io(io::Error::new(e.kind(), e.to_string())),
            IrisError::Json(e) => IrisError::Internal(format!("serialization: {e}")),
            IrisError::Storage(s) => IrisError::Storage(s.clone()),
            IrisError::Index(s) => IrisError::Index(s.clone()),
            IrisError::InvalidArgument(s) => IrisError::InvalidArgument(s.clone()),
            IrisError::InvalidConfig(s) => IrisError::InvalidConfig(s.clone()),
            IrisError::InvalidOperation(s) => IrisError::InvalidOperation(s.clone()),
            IrisError::Capacity(s) => IrisError::Capacity(s.clone()),
            IrisError::Document(s) => IrisError::Document(s.clone()),
            IrisError::Aborting(s) => IrisError::Aborting(s.clone()),
            IrisError::AlreadyClosed(s) => IrisError::AlreadyClosed(s.clone()),
            IrisError::NotFound(s) => IrisError::NotFound(s.clone()),
            IrisError::Internal(s) => IrisError::Internal(s.clone()),
        }
    }
}
