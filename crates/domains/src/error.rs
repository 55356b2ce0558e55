//! # AppError
//!
//! Centralized error handling for the community platform.
//! Maps store and domain failures to actionable error types.

use thiserror::Error;

/// The primary error type for all service operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Referenced entity is missing (e.g., Post, Comment, Notification)
    #[error("{0} not found with ID {1}")]
    NotFound(String, String),

    /// Transaction contention exhausted the retry budget. Safe to retry.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Actor lacks the required role flag or ownership
    #[error("permission denied: {0}")]
    Permission(String),

    /// Missing or malformed required fields, or an illegal status transition
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Infrastructure failure (store unavailable, undecodable document)
    #[error("internal service error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn not_found(kind: &str, id: impl Into<String>) -> Self {
        Self::NotFound(kind.to_string(), id.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }

    pub fn permission(msg: impl Into<String>) -> Self {
        Self::Permission(msg.into())
    }
}

/// Failures reported by a document-store client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A transaction precondition no longer holds.
    #[error("write conflict on {collection}/{id}")]
    Conflict { collection: String, id: String },

    /// A batch exceeded the backend's per-commit write ceiling.
    #[error("batch of {ops} writes exceeds the limit of {limit}")]
    BatchTooLarge { ops: usize, limit: usize },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { .. } => AppError::Conflict(err.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("document decode failed: {err}"))
    }
}

/// A specialized Result type for service logic.
pub type Result<T> = std::result::Result<T, AppError>;
