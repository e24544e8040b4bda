// Copyright (c) 2024 The Botho Foundation

//! Error taxonomy shared by every custody worker.

use thiserror::Error;

/// Errors raised while scanning, reconciling or settling.
#[derive(Debug, Error)]
pub enum CustodyError {
    /// Network or node failure; the cycle is retried on the next poll.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A stored or received document violates an invariant.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// A sweep or withdrawal transaction was rejected.
    #[error("submission failed: {0}")]
    Submission(String),

    /// Missing or malformed configuration. Ends the worker.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(String),
}

impl CustodyError {
    /// Whether the owning worker must stop instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CustodyError::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, CustodyError>;
