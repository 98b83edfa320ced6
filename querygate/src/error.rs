// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Engine error types
//!
//! Nothing in this crate is fatal. Backing-layer failures are recovered where
//! they happen (a failed read is a miss, a failed write is dropped) and only
//! surface here for reporting; pattern and configuration errors are returned
//! to whoever supplied the bad input.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Backing store unavailable: {0}")]
    BackingStoreUnavailable(String),

    #[error("Invalid key pattern '{pattern}': {reason}")]
    InvalidKeyPattern { pattern: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EngineError {
    pub(crate) fn invalid_pattern(pattern: &str, reason: impl Into<String>) -> Self {
        EngineError::InvalidKeyPattern {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        EngineError::InvalidConfig(message.into())
    }
}

/// Result alias used across the crate
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors returned by shared backing-layer implementations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackingStoreError {
    #[error("Backing store unavailable: {0}")]
    Unavailable(String),

    #[error("Backing store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Backing store entry could not be decoded: {0}")]
    Codec(String),
}

impl From<BackingStoreError> for EngineError {
    fn from(error: BackingStoreError) -> Self {
        EngineError::BackingStoreUnavailable(error.to_string())
    }
}
