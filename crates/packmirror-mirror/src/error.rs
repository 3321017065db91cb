// SPDX-License-Identifier: AGPL-3.0
// Copyright (C) 2025 PackMirror Contributors

//! Error types for mirror runs

use packmirror_pack::PackError;
use thiserror::Error;

/// Result type for mirror operations
pub type MirrorResult<T> = Result<T, MirrorError>;

/// Errors that can abort (or be logged during) a mirror run
#[derive(Debug, Error)]
pub enum MirrorError {
    /// Pack-stream parsing or decompression failed
    #[error(transparent)]
    Pack(#[from] PackError),

    /// The source answered with a non-success status or a malformed reply
    #[error("remote error: {0}")]
    Remote(String),

    /// The destination object store failed
    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),

    /// A bounded wait expired
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The target URL is not a usable object-store location
    #[error("invalid mirror target: {0}")]
    Target(String),

    /// The worker pool went away while entries were still being dispatched
    #[error("worker pool failed: {0}")]
    WorkerPool(String),

    /// HTTP transport failure talking to the source
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl MirrorError {
    /// Wrap a destination-store failure
    pub fn storage<E: Into<anyhow::Error>>(error: E) -> Self {
        MirrorError::Storage(error.into())
    }

    /// Create a Remote error with context
    pub fn remote<S: Into<String>>(msg: S) -> Self {
        MirrorError::Remote(msg.into())
    }
}
