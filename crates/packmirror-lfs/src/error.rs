// SPDX-License-Identifier: AGPL-3.0
// Copyright (C) 2025 PackMirror Contributors

//! Error types for LFS integration

use thiserror::Error;

/// Result type for LFS operations
pub type LfsResult<T> = Result<T, LfsError>;

/// Error types for LFS pointer parsing and payload transfer
#[derive(Debug, Error)]
pub enum LfsError {
    /// Error parsing pointer file
    #[error("Failed to parse pointer file: {0}")]
    PointerParse(String),

    /// Invalid pointer file format
    #[error("Invalid pointer file format: {0}")]
    InvalidPointerFormat(String),

    /// Missing required field in pointer file
    #[error("Missing required field in pointer file: {0}")]
    MissingPointerField(String),

    /// Invalid OID format
    #[error("Invalid OID format: {0}")]
    InvalidOid(String),

    /// The batch endpoint answered without a usable download action
    #[error("batch endpoint gave no download action for {0}")]
    NoDownloadAction(String),

    /// Non-2xx response or transport failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Destination store failure
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
