// SPDX-License-Identifier: AGPL-3.0
// Copyright (C) 2025 PackMirror Contributors

//! Error types for pack-stream processing

use thiserror::Error;

/// Result type for pack operations
pub type PackResult<T> = Result<T, PackError>;

/// Errors that can occur while consuming a pack stream
#[derive(Debug, Error)]
pub enum PackError {
    /// The underlying byte stream ended before a required read completed
    #[error("truncated pack stream")]
    Truncated,

    /// Unexpected signature, version, framing, or instruction byte
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An object encoding this mirror refuses to process (offset-delta)
    #[error("unsupported pack object type: {0}")]
    Unsupported(u8),

    /// Declared object length does not match the bytes produced
    #[error("object length mismatch: declared {declared}, produced {produced}")]
    IntegrityMismatch {
        /// Length announced in the object header
        declared: u64,
        /// Bytes actually produced by decompression
        produced: u64,
    },

    /// The chunk source itself failed (HTTP body error, channel torn down)
    #[error("pack source failed: {0}")]
    Source(#[source] anyhow::Error),
}

impl PackError {
    /// Create a Protocol error with context
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        PackError::Protocol(msg.into())
    }

    /// Create a Source error from any error type
    pub fn source<E: Into<anyhow::Error>>(error: E) -> Self {
        PackError::Source(error.into())
    }
}

impl From<flate2::DecompressError> for PackError {
    fn from(e: flate2::DecompressError) -> Self {
        PackError::Protocol(format!("invalid zlib stream: {e}"))
    }
}

impl From<flate2::CompressError> for PackError {
    fn from(e: flate2::CompressError) -> Self {
        PackError::Source(anyhow::anyhow!("zlib compression failed: {e}"))
    }
}
