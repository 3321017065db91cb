// PackMirror - Mirror Git Repositories to Object Storage
// Copyright (C) 2025 PackMirror Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.

//! Git LFS pointer file parsing
//!
//! Pointer files are lightweight text blobs that stand in for large
//! payloads stored out-of-band:
//!
//! ```text
//! version https://git-lfs.github.com/spec/v1
//! oid sha256:4d7a214614ab2935c943f9e0ff69d22eadbb8f32b1258daaa5e2ca24d17e2393
//! size 12345
//! ```

use crate::error::{LfsError, LfsResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Git LFS pointer file specification version
pub const POINTER_VERSION: &str = "https://git-lfs.github.com/spec/v1";

/// The first line every pointer blob starts with; the uploader checks this
/// against the leading bytes of each blob as it streams past.
pub const POINTER_MARKER: &[u8] = b"version https://git-lfs.github.com/spec/v1\n";

/// Maximum size of a pointer file (should be very small, ~200 bytes)
pub const MAX_POINTER_SIZE: usize = 512;

/// A parsed LFS pointer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LfsPointer {
    /// Object ID: the SHA-256 hash of the payload, 64 hex characters
    pub oid: String,

    /// Size of the payload in bytes
    pub size: u64,
}

impl LfsPointer {
    /// Creates a pointer from its parts
    pub fn new(oid: String, size: u64) -> Self {
        Self { oid, size }
    }

    /// Parses a pointer file from its text representation
    ///
    /// # Errors
    ///
    /// Returns an [`LfsError`] if the content is not a valid pointer.
    pub fn parse(content: &str) -> LfsResult<Self> {
        if content.len() > MAX_POINTER_SIZE {
            return Err(LfsError::InvalidPointerFormat(
                "pointer file too large".to_string(),
            ));
        }

        let mut version: Option<String> = None;
        let mut oid: Option<String> = None;
        let mut size: Option<u64> = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let Some((key, value)) = line.split_once(' ') else {
                return Err(LfsError::PointerParse(format!(
                    "invalid line format: {line}"
                )));
            };

            match key {
                "version" => version = Some(value.to_string()),
                "oid" => {
                    // Format: "sha256:hash"
                    let Some((algo, digest)) = value.split_once(':') else {
                        return Err(LfsError::InvalidOid(format!(
                            "OID must be in format 'sha256:hash', got: {value}"
                        )));
                    };
                    if algo != "sha256" {
                        return Err(LfsError::InvalidOid(format!(
                            "only sha256 hashing is supported, got: {algo}"
                        )));
                    }
                    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                        return Err(LfsError::InvalidOid(format!(
                            "invalid SHA-256 hash: {digest}"
                        )));
                    }
                    oid = Some(digest.to_string());
                }
                "size" => {
                    size = Some(value.parse::<u64>().map_err(|e| {
                        LfsError::PointerParse(format!("invalid size value: {e}"))
                    })?);
                }
                _ => {
                    return Err(LfsError::PointerParse(format!("unknown field: {key}")));
                }
            }
        }

        let version =
            version.ok_or_else(|| LfsError::MissingPointerField("version".to_string()))?;
        if !version.starts_with("https://git-lfs.github.com/spec/") {
            return Err(LfsError::InvalidPointerFormat(format!(
                "unknown pointer version: {version}"
            )));
        }

        let oid = oid.ok_or_else(|| LfsError::MissingPointerField("oid".to_string()))?;
        let size = size.ok_or_else(|| LfsError::MissingPointerField("size".to_string()))?;

        Ok(Self { oid, size })
    }

    /// Checks whether a blob begins with the pointer marker line.
    ///
    /// This is a fast prefix check, not a full parse; the uploader runs it
    /// on the sniffed head of every blob.
    pub fn is_pointer(content: &[u8]) -> bool {
        content.starts_with(POINTER_MARKER)
    }

    /// The destination key of the payload under a store prefix:
    /// `<prefix>/lfs/objects/<aa>/<bb>/<oid>`
    pub fn storage_key(&self, prefix: &str) -> String {
        let fan_out = format!(
            "lfs/objects/{}/{}/{}",
            &self.oid[0..2],
            &self.oid[2..4],
            self.oid
        );
        let root = prefix.trim_end_matches('/');
        if root.is_empty() {
            fan_out
        } else {
            format!("{root}/{fan_out}")
        }
    }

    /// Returns the OID with its algorithm prefix
    pub fn oid_with_prefix(&self) -> String {
        format!("sha256:{}", self.oid)
    }
}

impl fmt::Display for LfsPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "version {}\noid {}\nsize {}\n",
            POINTER_VERSION,
            self.oid_with_prefix(),
            self.size
        )
    }
}
