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

//! Object identity: types, 20-byte content ids, and the rolling hasher

use crate::error::PackError;
use sha1::{Digest, Sha1};
use std::fmt;

/// The four concrete git object types a mirror stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// A commit object
    Commit,
    /// A tree object
    Tree,
    /// A blob object
    Blob,
    /// An annotated tag object
    Tag,
}

impl ObjectKind {
    /// The canonical type name used in loose-object headers
    pub fn name(&self) -> &'static str {
        match self {
            ObjectKind::Commit => "commit",
            ObjectKind::Tree => "tree",
            ObjectKind::Blob => "blob",
            ObjectKind::Tag => "tag",
        }
    }

    /// Map a pack type nibble to a concrete kind.
    ///
    /// Returns `None` for the delta encodings (6, 7) and reserved values;
    /// the parser handles those separately.
    pub fn from_pack_type(t: u8) -> Option<Self> {
        match t {
            1 => Some(ObjectKind::Commit),
            2 => Some(ObjectKind::Tree),
            3 => Some(ObjectKind::Blob),
            4 => Some(ObjectKind::Tag),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A 20-byte SHA-1 content identifier
///
/// The digest covers `"<type> <length>\0"` followed by the expanded object
/// bytes; the hex form is used for storage keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId([u8; 20]);

impl ObjectId {
    /// Wrap a raw 20-byte digest
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        ObjectId(bytes)
    }

    /// Parse an id from a byte slice, which must be exactly 20 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, PackError> {
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| PackError::protocol(format!("object id must be 20 bytes, got {}", bytes.len())))?;
        Ok(ObjectId(arr))
    }

    /// Parse an id from its 40-character hex form
    pub fn from_hex(hex_str: &str) -> Result<Self, PackError> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| PackError::protocol(format!("invalid hex object id: {e}")))?;
        Self::from_slice(&bytes)
    }

    /// The raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// The 40-character hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

/// Rolling SHA-1 over a canonical object
///
/// Seeded with the `"<type> <length>\0"` header, then fed the expanded
/// payload as it streams past. The uploader uses this to discover an
/// object's id while the bytes are in flight to storage.
pub struct ObjectHasher {
    sha: Sha1,
}

impl ObjectHasher {
    /// Start hashing an object of the given kind and expanded length
    pub fn new(kind: ObjectKind, len: u64) -> Self {
        let mut sha = Sha1::new();
        sha.update(header_bytes(kind, len));
        ObjectHasher { sha }
    }

    /// Feed a payload chunk
    pub fn update(&mut self, chunk: &[u8]) {
        self.sha.update(chunk);
    }

    /// Finish and return the content id
    pub fn finish(self) -> ObjectId {
        ObjectId(self.sha.finalize().into())
    }
}

/// The canonical loose-object header `"<type> <length>\0"`
pub fn header_bytes(kind: ObjectKind, len: u64) -> Vec<u8> {
    format!("{} {}\0", kind.name(), len).into_bytes()
}
