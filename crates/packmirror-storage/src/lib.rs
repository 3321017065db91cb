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

//! Storage abstraction layer for PackMirror
//!
//! This crate provides a unified, asynchronous object-store interface with
//! two implementations:
//! - AWS S3 (and S3-compatible services via a custom endpoint)
//! - An in-memory mock for tests
//!
//! # Architecture
//!
//! The [`StorageBackend`] trait covers the operations a mirror run performs
//! against its destination bucket:
//!
//! - **Whole-object access**: `get`, `put`, `exists`, `delete`, `list_objects`
//! - **Streaming access**: `get_stream` / `put_stream`, so pack payloads are
//!   piped into the store as they are inflated, never fully buffered
//! - **Ranged reads**: `get_range`, letting delta reconstruction read windows
//!   of a base object without downloading it
//! - **Server-side copy**: `copy`, moving a streamed upload (whose digest was
//!   only known at the end) to its content-addressed key without a second
//!   round trip through the client
//! - **Prefix purge**: `delete_prefix`, clearing the transient `mirror_tmp/`
//!   area by paginated listing plus batched deletion
//!
//! # Examples
//!
//! Using the mock backend for testing:
//!
//! ```no_run
//! use packmirror_storage::{StorageBackend, mock::MockBackend};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let storage = MockBackend::new();
//!
//!     storage.put("objects/ab/cdef", b"loose object").await?;
//!     assert!(storage.exists("objects/ab/cdef").await?);
//!
//!     let window = storage.get_range("objects/ab/cdef", 6, 6).await?;
//!     assert_eq!(window, b"object");
//!
//!     storage.delete_prefix("objects/").await?;
//!     assert!(!storage.exists("objects/ab/cdef").await?);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Implementation Guide
//!
//! When implementing `StorageBackend`:
//!
//! 1. Use `#[async_trait]` macro on your impl block
//! 2. Return `anyhow::Result<T>` for all operations
//! 3. Ensure your type implements `Send + Sync + Debug`
//! 4. Handle empty keys gracefully (typically return an error)
//! 5. List operations should return sorted results for consistency
//! 6. Deleting non-existent objects should succeed (idempotent)

pub mod error;
pub mod mock;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::fmt::Debug;
use std::pin::Pin;

pub use error::{StorageError, StorageResult};
pub use mock::MockBackend;
pub use s3::{S3Backend, S3Config};

/// A boxed stream of byte chunks, the currency of streaming uploads and
/// downloads across the backend boundary. Uploads may borrow their source
/// (`ByteStream<'_>`); downloads hand back an owned `ByteStream<'static>`.
pub type ByteStream<'a> = Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send + 'a>>;

/// Storage backend trait for object storage operations
///
/// Implementations must be async-safe, thread-safe (`Send + Sync`), and
/// handle errors gracefully. All operations return `anyhow::Result<T>` so
/// that callers can attach context at the seam; use [`StorageError`] when a
/// structured kind matters.
///
/// `put` and `delete` are idempotent; `delete` of a missing key succeeds.
#[async_trait]
pub trait StorageBackend: Send + Sync + Debug {
    /// Retrieve an object by its key.
    ///
    /// # Errors
    ///
    /// Returns an error if the key doesn't exist (the message should contain
    /// "object not found"), the key is empty, or an I/O error occurs.
    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>>;

    /// Retrieve `len` bytes of an object starting at byte `offset`.
    ///
    /// A zero-length range returns an empty buffer without touching the
    /// store. Reading past the end of the object is an error.
    async fn get_range(&self, key: &str, offset: u64, len: u64) -> anyhow::Result<Vec<u8>>;

    /// Open an object as a stream of chunks.
    async fn get_stream(&self, key: &str) -> anyhow::Result<ByteStream<'static>>;

    /// Store an object with the given key, overwriting any previous data.
    async fn put(&self, key: &str, data: &[u8]) -> anyhow::Result<()>;

    /// Store an object from a stream of chunks whose total length is not
    /// known in advance.
    ///
    /// If the stream yields an error the partial upload is abandoned and the
    /// error is returned; the key must not be left holding partial data that
    /// a later `get` would observe as complete.
    async fn put_stream(&self, key: &str, data: ByteStream<'_>) -> anyhow::Result<()>;

    /// Check if an object exists.
    ///
    /// A missing object is `Ok(false)`, not an error; only I/O or permission
    /// failures are propagated.
    async fn exists(&self, key: &str) -> anyhow::Result<bool>;

    /// Copy an object to another key within the same store.
    async fn copy(&self, from: &str, to: &str) -> anyhow::Result<()>;

    /// Delete an object. Idempotent: deleting a non-existent key succeeds.
    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// List keys with a given prefix, sorted, across however many pages the
    /// store needs.
    async fn list_objects(&self, prefix: &str) -> anyhow::Result<Vec<String>>;

    /// Delete every key under a prefix.
    ///
    /// The default implementation lists and deletes one key at a time;
    /// backends with a batch-delete API should override it.
    async fn delete_prefix(&self, prefix: &str) -> anyhow::Result<()> {
        for key in self.list_objects(prefix).await? {
            self.delete(&key).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trait_is_object_safe() {
        fn _check_object_safe(_: &dyn StorageBackend) {}
    }
}
