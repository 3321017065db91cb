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

//! In-memory mock storage backend for testing
//!
//! Provides a thread-safe, in-memory implementation of
//! [`StorageBackend`](crate::StorageBackend) using `Arc<RwLock<HashMap>>`
//! for concurrent access. Mirror-engine tests run entire mirrors against
//! this backend and then assert on the resulting key layout.

use crate::error::StorageError;
use crate::{ByteStream, StorageBackend};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory mock storage backend for testing
///
/// Thread-safe implementation suitable for unit and integration tests.
///
/// # Examples
///
/// ```rust,no_run
/// use packmirror_storage::{StorageBackend, mock::MockBackend};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let storage = MockBackend::new();
///     storage.put("test.bin", b"hello world").await?;
///     assert_eq!(storage.get("test.bin").await?, b"hello world");
///     Ok(())
/// }
/// ```
#[derive(Clone, Default)]
pub struct MockBackend {
    store: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MockBackend {
    /// Create a new empty mock storage backend
    pub fn new() -> Self {
        MockBackend {
            store: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create a mock storage backend with initial data
    pub fn with_data(initial_data: HashMap<String, Vec<u8>>) -> Self {
        MockBackend {
            store: Arc::new(RwLock::new(initial_data)),
        }
    }

    /// Get the current number of objects stored
    pub async fn len(&self) -> usize {
        self.store.read().await.len()
    }

    /// Check whether no objects are stored
    pub async fn is_empty(&self) -> bool {
        self.store.read().await.is_empty()
    }
}

impl fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockBackend").finish()
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        let store = self.store.read().await;
        store
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::not_found(key).into())
    }

    async fn get_range(&self, key: &str, offset: u64, len: u64) -> anyhow::Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let store = self.store.read().await;
        let data = store
            .get(key)
            .ok_or_else(|| StorageError::not_found(key))?;
        let start = usize::try_from(offset).map_err(|_| StorageError::RangeOutOfBounds {
            key: key.to_string(),
            offset,
            len,
        })?;
        let end = start.checked_add(len as usize).filter(|e| *e <= data.len());
        match end {
            Some(end) => Ok(data[start..end].to_vec()),
            None => Err(StorageError::RangeOutOfBounds {
                key: key.to_string(),
                offset,
                len,
            }
            .into()),
        }
    }

    async fn get_stream(&self, key: &str) -> anyhow::Result<ByteStream<'static>> {
        let data = self.get(key).await?;
        let chunk = Bytes::from(data);
        let body = futures::stream::once(async move { Ok::<_, anyhow::Error>(chunk) });
        Ok(Box::pin(body))
    }

    async fn put(&self, key: &str, data: &[u8]) -> anyhow::Result<()> {
        if key.is_empty() {
            return Err(StorageError::invalid_key("key cannot be empty").into());
        }
        let mut store = self.store.write().await;
        store.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn put_stream(&self, key: &str, mut data: ByteStream<'_>) -> anyhow::Result<()> {
        // Collect fully before inserting so a failing stream leaves no key.
        let mut buf = Vec::new();
        while let Some(chunk) = data.next().await {
            buf.extend_from_slice(&chunk?);
        }
        self.put(key, &buf).await
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.store.read().await.contains_key(key))
    }

    async fn copy(&self, from: &str, to: &str) -> anyhow::Result<()> {
        let data = self.get(from).await?;
        self.put(to, &data).await
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let mut store = self.store.write().await;
        store.remove(key);
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let store = self.store.read().await;
        let mut keys: Vec<String> = store
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let storage = MockBackend::new();
        storage.put("a/b", b"payload").await.unwrap();
        assert_eq!(storage.get("a/b").await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let storage = MockBackend::new();
        let err = storage.get("missing").await.unwrap_err();
        assert!(err.to_string().contains("object not found"));
    }

    #[tokio::test]
    async fn test_get_range() {
        let storage = MockBackend::new();
        storage.put("k", b"0123456789").await.unwrap();
        assert_eq!(storage.get_range("k", 2, 3).await.unwrap(), b"234");
        assert_eq!(storage.get_range("k", 0, 10).await.unwrap(), b"0123456789");
        assert!(storage.get_range("k", 8, 3).await.is_err());
        assert!(storage.get_range("k", 0, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_put_stream_collects_chunks() {
        let storage = MockBackend::new();
        let chunks: Vec<anyhow::Result<Bytes>> =
            vec![Ok(Bytes::from_static(b"he")), Ok(Bytes::from_static(b"llo"))];
        storage
            .put_stream("streamed", Box::pin(futures::stream::iter(chunks)))
            .await
            .unwrap();
        assert_eq!(storage.get("streamed").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_put_stream_error_leaves_no_key() {
        let storage = MockBackend::new();
        let chunks: Vec<anyhow::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"he")),
            Err(anyhow::anyhow!("source died")),
        ];
        let result = storage
            .put_stream("broken", Box::pin(futures::stream::iter(chunks)))
            .await;
        assert!(result.is_err());
        assert!(!storage.exists("broken").await.unwrap());
    }

    #[tokio::test]
    async fn test_copy_and_delete() {
        let storage = MockBackend::new();
        storage.put("src", b"data").await.unwrap();
        storage.copy("src", "dst").await.unwrap();
        assert_eq!(storage.get("dst").await.unwrap(), b"data");

        storage.delete("src").await.unwrap();
        assert!(!storage.exists("src").await.unwrap());
        // Idempotent
        storage.delete("src").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let storage = MockBackend::new();
        storage.put("tmp/a", b"1").await.unwrap();
        storage.put("tmp/b/c", b"2").await.unwrap();
        storage.put("keep/d", b"3").await.unwrap();

        storage.delete_prefix("tmp/").await.unwrap();

        assert_eq!(storage.len().await, 1);
        assert!(storage.exists("keep/d").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_objects_sorted() {
        let storage = MockBackend::new();
        storage.put("p/b", b"").await.unwrap();
        storage.put("p/a", b"").await.unwrap();
        storage.put("q/c", b"").await.unwrap();

        let keys = storage.list_objects("p/").await.unwrap();
        assert_eq!(keys, vec!["p/a".to_string(), "p/b".to_string()]);
    }
}
