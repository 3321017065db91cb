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

//! Cursor over a lazy sequence of byte chunks
//!
//! [`ByteReader`] exposes the three primitives the pack parser is built on:
//! exact reads, lazy chunk-at-a-time reads, and `return_unused`, a rewind
//! inside the current chunk that lets the zlib inflater hand back the tail
//! bytes it pulled past the end of a deflate stream.

use crate::error::PackError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use tokio::sync::mpsc;

/// A lazy source of non-empty byte chunks
///
/// `Ok(None)` is end-of-stream. Implementations must not yield empty chunks.
#[async_trait]
pub trait ChunkSource: Send {
    /// Pull the next chunk, or `None` at end-of-stream
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, PackError>;
}

/// Chunk source over an in-memory sequence; used by tests and for replaying
/// already-buffered bytes through parser code.
#[derive(Debug, Default)]
pub struct SliceSource {
    chunks: VecDeque<Bytes>,
}

impl SliceSource {
    /// Build a source that yields the given chunks in order
    pub fn new<I>(chunks: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Bytes>,
    {
        SliceSource {
            chunks: chunks.into_iter().map(Into::into).collect(),
        }
    }

    /// Build a source that yields one chunk
    pub fn single(data: impl Into<Bytes>) -> Self {
        Self::new([data.into()])
    }
}

#[async_trait]
impl ChunkSource for SliceSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, PackError> {
        loop {
            match self.chunks.pop_front() {
                Some(c) if c.is_empty() => continue,
                other => return Ok(other),
            }
        }
    }
}

/// Chunk source over a bounded channel; the parser pumps one object's
/// payload through such a channel to the worker that uploads it.
#[derive(Debug)]
pub struct ChannelSource {
    rx: mpsc::Receiver<Bytes>,
}

impl ChannelSource {
    /// Wrap a payload receiver
    pub fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        ChannelSource { rx }
    }
}

#[async_trait]
impl ChunkSource for ChannelSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, PackError> {
        loop {
            match self.rx.recv().await {
                Some(c) if c.is_empty() => continue,
                other => return Ok(other),
            }
        }
    }
}

/// Cursor over a [`ChunkSource`]
#[derive(Debug)]
pub struct ByteReader<S> {
    source: S,
    chunk: Bytes,
    offset: usize,
}

impl<S: ChunkSource> ByteReader<S> {
    /// Wrap a chunk source with an empty cursor
    pub fn new(source: S) -> Self {
        ByteReader {
            source,
            chunk: Bytes::new(),
            offset: 0,
        }
    }

    /// Ensure the current chunk has unread bytes; `false` at end-of-stream.
    async fn refill(&mut self) -> Result<bool, PackError> {
        while self.offset == self.chunk.len() {
            match self.source.next_chunk().await? {
                Some(chunk) => {
                    self.chunk = chunk;
                    self.offset = 0;
                }
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Read exactly `n` bytes, failing with [`PackError::Truncated`] if the
    /// stream ends first.
    pub async fn read_exact(&mut self, n: usize) -> Result<Bytes, PackError> {
        if !self.refill().await? {
            return if n == 0 { Ok(Bytes::new()) } else { Err(PackError::Truncated) };
        }
        // Fast path: the whole read sits inside the current chunk.
        if self.chunk.len() - self.offset >= n {
            let out = self.chunk.slice(self.offset..self.offset + n);
            self.offset += n;
            return Ok(out);
        }

        let mut out = BytesMut::with_capacity(n);
        let mut needed = n;
        while needed > 0 {
            if !self.refill().await? {
                return Err(PackError::Truncated);
            }
            let take = needed.min(self.chunk.len() - self.offset);
            out.extend_from_slice(&self.chunk[self.offset..self.offset + take]);
            self.offset += take;
            needed -= take;
        }
        Ok(out.freeze())
    }

    /// Read a single byte
    pub async fn read_u8(&mut self) -> Result<u8, PackError> {
        let b = self.read_exact(1).await?;
        Ok(b[0])
    }

    /// Read a big-endian u32
    pub async fn read_u32_be(&mut self) -> Result<u32, PackError> {
        let b = self.read_exact(4).await?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Lazy read: the unread remainder of the current chunk, or the next
    /// chunk. Fails with [`PackError::Truncated`] at end-of-stream; callers
    /// that expect the end use [`ByteReader::try_next_slice`].
    pub async fn next_slice(&mut self) -> Result<Bytes, PackError> {
        self.try_next_slice().await?.ok_or(PackError::Truncated)
    }

    /// Lazy read that reports end-of-stream as `None`
    pub async fn try_next_slice(&mut self) -> Result<Option<Bytes>, PackError> {
        if !self.refill().await? {
            return Ok(None);
        }
        let out = self.chunk.slice(self.offset..);
        self.offset = self.chunk.len();
        Ok(Some(out))
    }

    /// Logically rewind the cursor by `n` bytes.
    ///
    /// The rewound bytes must lie inside the most recently surfaced chunk;
    /// this is how the inflater returns the unused tail of its final input
    /// slice.
    pub fn return_unused(&mut self, n: usize) {
        debug_assert!(n <= self.offset, "rewind past the current chunk");
        self.offset -= n;
    }

    /// Consume the source to its end, returning how many unread bytes were
    /// discarded.
    pub async fn drain(&mut self) -> Result<u64, PackError> {
        let mut total = 0u64;
        while let Some(slice) = self.try_next_slice().await? {
            total += slice.len() as u64;
        }
        Ok(total)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_exact_across_chunks() {
        let source = SliceSource::new([&b"ab"[..], &b"cde"[..], &b"f"[..]]);
        let mut reader = ByteReader::new(source);
        assert_eq!(&reader.read_exact(4).await.unwrap()[..], b"abcd");
        assert_eq!(&reader.read_exact(2).await.unwrap()[..], b"ef");
    }

    #[tokio::test]
    async fn read_exact_truncated() {
        let mut reader = ByteReader::new(SliceSource::single(&b"abc"[..]));
        let err = reader.read_exact(4).await.unwrap_err();
        assert!(matches!(err, PackError::Truncated));
    }

    #[tokio::test]
    async fn return_unused_rewinds_within_chunk() {
        let mut reader = ByteReader::new(SliceSource::single(&b"abcdef"[..]));
        let slice = reader.next_slice().await.unwrap();
        assert_eq!(&slice[..], b"abcdef");
        reader.return_unused(2);
        assert_eq!(&reader.read_exact(2).await.unwrap()[..], b"ef");
    }

    #[tokio::test]
    async fn next_slice_preserves_chunk_boundaries() {
        let source = SliceSource::new([&b"ab"[..], &b"cd"[..]]);
        let mut reader = ByteReader::new(source);
        assert_eq!(&reader.next_slice().await.unwrap()[..], b"ab");
        assert_eq!(&reader.next_slice().await.unwrap()[..], b"cd");
        assert!(reader.try_next_slice().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_chunks_are_skipped() {
        let source = SliceSource::new([&b""[..], &b"xy"[..], &b""[..]]);
        let mut reader = ByteReader::new(source);
        assert_eq!(&reader.read_exact(2).await.unwrap()[..], b"xy");
    }

    #[tokio::test]
    async fn drain_counts_leftovers() {
        let source = SliceSource::new([&b"abc"[..], &b"de"[..]]);
        let mut reader = ByteReader::new(source);
        reader.read_exact(1).await.unwrap();
        assert_eq!(reader.drain().await.unwrap(), 4);
        assert_eq!(reader.drain().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn channel_source_yields_until_closed() {
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(async move {
            tx.send(Bytes::from_static(b"one")).await.unwrap();
            tx.send(Bytes::from_static(b"two")).await.unwrap();
        });
        let mut reader = ByteReader::new(ChannelSource::new(rx));
        assert_eq!(&reader.read_exact(6).await.unwrap()[..], b"onetwo");
        handle.await.unwrap();
        assert!(reader.try_next_slice().await.unwrap().is_none());
    }
}
