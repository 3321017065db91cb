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

//! Streaming ref-delta resolution
//!
//! A [`DeltaSource`] consumes a delta payload (arriving through the parser's
//! single-slot channel) and yields the reconstructed target object chunk by
//! chunk: copy instructions become ranged reads against the base's raw copy
//! in storage, inserts are forwarded verbatim. The target never exists in
//! memory as a whole, so a delta against a multi-gigabyte base costs only
//! the windows the instructions actually touch.

use crate::error::MirrorError;
use async_trait::async_trait;
use bytes::Bytes;
use packmirror_pack::{
    read_delta_instruction, read_varint, ByteReader, ChannelSource, ChunkSource, DeltaInstruction,
    PackError,
};
use packmirror_storage::StorageBackend;
use tokio::sync::mpsc;
use tracing::trace;

/// Reconstructed-object byte source backed by a delta stream and the base's
/// raw copy in storage.
pub struct DeltaSource<'a> {
    storage: &'a dyn StorageBackend,
    base_key: String,
    reader: ByteReader<ChannelSource>,
    remaining: u64,
    drained: bool,
}

impl<'a> DeltaSource<'a> {
    /// Decode the leading base/target sizes and return the source along
    /// with the target's expanded length.
    pub async fn open(
        storage: &'a dyn StorageBackend,
        base_key: String,
        payload: mpsc::Receiver<Bytes>,
    ) -> Result<(DeltaSource<'a>, u64), MirrorError> {
        let mut reader = ByteReader::new(ChannelSource::new(payload));
        let base_size = read_varint(&mut reader).await?;
        let target_size = read_varint(&mut reader).await?;
        trace!(base_size, target_size, "opening delta against {}", base_key);

        Ok((
            DeltaSource {
                storage,
                base_key,
                reader,
                remaining: target_size,
                drained: false,
            },
            target_size,
        ))
    }
}

#[async_trait]
impl ChunkSource for DeltaSource<'_> {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, PackError> {
        if self.remaining == 0 {
            if !self.drained {
                self.drained = true;
                // Release the upstream reader: the parser is blocked until
                // every byte of the delta payload has been consumed.
                self.reader.drain().await?;
            }
            return Ok(None);
        }

        match read_delta_instruction(&mut self.reader).await? {
            DeltaInstruction::Copy { offset, size } => {
                if size > self.remaining {
                    return Err(PackError::protocol(format!(
                        "copy of {size} bytes overruns the {} remaining target bytes",
                        self.remaining
                    )));
                }
                let window = self
                    .storage
                    .get_range(&self.base_key, offset, size)
                    .await
                    .map_err(PackError::source)?;
                self.remaining -= size;
                Ok(Some(Bytes::from(window)))
            }
            DeltaInstruction::Insert { len } => {
                if len as u64 > self.remaining {
                    return Err(PackError::protocol(format!(
                        "insert of {len} bytes overruns the {} remaining target bytes",
                        self.remaining
                    )));
                }
                let literal = self.reader.read_exact(len).await?;
                self.remaining -= len as u64;
                Ok(Some(literal))
            }
        }
    }
}
