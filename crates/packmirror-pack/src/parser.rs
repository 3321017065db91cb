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

//! Pack stream parser
//!
//! Consumes the reply to a `git-upload-pack` fetch: the `NAK` pkt-line,
//! the `PACK` header, then one entry per announced object, and finally the
//! 20-byte trailer. Entries are surfaced one at a time and each payload
//! must be fully drained (via [`PackParser::stream_payload`]) before the
//! next entry is requested; that discipline is what keeps the underlying
//! HTTP body consumed linearly while workers do blocking storage I/O.

use crate::error::PackError;
use crate::object::{ObjectId, ObjectKind};
use crate::reader::{ByteReader, ChunkSource};
use crate::zlib::Inflater;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

/// Pack type nibble for an offset-delta, which this mirror rejects.
const OBJ_OFS_DELTA: u8 = 6;
/// Pack type nibble for a ref-delta.
const OBJ_REF_DELTA: u8 = 7;

/// What a pack entry holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackEntryKind {
    /// A complete object of the given kind
    Full(ObjectKind),
    /// A delta against the object with the given id
    RefDelta(ObjectId),
}

/// One object descriptor from the pack
#[derive(Debug, Clone, Copy)]
pub struct PackEntry {
    /// Full object or ref-delta
    pub kind: PackEntryKind,
    /// Expanded length of the payload in bytes
    pub size: u64,
}

/// Streaming parser over a pack reply
#[derive(Debug)]
pub struct PackParser<S> {
    reader: ByteReader<S>,
    total: u32,
    remaining: u32,
}

impl<S: ChunkSource> PackParser<S> {
    /// Read the reply framing and pack header, leaving the parser
    /// positioned at the first object.
    pub async fn begin(source: S) -> Result<Self, PackError> {
        let mut reader = ByteReader::new(source);

        // The fetch reply opens with a pkt-line acknowledgement.
        let len_digits = reader.read_exact(4).await?;
        let frame_len = parse_pkt_len(&len_digits)?;
        if frame_len < 4 {
            return Err(PackError::protocol(format!(
                "pkt-line length {frame_len} too short"
            )));
        }
        let frame = reader.read_exact(frame_len - 4).await?;
        if &frame[..] != b"NAK\n" {
            return Err(PackError::protocol(format!(
                "expected NAK acknowledgement, got {:?}",
                String::from_utf8_lossy(&frame)
            )));
        }

        let signature = reader.read_exact(4).await?;
        if &signature[..] != b"PACK" {
            return Err(PackError::protocol("missing PACK signature"));
        }
        let version = reader.read_u32_be().await?;
        if version != 2 {
            return Err(PackError::protocol(format!(
                "unsupported pack version {version}"
            )));
        }
        let total = reader.read_u32_be().await?;
        debug!("pack stream announces {} objects", total);

        Ok(PackParser {
            reader,
            total,
            remaining: total,
        })
    }

    /// Number of objects the pack header announced
    pub fn object_count(&self) -> u32 {
        self.total
    }

    /// Read the next object's descriptor, or `None` after the last one.
    ///
    /// The previous entry's payload must already be drained.
    pub async fn next_entry(&mut self) -> Result<Option<PackEntry>, PackError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;

        let (type_nibble, size) = self.read_object_header().await?;
        let kind = match type_nibble {
            OBJ_OFS_DELTA => return Err(PackError::Unsupported(OBJ_OFS_DELTA)),
            OBJ_REF_DELTA => {
                let base = self.reader.read_exact(20).await?;
                PackEntryKind::RefDelta(ObjectId::from_slice(&base)?)
            }
            t => match ObjectKind::from_pack_type(t) {
                Some(kind) => PackEntryKind::Full(kind),
                None => {
                    return Err(PackError::protocol(format!(
                        "invalid pack object type {t}"
                    )))
                }
            },
        };

        Ok(Some(PackEntry { kind, size }))
    }

    /// Inflate the current entry's payload, pushing expanded chunks into
    /// `tx`, and verify exactly `declared` bytes come out.
    ///
    /// If the receiving side goes away the remaining payload is still
    /// inflated and discarded, so the parser stays positioned at the next
    /// entry.
    pub async fn stream_payload(
        &mut self,
        declared: u64,
        tx: &mpsc::Sender<Bytes>,
    ) -> Result<(), PackError> {
        let mut inflater = Inflater::new();
        let mut produced: u64 = 0;
        let mut discard = false;

        'stream: loop {
            let slice = self.reader.next_slice().await?;
            let mut consumed = 0;
            loop {
                let step = inflater.inflate(&slice[consumed..])?;
                consumed += step.consumed;
                let step_consumed = step.consumed;
                let step_finished = step.finished;
                let output_was_empty = step.output.is_empty();
                if !output_was_empty {
                    produced += step.output.len() as u64;
                    if !discard && tx.send(Bytes::from(step.output)).await.is_err() {
                        debug!("payload receiver dropped; draining object");
                        discard = true;
                    }
                }
                if step_finished {
                    // The deflate stream ended inside this slice; hand the
                    // tail back so the next header read sees it.
                    self.reader.return_unused(slice.len() - consumed);
                    break 'stream;
                }
                if step_consumed == 0 && output_was_empty {
                    if consumed < slice.len() {
                        return Err(PackError::protocol("zlib inflater stalled mid-slice"));
                    }
                    break;
                }
            }
        }

        if produced != declared {
            return Err(PackError::IntegrityMismatch {
                declared,
                produced,
            });
        }
        Ok(())
    }

    /// Read and discard the 20-byte pack trailer.
    pub async fn finish(&mut self) -> Result<(), PackError> {
        if self.remaining != 0 {
            return Err(PackError::protocol(format!(
                "{} announced objects were never read",
                self.remaining
            )));
        }
        let _trailer = self.reader.read_exact(20).await?;
        Ok(())
    }

    /// Variable-length object header: 3-bit type and 4 low size bits in the
    /// first byte, then 7-bit continuation groups.
    async fn read_object_header(&mut self) -> Result<(u8, u64), PackError> {
        let mut b = self.reader.read_u8().await?;
        let type_nibble = (b >> 4) & 7;
        let mut size = (b & 0x0f) as u64;
        let mut shift = 4u32;
        while b & 0x80 != 0 {
            b = self.reader.read_u8().await?;
            if shift >= 64 {
                return Err(PackError::protocol("object size varint too long"));
            }
            size |= ((b & 0x7f) as u64) << shift;
            shift += 7;
        }
        Ok((type_nibble, size))
    }
}

fn parse_pkt_len(digits: &[u8]) -> Result<usize, PackError> {
    let text = std::str::from_utf8(digits)
        .map_err(|_| PackError::protocol("pkt-line length is not ASCII hex"))?;
    usize::from_str_radix(text, 16)
        .map_err(|_| PackError::protocol(format!("pkt-line length is not hex: {text:?}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::reader::SliceSource;

    fn zlib_compress(data: &[u8]) -> Vec<u8> {
        use std::io::Write;
        let mut enc =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn object_header(type_nibble: u8, mut size: u64) -> Vec<u8> {
        let mut out = Vec::new();
        let mut b = (type_nibble << 4) | (size & 0x0f) as u8;
        size >>= 4;
        while size > 0 {
            out.push(b | 0x80);
            b = (size & 0x7f) as u8;
            size >>= 7;
        }
        out.push(b);
        out
    }

    /// Assemble a NAK-framed reply: header, raw entries, zeroed trailer.
    fn build_reply(count: u32, entries: &[Vec<u8>]) -> Vec<u8> {
        let mut reply = b"0008NAK\n".to_vec();
        reply.extend_from_slice(b"PACK");
        reply.extend_from_slice(&2u32.to_be_bytes());
        reply.extend_from_slice(&count.to_be_bytes());
        for entry in entries {
            reply.extend_from_slice(entry);
        }
        reply.extend_from_slice(&[0u8; 20]);
        reply
    }

    fn full_entry(type_nibble: u8, payload: &[u8]) -> Vec<u8> {
        let mut entry = object_header(type_nibble, payload.len() as u64);
        entry.extend_from_slice(&zlib_compress(payload));
        entry
    }

    async fn collect_payload<S: ChunkSource>(
        parser: &mut PackParser<S>,
        declared: u64,
    ) -> Vec<u8> {
        let (tx, mut rx) = mpsc::channel(1024);
        parser.stream_payload(declared, &tx).await.unwrap();
        drop(tx);
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn parses_two_blobs_back_to_back() {
        let reply = build_reply(
            2,
            &[full_entry(3, b"first object"), full_entry(1, b"tree 0\n")],
        );
        // Brutal chunking: one byte at a time.
        let chunks: Vec<Vec<u8>> = reply.iter().map(|b| vec![*b]).collect();
        let mut parser = PackParser::begin(SliceSource::new(chunks)).await.unwrap();
        assert_eq!(parser.object_count(), 2);

        let first = parser.next_entry().await.unwrap().unwrap();
        assert_eq!(first.kind, PackEntryKind::Full(ObjectKind::Blob));
        assert_eq!(first.size, 12);
        assert_eq!(collect_payload(&mut parser, first.size).await, b"first object");

        let second = parser.next_entry().await.unwrap().unwrap();
        assert_eq!(second.kind, PackEntryKind::Full(ObjectKind::Commit));
        assert_eq!(collect_payload(&mut parser, second.size).await, b"tree 0\n");

        assert!(parser.next_entry().await.unwrap().is_none());
        parser.finish().await.unwrap();
    }

    #[tokio::test]
    async fn surfaces_ref_delta_base_id() {
        let base_id = [0xabu8; 20];
        let mut entry = object_header(7, 4);
        entry.extend_from_slice(&base_id);
        entry.extend_from_slice(&zlib_compress(b"dddd"));
        let reply = build_reply(1, &[entry]);

        let mut parser = PackParser::begin(SliceSource::single(reply)).await.unwrap();
        let got = parser.next_entry().await.unwrap().unwrap();
        match got.kind {
            PackEntryKind::RefDelta(id) => assert_eq!(id.as_bytes(), &base_id),
            other => panic!("expected ref-delta, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_offset_delta() {
        let mut entry = object_header(6, 4);
        entry.extend_from_slice(&zlib_compress(b"xxxx"));
        let reply = build_reply(1, &[entry]);

        let mut parser = PackParser::begin(SliceSource::single(reply)).await.unwrap();
        let err = parser.next_entry().await.unwrap_err();
        assert!(matches!(err, PackError::Unsupported(6)));
    }

    #[tokio::test]
    async fn rejects_wrong_version() {
        let mut reply = b"0008NAK\n".to_vec();
        reply.extend_from_slice(b"PACK");
        reply.extend_from_slice(&3u32.to_be_bytes());
        reply.extend_from_slice(&0u32.to_be_bytes());

        let err = PackParser::begin(SliceSource::single(reply)).await.unwrap_err();
        assert!(matches!(err, PackError::Protocol(_)));
    }

    #[tokio::test]
    async fn rejects_missing_nak() {
        let reply = b"0007ACK".to_vec();
        let err = PackParser::begin(SliceSource::single(reply)).await.unwrap_err();
        assert!(matches!(err, PackError::Protocol(_)));
    }

    #[tokio::test]
    async fn truncated_mid_payload() {
        let mut reply = build_reply(1, &[full_entry(3, &vec![9u8; 4096])]);
        reply.truncate(reply.len() - 30); // cut into the compressed payload

        let mut parser = PackParser::begin(SliceSource::single(reply)).await.unwrap();
        let entry = parser.next_entry().await.unwrap().unwrap();
        let (tx, _rx) = mpsc::channel(1024);
        let err = parser.stream_payload(entry.size, &tx).await.unwrap_err();
        assert!(matches!(err, PackError::Truncated));
    }

    #[tokio::test]
    async fn length_mismatch_is_integrity_error() {
        let mut entry = object_header(3, 99); // lies about the size
        entry.extend_from_slice(&zlib_compress(b"short"));
        let reply = build_reply(1, &[entry]);

        let mut parser = PackParser::begin(SliceSource::single(reply)).await.unwrap();
        let entry = parser.next_entry().await.unwrap().unwrap();
        let (tx, _rx) = mpsc::channel(1024);
        let err = parser.stream_payload(entry.size, &tx).await.unwrap_err();
        assert!(matches!(
            err,
            PackError::IntegrityMismatch { declared: 99, produced: 5 }
        ));
    }

    #[tokio::test]
    async fn payload_drained_even_if_receiver_gone() {
        let reply = build_reply(
            2,
            &[full_entry(3, b"abandoned"), full_entry(3, b"wanted")],
        );
        let mut parser = PackParser::begin(SliceSource::single(reply)).await.unwrap();

        let first = parser.next_entry().await.unwrap().unwrap();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        parser.stream_payload(first.size, &tx).await.unwrap();

        // The stream position must still be exact for the second object.
        let second = parser.next_entry().await.unwrap().unwrap();
        assert_eq!(collect_payload(&mut parser, second.size).await, b"wanted");
        parser.finish().await.unwrap();
    }
}
