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

//! Ref-delta instruction stream decoding
//!
//! A delta payload opens with two varint sizes (base, then target) and then
//! carries instructions until target-size bytes have been produced. Each
//! instruction byte either copies a window of the base (high bit set; the
//! low seven bits select which offset/size bytes follow) or inserts that
//! many literal bytes from the stream (high bit clear, non-zero).

use crate::error::PackError;
use crate::reader::{ByteReader, ChunkSource};

/// A decoded delta instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaInstruction {
    /// Copy `size` bytes of the base starting at `offset`
    Copy {
        /// Byte offset into the base object
        offset: u64,
        /// Window length; an encoded size of zero means 65536
        size: u64,
    },
    /// Insert the next `len` literal bytes from the delta stream
    Insert {
        /// Number of literal bytes, 1..=127
        len: usize,
    },
}

/// Read a little-endian base-128 varint (7 value bits per byte, high bit
/// continues). Used for the leading base/target sizes.
pub async fn read_varint<S: ChunkSource>(reader: &mut ByteReader<S>) -> Result<u64, PackError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let b = reader.read_u8().await?;
        if shift >= 64 {
            return Err(PackError::protocol("delta size varint too long"));
        }
        value |= ((b & 0x7f) as u64) << shift;
        shift += 7;
        if b & 0x80 == 0 {
            return Ok(value);
        }
    }
}

/// Read and decode the next instruction byte (plus its operands).
pub async fn read_delta_instruction<S: ChunkSource>(
    reader: &mut ByteReader<S>,
) -> Result<DeltaInstruction, PackError> {
    let instr = reader.read_u8().await?;
    if instr == 0 {
        return Err(PackError::protocol("zero delta instruction byte"));
    }

    if instr & 0x80 != 0 {
        // Copy: bits 0..4 select offset bytes, bits 4..7 select size bytes,
        // both little-endian by presence.
        let mut offset = 0u64;
        for i in 0..4 {
            if instr & (1 << i) != 0 {
                offset |= (reader.read_u8().await? as u64) << (8 * i);
            }
        }
        let mut size = 0u64;
        for i in 0..3 {
            if instr & (0x10 << i) != 0 {
                size |= (reader.read_u8().await? as u64) << (8 * i);
            }
        }
        if size == 0 {
            size = 0x10000;
        }
        Ok(DeltaInstruction::Copy { offset, size })
    } else {
        Ok(DeltaInstruction::Insert {
            len: instr as usize,
        })
    }
}

/// Apply a complete delta held in memory against an in-memory base.
///
/// The streaming resolver reconstructs objects without materialising them;
/// this buffered form serves small deltas and acts as the oracle that
/// streamed reconstruction is checked against in tests.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>, PackError> {
    let mut cursor = delta;

    let base_size = take_varint(&mut cursor)?;
    if base_size != base.len() as u64 {
        return Err(PackError::protocol(format!(
            "delta expects a {base_size}-byte base, have {}",
            base.len()
        )));
    }
    let target_size = take_varint(&mut cursor)?;

    let mut target = Vec::with_capacity(target_size as usize);
    while (target.len() as u64) < target_size {
        let instr = take_byte(&mut cursor)?;
        if instr == 0 {
            return Err(PackError::protocol("zero delta instruction byte"));
        }
        if instr & 0x80 != 0 {
            let mut offset = 0u64;
            for i in 0..4 {
                if instr & (1 << i) != 0 {
                    offset |= (take_byte(&mut cursor)? as u64) << (8 * i);
                }
            }
            let mut size = 0u64;
            for i in 0..3 {
                if instr & (0x10 << i) != 0 {
                    size |= (take_byte(&mut cursor)? as u64) << (8 * i);
                }
            }
            if size == 0 {
                size = 0x10000;
            }
            let start = offset as usize;
            let end = start
                .checked_add(size as usize)
                .filter(|e| *e <= base.len())
                .ok_or_else(|| {
                    PackError::protocol(format!(
                        "copy [{offset}, {offset}+{size}) outside {}-byte base",
                        base.len()
                    ))
                })?;
            target.extend_from_slice(&base[start..end]);
        } else {
            let len = instr as usize;
            if cursor.len() < len {
                return Err(PackError::Truncated);
            }
            target.extend_from_slice(&cursor[..len]);
            cursor = &cursor[len..];
        }
    }

    if target.len() as u64 != target_size {
        return Err(PackError::IntegrityMismatch {
            declared: target_size,
            produced: target.len() as u64,
        });
    }
    Ok(target)
}

fn take_byte(cursor: &mut &[u8]) -> Result<u8, PackError> {
    let (&b, rest) = cursor.split_first().ok_or(PackError::Truncated)?;
    *cursor = rest;
    Ok(b)
}

fn take_varint(cursor: &mut &[u8]) -> Result<u64, PackError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let b = take_byte(cursor)?;
        if shift >= 64 {
            return Err(PackError::protocol("delta size varint too long"));
        }
        value |= ((b & 0x7f) as u64) << shift;
        shift += 7;
        if b & 0x80 == 0 {
            return Ok(value);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::reader::SliceSource;
    use proptest::prelude::*;

    fn encode_varint(mut value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let b = (value & 0x7f) as u8;
            value >>= 7;
            if value > 0 {
                out.push(b | 0x80);
            } else {
                out.push(b);
                return out;
            }
        }
    }

    fn encode_copy(offset: u64, size: u64) -> Vec<u8> {
        let mut instr = 0x80u8;
        let mut operands = Vec::new();
        for i in 0..4 {
            let byte = ((offset >> (8 * i)) & 0xff) as u8;
            if byte != 0 {
                instr |= 1 << i;
                operands.push(byte);
            }
        }
        let encoded_size = if size == 0x10000 { 0 } else { size };
        for i in 0..3 {
            let byte = ((encoded_size >> (8 * i)) & 0xff) as u8;
            if byte != 0 {
                instr |= 0x10 << i;
                operands.push(byte);
            }
        }
        let mut out = vec![instr];
        out.extend_from_slice(&operands);
        out
    }

    #[tokio::test]
    async fn varint_decodes_multi_byte() {
        let mut reader = ByteReader::new(SliceSource::single(encode_varint(300)));
        assert_eq!(read_varint(&mut reader).await.unwrap(), 300);

        let mut reader = ByteReader::new(SliceSource::single(encode_varint(0)));
        assert_eq!(read_varint(&mut reader).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn insert_instruction() {
        let mut reader = ByteReader::new(SliceSource::single(vec![5u8]));
        assert_eq!(
            read_delta_instruction(&mut reader).await.unwrap(),
            DeltaInstruction::Insert { len: 5 }
        );
    }

    #[tokio::test]
    async fn copy_instruction_with_partial_operands() {
        // offset 0x0200 (second byte only), size 0x03
        let mut reader = ByteReader::new(SliceSource::single(vec![0x80 | 0x02 | 0x10, 0x02, 0x03]));
        assert_eq!(
            read_delta_instruction(&mut reader).await.unwrap(),
            DeltaInstruction::Copy {
                offset: 0x0200,
                size: 3
            }
        );
    }

    #[tokio::test]
    async fn copy_size_zero_means_64k() {
        let mut reader = ByteReader::new(SliceSource::single(vec![0x80u8]));
        assert_eq!(
            read_delta_instruction(&mut reader).await.unwrap(),
            DeltaInstruction::Copy {
                offset: 0,
                size: 0x10000
            }
        );
    }

    #[tokio::test]
    async fn zero_instruction_is_rejected() {
        let mut reader = ByteReader::new(SliceSource::single(vec![0u8]));
        let err = read_delta_instruction(&mut reader).await.unwrap_err();
        assert!(matches!(err, PackError::Protocol(_)));
    }

    #[test]
    fn apply_copy_and_insert() {
        let base = b"the quick brown fox";
        let mut delta = encode_varint(base.len() as u64);
        delta.extend_from_slice(&encode_varint(9));
        delta.extend_from_slice(&encode_copy(4, 5)); // "quick"
        delta.push(4); // insert 4 literals
        delta.extend_from_slice(b" fox");

        assert_eq!(apply_delta(base, &delta).unwrap(), b"quick fox");
    }

    #[test]
    fn apply_rejects_wrong_base_size() {
        let mut delta = encode_varint(99);
        delta.extend_from_slice(&encode_varint(0));
        assert!(matches!(
            apply_delta(b"base", &delta),
            Err(PackError::Protocol(_))
        ));
    }

    #[test]
    fn apply_rejects_copy_past_base_end() {
        let base = b"tiny";
        let mut delta = encode_varint(base.len() as u64);
        delta.extend_from_slice(&encode_varint(8));
        delta.extend_from_slice(&encode_copy(2, 8));
        assert!(matches!(
            apply_delta(base, &delta),
            Err(PackError::Protocol(_))
        ));
    }

    proptest! {
        #[test]
        fn varint_roundtrip(value in any::<u64>()) {
            let encoded = encode_varint(value);
            let decoded = tokio_test::block_on(async {
                let mut reader = ByteReader::new(SliceSource::single(encoded));
                read_varint(&mut reader).await.unwrap()
            });
            prop_assert_eq!(decoded, value);
        }

        #[test]
        fn copy_roundtrip(offset in 0u64..=u32::MAX as u64, size in 1u64..=0xffffff) {
            let encoded = encode_copy(offset, size);
            let decoded = tokio_test::block_on(async {
                let mut reader = ByteReader::new(SliceSource::single(encoded));
                read_delta_instruction(&mut reader).await.unwrap()
            });
            prop_assert_eq!(decoded, DeltaInstruction::Copy { offset, size });
        }
    }
}
