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

//! Streaming zlib, both directions
//!
//! [`Inflater`] decompresses one input slice at a time and reports exactly
//! how much of the slice it consumed, so the caller can return the unused
//! tail to its [`ByteReader`](crate::reader::ByteReader) when the deflate
//! stream ends mid-slice. [`Deflater`] is the writing counterpart used to
//! produce canonical loose objects.

use crate::error::PackError;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

/// Scratch buffer size for one decode/encode round.
const OUT_BUF: usize = 32 * 1024;

/// One round of decompression
#[derive(Debug)]
pub struct InflateStep {
    /// Bytes of the input slice consumed this round
    pub consumed: usize,
    /// Bytes produced this round (possibly empty)
    pub output: Vec<u8>,
    /// Whether the deflate stream ended during this round
    pub finished: bool,
}

/// Streaming zlib decompressor
///
/// One input slice may need several [`Inflater::inflate`] rounds before it
/// is fully consumed; conversely a round may produce no output at all.
/// Callers loop until `consumed` covers the slice or `finished` is set,
/// then hand `slice_len - consumed_total` back to the reader.
pub struct Inflater {
    z: Decompress,
}

impl Inflater {
    /// Fresh decompressor expecting a zlib header
    pub fn new() -> Self {
        Inflater {
            z: Decompress::new(true),
        }
    }

    /// Decompress one round from `input`.
    pub fn inflate(&mut self, input: &[u8]) -> Result<InflateStep, PackError> {
        let mut output = vec![0u8; OUT_BUF];
        let before_in = self.z.total_in();
        let before_out = self.z.total_out();
        let status = self.z.decompress(input, &mut output, FlushDecompress::None)?;
        let consumed = (self.z.total_in() - before_in) as usize;
        let produced = (self.z.total_out() - before_out) as usize;
        output.truncate(produced);
        Ok(InflateStep {
            consumed,
            output,
            finished: status == Status::StreamEnd,
        })
    }
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}

/// Streaming zlib compressor at git's default level (6)
pub struct Deflater {
    z: Compress,
}

impl Deflater {
    /// Fresh compressor writing a zlib header
    pub fn new() -> Self {
        Deflater {
            z: Compress::new(Compression::new(6), true),
        }
    }

    /// Compress a whole input slice, returning whatever output it yields.
    pub fn push(&mut self, input: &[u8]) -> Result<Vec<u8>, PackError> {
        let mut out = Vec::new();
        let mut consumed_total = 0;
        while consumed_total < input.len() {
            let mut buf = vec![0u8; OUT_BUF];
            let before_in = self.z.total_in();
            let before_out = self.z.total_out();
            self.z
                .compress(&input[consumed_total..], &mut buf, FlushCompress::None)?;
            let consumed = (self.z.total_in() - before_in) as usize;
            let produced = (self.z.total_out() - before_out) as usize;
            buf.truncate(produced);
            out.extend_from_slice(&buf);
            consumed_total += consumed;
            if consumed == 0 && produced == 0 {
                return Err(PackError::source(anyhow::anyhow!(
                    "zlib compressor made no progress"
                )));
            }
        }
        Ok(out)
    }

    /// Flush the stream to its end and return the trailing output.
    pub fn finish(&mut self) -> Result<Vec<u8>, PackError> {
        let mut out = Vec::new();
        loop {
            let mut buf = vec![0u8; OUT_BUF];
            let before_out = self.z.total_out();
            let status = self.z.compress(&[], &mut buf, FlushCompress::Finish)?;
            let produced = (self.z.total_out() - before_out) as usize;
            buf.truncate(produced);
            out.extend_from_slice(&buf);
            if status == Status::StreamEnd {
                return Ok(out);
            }
            if produced == 0 {
                return Err(PackError::source(anyhow::anyhow!(
                    "zlib compressor stalled while finishing"
                )));
            }
        }
    }
}

impl Default for Deflater {
    fn default() -> Self {
        Self::new()
    }
}
