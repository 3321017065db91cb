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

//! Streaming git pack-file parsing
//!
//! This crate turns the compressed HTTP body of a `git-upload-pack` fetch
//! into a sequence of object descriptors and their expanded payloads,
//! without ever holding a whole pack (or a whole object) in memory.
//!
//! The pieces compose bottom-up:
//!
//! - [`reader::ByteReader`] adapts a lazy sequence of byte chunks (a
//!   [`reader::ChunkSource`]) into exact reads, lazy chunk reads, and,
//!   crucially, a `return_unused` rewind so a decompressor can hand back
//!   the tail bytes it over-read.
//! - [`zlib::Inflater`] wraps a raw zlib state machine; one input slice may
//!   take several decode rounds, and the slice bytes past the end of the
//!   deflate stream are surrendered to the reader.
//! - [`parser::PackParser`] reads the reply framing and pack header, then
//!   yields one entry at a time; the caller must fully drain each payload
//!   before asking for the next, which is what keeps consumption of the
//!   underlying body strictly linear.
//! - [`delta`] decodes the copy/insert instruction stream used by
//!   ref-delta objects.
//!
//! Object identity ([`object::ObjectId`]) is the SHA-1 of the canonical
//! `"<type> <length>\0"` header followed by the expanded bytes.

pub mod delta;
pub mod error;
pub mod object;
pub mod parser;
pub mod reader;
pub mod zlib;

pub use delta::{read_delta_instruction, read_varint, DeltaInstruction};
pub use error::{PackError, PackResult};
pub use object::{ObjectHasher, ObjectId, ObjectKind};
pub use parser::{PackEntry, PackEntryKind, PackParser};
pub use reader::{ByteReader, ChannelSource, ChunkSource, SliceSource};
pub use zlib::{Deflater, Inflater};
