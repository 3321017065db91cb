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

//! Git LFS support for PackMirror
//!
//! Large files tracked with Git LFS appear in the pack stream as small
//! pointer blobs; the payloads live behind a separate batch API. This
//! crate provides the three pieces the mirror needs:
//!
//! - [`LfsPointer`]: parse and render the three-line pointer format, plus a
//!   cheap prefix check ([`LfsPointer::is_pointer`]) the uploader runs on
//!   the first bytes of every blob.
//! - [`BatchClient`]: negotiate a download URL from the source's
//!   `info/lfs/objects/batch` endpoint.
//! - [`fetch_to_storage`]: stream a payload into the destination object
//!   store at `lfs/objects/<aa>/<bb>/<oid>`, skipping payloads already
//!   present so repeated mirrors stay idempotent.

pub mod batch;
pub mod error;
pub mod pointer;
pub mod transfer;

pub use batch::BatchClient;
pub use error::{LfsError, LfsResult};
pub use pointer::{LfsPointer, POINTER_VERSION};
pub use transfer::fetch_to_storage;
