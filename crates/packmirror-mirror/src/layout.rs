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

//! Destination key layout
//!
//! Everything a mirror writes lives under one key prefix:
//!
//! ```text
//! <prefix>/objects/<xx>/<rest-38>       canonical loose objects
//! <prefix>/lfs/objects/<aa>/<bb>/<oid>  large-file payloads
//! <prefix>/HEAD                         symbolic head
//! <prefix>/info/refs                    advertised refs, tab-separated
//! <prefix>/mirror_tmp/…                 transient, purged at start and exit
//! <prefix>/mirror_tmp/raw/<hex>         raw object bytes, delta bases
//! ```

use crate::error::MirrorError;
use packmirror_pack::ObjectId;
use url::Url;

/// A parsed `s3://bucket/prefix` mirror target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Target {
    /// Destination bucket
    pub bucket: String,
    /// Key prefix inside the bucket (no leading or trailing slash)
    pub prefix: String,
}

/// Parse a mirror target URL, which must use the `s3` scheme.
pub fn parse_target(target: &str) -> Result<S3Target, MirrorError> {
    let url = Url::parse(target).map_err(|e| MirrorError::Target(format!("{target}: {e}")))?;
    if url.scheme() != "s3" {
        return Err(MirrorError::Target(format!(
            "{target}: expected s3:// scheme, got {}",
            url.scheme()
        )));
    }
    let bucket = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| MirrorError::Target(format!("{target}: missing bucket")))?
        .to_string();
    let prefix = url.path().trim_matches('/').to_string();
    Ok(S3Target { bucket, prefix })
}

/// Key construction for one mirror destination
#[derive(Debug, Clone)]
pub struct Layout {
    prefix: String,
}

impl Layout {
    /// Build a layout rooted at the given prefix (may be empty)
    pub fn new(prefix: impl Into<String>) -> Self {
        Layout {
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    fn key(&self, suffix: &str) -> String {
        if self.prefix.is_empty() {
            suffix.to_string()
        } else {
            format!("{}/{}", self.prefix, suffix)
        }
    }

    /// The root prefix this layout writes under
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Canonical loose-object key: `objects/<xx>/<rest-38>`
    pub fn object_key(&self, id: &ObjectId) -> String {
        let hex = id.to_hex();
        self.key(&format!("objects/{}/{}", &hex[0..2], &hex[2..]))
    }

    /// Raw (uncompressed, unprefixed) copy serving as a delta base
    pub fn raw_key(&self, id: &ObjectId) -> String {
        self.key(&format!("mirror_tmp/raw/{}", id.to_hex()))
    }

    /// A transient key under the temporary area
    pub fn tmp_key(&self, name: &str) -> String {
        self.key(&format!("mirror_tmp/{name}"))
    }

    /// The temporary area itself, for purging
    pub fn tmp_prefix(&self) -> String {
        self.key("mirror_tmp/")
    }

    /// The symbolic head file
    pub fn head_key(&self) -> String {
        self.key("HEAD")
    }

    /// The reference index consumed by dumb-HTTP clients
    pub fn info_refs_key(&self) -> String {
        self.key("info/refs")
    }
}
