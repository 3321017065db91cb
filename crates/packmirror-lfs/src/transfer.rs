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

//! LFS payload transfer into the destination store

use crate::batch::BatchClient;
use crate::error::LfsResult;
use crate::pointer::LfsPointer;
use futures::TryStreamExt;
use packmirror_storage::StorageBackend;
use tracing::{debug, info};

/// Download one LFS payload into the destination store.
///
/// Returns `false` without touching the network when the destination key
/// already exists (re-running a mirror never re-uploads payloads), and
/// `true` after a fresh upload.
pub async fn fetch_to_storage(
    http: &reqwest::Client,
    batch: &BatchClient,
    storage: &dyn StorageBackend,
    prefix: &str,
    pointer: &LfsPointer,
) -> LfsResult<bool> {
    let key = pointer.storage_key(prefix);

    if storage.exists(&key).await? {
        debug!("LFS payload already present: {}", key);
        return Ok(false);
    }

    let href = batch.download_url(&pointer.oid, pointer.size).await?;
    debug!("downloading LFS payload {} from {}", pointer.oid, href);

    let response = http.get(&href).send().await?.error_for_status()?;
    let body = response
        .bytes_stream()
        .map_err(anyhow::Error::from);
    storage.put_stream(&key, Box::pin(body)).await?;

    info!("stored LFS payload {} ({} bytes)", pointer.oid, pointer.size);
    Ok(true)
}
