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

//! The PackMirror engine
//!
//! Mirrors a git repository exposed over the smart-HTTP fetch protocol
//! into a flat object-store layout that a standard client can clone from
//! as a dumb-HTTP remote. The per-mirror pipeline is
//!
//! ```text
//! git-upload-pack body ──► smoother ──► reader ──► pack parser
//!                                                      │ one entry at a time,
//!                                                      ▼ single-slot payload channel
//!                                            object worker pool ──► uploads,
//!                                                      │             delta resolution
//!                                                      ▼
//!                                            large-file worker pool
//! ```
//!
//! followed by the `HEAD` / `info/refs` writes and a purge of the
//! temporary area. [`mirror_all`] drives a list of (source, target) pairs
//! sequentially, sharing the HTTP client and one S3 backend per bucket.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod known;
pub mod layout;
pub mod refs;
pub mod resolver;
pub mod smoother;
pub mod uploader;
mod worker;

pub use config::MirrorConfig;
pub use coordinator::{Mirror, MirrorSummary};
pub use error::{MirrorError, MirrorResult};
pub use known::KnownObjects;
pub use layout::{parse_target, Layout, S3Target};
pub use resolver::DeltaSource;
pub use smoother::Smoother;
pub use uploader::{upload_object, UploadedObject};

use anyhow::Context;
use packmirror_storage::{S3Backend, S3Config, StorageBackend};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Mirror each (source URL, `s3://bucket/prefix` target) pair in order.
///
/// The HTTP client is shared across all pairs, and pairs targeting the
/// same bucket share one S3 backend. The first failing mirror aborts the
/// run (its temporary area is still cleaned).
pub async fn mirror_all(
    pairs: &[(String, String)],
    config: &MirrorConfig,
) -> anyhow::Result<Vec<MirrorSummary>> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("packmirror/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;
    let mirror = Mirror::new(http, config.clone());

    let mut backends: HashMap<String, Arc<S3Backend>> = HashMap::new();
    let mut summaries = Vec::with_capacity(pairs.len());

    for (source, target) in pairs {
        let parsed = parse_target(target)?;
        let backend = match backends.get(&parsed.bucket) {
            Some(backend) => Arc::clone(backend),
            None => {
                let backend = Arc::new(
                    S3Backend::with_config(S3Config {
                        bucket: parsed.bucket.clone(),
                        endpoint: config.s3_endpoint.clone(),
                        ..Default::default()
                    })
                    .await
                    .with_context(|| format!("cannot reach bucket {}", parsed.bucket))?,
                );
                backends.insert(parsed.bucket.clone(), Arc::clone(&backend));
                backend
            }
        };

        info!("mirroring {source} -> {target}");
        let summary = mirror
            .run(source, backend as Arc<dyn StorageBackend>, &parsed.prefix)
            .await
            .with_context(|| format!("mirror of {source} failed"))?;
        summaries.push(summary);
    }

    Ok(summaries)
}
