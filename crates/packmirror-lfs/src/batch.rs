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

//! Git LFS batch API client
//!
//! The batch endpoint translates an `{oid, size}` pair into a short-lived
//! download URL: POST `<source>.git/info/lfs/objects/batch` with
//! `{"operation":"download","objects":[{"oid":…,"size":…}]}` and follow
//! `objects[0].actions.download.href`.

use crate::error::{LfsError, LfsResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    operation: &'a str,
    objects: Vec<BatchRequestObject<'a>>,
}

#[derive(Debug, Serialize)]
struct BatchRequestObject<'a> {
    oid: &'a str,
    size: u64,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    objects: Vec<BatchResponseObject>,
}

#[derive(Debug, Deserialize)]
struct BatchResponseObject {
    #[serde(default)]
    actions: Option<BatchActions>,
}

#[derive(Debug, Deserialize)]
struct BatchActions {
    #[serde(default)]
    download: Option<BatchAction>,
}

#[derive(Debug, Deserialize)]
struct BatchAction {
    href: String,
}

/// HTTP client for one source's LFS batch endpoint
#[derive(Debug, Clone)]
pub struct BatchClient {
    http: reqwest::Client,
    batch_url: String,
}

impl BatchClient {
    /// Build a client for the given source repository base URL.
    ///
    /// The batch endpoint lives under the `.git` suffix of the source:
    /// `https://host/org/repo` → `https://host/org/repo.git/info/lfs/objects/batch`.
    pub fn for_source(http: reqwest::Client, source_base: &str) -> Self {
        let batch_url = format!(
            "{}.git/info/lfs/objects/batch",
            source_base.trim_end_matches('/')
        );
        BatchClient { http, batch_url }
    }

    /// The resolved batch endpoint URL
    pub fn batch_url(&self) -> &str {
        &self.batch_url
    }

    /// Negotiate a download URL for one object.
    pub async fn download_url(&self, oid: &str, size: u64) -> LfsResult<String> {
        debug!("POST {} for oid {}", self.batch_url, oid);

        let request = BatchRequest {
            operation: "download",
            objects: vec![BatchRequestObject { oid, size }],
        };

        let response = self
            .http
            .post(&self.batch_url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        let body: BatchResponse = response.json().await?;
        body.objects
            .into_iter()
            .next()
            .and_then(|o| o.actions)
            .and_then(|a| a.download)
            .map(|d| d.href)
            .ok_or_else(|| LfsError::NoDownloadAction(oid.to_string()))
    }
}
