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

//! Per-mirror coordination
//!
//! One [`Mirror::run`] call owns the whole lifecycle of a (source, target)
//! pair: purge the temporary area, fetch and parse the refs advertisement,
//! request the pack, feed it through smoother → reader → parser, dispatch
//! every entry to the object-worker pool over a single-slot payload
//! channel, drain the pools in order, write `HEAD` and `info/refs`, and
//! purge the temporary area again on every exit path.

use crate::config::MirrorConfig;
use crate::error::MirrorError;
use crate::known::KnownObjects;
use crate::layout::Layout;
use crate::refs::{self, Advertisement};
use crate::smoother::Smoother;
use crate::worker::{
    lfs_worker, object_worker, Counters, LfsJob, ObjectJob, RunContext, SharedReceiver,
};
use bytes::Bytes;
use packmirror_lfs::BatchClient;
use packmirror_pack::{PackEntryKind, PackParser};
use packmirror_storage::StorageBackend;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// What one finished mirror did
#[derive(Debug, Clone)]
pub struct MirrorSummary {
    /// The source repository base URL
    pub source: String,
    /// Advertised refs written to `info/refs`
    pub refs: usize,
    /// Objects the pack header announced
    pub objects_announced: u32,
    /// Objects uploaded to their canonical keys (including delta targets)
    pub objects_uploaded: u64,
    /// Of those, how many were reconstructed from ref-deltas
    pub deltas_resolved: u64,
    /// Large-file payloads freshly downloaded
    pub lfs_payloads: u64,
    /// Jobs that failed and were skipped
    pub failures: u64,
}

/// Coordinator for mirror runs sharing one HTTP client and configuration
#[derive(Debug, Clone)]
pub struct Mirror {
    http: reqwest::Client,
    config: MirrorConfig,
}

impl Mirror {
    /// Build a coordinator around a shared HTTP client
    pub fn new(http: reqwest::Client, config: MirrorConfig) -> Self {
        Mirror { http, config }
    }

    /// Mirror one source repository into `prefix` of the given store.
    pub async fn run(
        &self,
        source: &str,
        storage: Arc<dyn StorageBackend>,
        prefix: &str,
    ) -> Result<MirrorSummary, MirrorError> {
        let layout = Layout::new(prefix);

        storage
            .delete_prefix(&layout.tmp_prefix())
            .await
            .map_err(MirrorError::storage)?;

        let result = self.mirror_inner(source, &storage, &layout).await;

        // The temporary area is purged on every exit path, including
        // failure; a purge error must not mask the run's own outcome.
        if let Err(e) = storage.delete_prefix(&layout.tmp_prefix()).await {
            warn!("failed to purge temporary area: {e}");
        }

        result
    }

    async fn mirror_inner(
        &self,
        source: &str,
        storage: &Arc<dyn StorageBackend>,
        layout: &Layout,
    ) -> Result<MirrorSummary, MirrorError> {
        let source = source.trim_end_matches('/');

        let advert_body = self.fetch_advertisement(source).await?;
        let advert = refs::parse_advertisement(&advert_body)?;
        info!(
            refs = advert.refs.len(),
            head = advert.head_symref.as_deref().unwrap_or("<none>"),
            "fetched refs advertisement from {source}"
        );

        let ctx = Arc::new(RunContext {
            storage: Arc::clone(storage),
            layout: layout.clone(),
            known: KnownObjects::new(),
            config: self.config.clone(),
            http: self.http.clone(),
            batch: BatchClient::for_source(self.http.clone(), source),
            counters: Counters::default(),
        });

        let objects_announced = if advert.refs.is_empty() {
            debug!("source advertises no refs; nothing to fetch");
            0
        } else {
            self.process_pack(source, &advert, &ctx).await?
        };

        // HEAD and the ref index land only after every worker is done.
        if let Some(symref) = &advert.head_symref {
            storage
                .put(&layout.head_key(), refs::render_head(symref).as_bytes())
                .await
                .map_err(MirrorError::storage)?;
        }
        storage
            .put(
                &layout.info_refs_key(),
                refs::render_info_refs(&advert.refs).as_bytes(),
            )
            .await
            .map_err(MirrorError::storage)?;

        let summary = MirrorSummary {
            source: source.to_string(),
            refs: advert.refs.len(),
            objects_announced,
            objects_uploaded: ctx.counters.objects_uploaded.load(Ordering::Relaxed),
            deltas_resolved: ctx.counters.deltas_resolved.load(Ordering::Relaxed),
            lfs_payloads: ctx.counters.lfs_payloads.load(Ordering::Relaxed),
            failures: ctx.counters.failures.load(Ordering::Relaxed),
        };
        info!(
            objects = summary.objects_uploaded,
            deltas = summary.deltas_resolved,
            lfs = summary.lfs_payloads,
            failures = summary.failures,
            "mirror of {source} finished"
        );
        Ok(summary)
    }

    /// Fetch the pack and run it through the worker pools.
    async fn process_pack(
        &self,
        source: &str,
        advert: &Advertisement,
        ctx: &Arc<RunContext>,
    ) -> Result<u32, MirrorError> {
        let (job_tx, job_rx) = mpsc::channel(self.config.object_workers.max(1));
        let jobs: SharedReceiver<ObjectJob> = Arc::new(Mutex::new(job_rx));
        let (lfs_tx, lfs_rx) = mpsc::channel(self.config.lfs_queue_capacity.max(1));
        let lfs_jobs: SharedReceiver<LfsJob> = Arc::new(Mutex::new(lfs_rx));

        let object_handles: Vec<_> = (0..self.config.object_workers)
            .map(|_| {
                tokio::spawn(object_worker(
                    Arc::clone(ctx),
                    Arc::clone(&jobs),
                    lfs_tx.clone(),
                ))
            })
            .collect();
        let lfs_handles: Vec<_> = (0..self.config.lfs_workers)
            .map(|_| tokio::spawn(lfs_worker(Arc::clone(ctx), Arc::clone(&lfs_jobs))))
            .collect();

        let dispatch = self.dispatch_entries(source, advert, &job_tx).await;

        // Drain order: object workers first, then the large-file pool,
        // regardless of how dispatch ended.
        for _ in 0..self.config.object_workers {
            let _ = job_tx.send(ObjectJob::Shutdown).await;
        }
        drop(job_tx);
        for handle in object_handles {
            if let Err(e) = handle.await {
                warn!("object worker panicked: {e}");
            }
        }

        for _ in 0..self.config.lfs_workers {
            let _ = lfs_tx.send(LfsJob::Shutdown).await;
        }
        drop(lfs_tx);
        for handle in lfs_handles {
            if let Err(e) = handle.await {
                warn!("large-file worker panicked: {e}");
            }
        }

        dispatch
    }

    async fn dispatch_entries(
        &self,
        source: &str,
        advert: &Advertisement,
        job_tx: &mpsc::Sender<ObjectJob>,
    ) -> Result<u32, MirrorError> {
        let want = refs::build_want_request(&advert.refs);
        debug!("requesting pack for {} refs", advert.refs.len());

        let response = self
            .http
            .post(format!("{source}/git-upload-pack"))
            .header("Content-Type", "application/x-git-upload-pack-request")
            .body(want)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MirrorError::remote(format!(
                "git-upload-pack returned {status}"
            )));
        }

        let smoother = Smoother::spawn(
            response.bytes_stream(),
            self.config.keepalive_interval,
            self.config.chunk_timeout,
        );
        let mut parser = PackParser::begin(smoother).await?;
        let announced = parser.object_count();
        info!(announced, "pack stream opened");

        while let Some(entry) = parser.next_entry().await? {
            // Single-slot hand-off: at most one chunk sits between the
            // parser and the worker, so the HTTP body is consumed linearly
            // while the worker does its storage I/O.
            let (payload_tx, payload_rx) = mpsc::channel(1);
            let job = match entry.kind {
                PackEntryKind::Full(kind) => ObjectJob::Upload {
                    kind,
                    size: entry.size,
                    payload: payload_rx,
                },
                PackEntryKind::RefDelta(base) => ObjectJob::Delta {
                    base,
                    size: entry.size,
                    payload: payload_rx,
                },
            };
            job_tx
                .send(job)
                .await
                .map_err(|_| MirrorError::WorkerPool("object workers are gone".to_string()))?;
            parser.stream_payload(entry.size, &payload_tx).await?;
        }
        parser.finish().await?;
        Ok(announced)
    }

    async fn fetch_advertisement(&self, source: &str) -> Result<Bytes, MirrorError> {
        let url = format!("{source}/info/refs?service=git-upload-pack");
        let attempts = self.config.http_retries.max(1);
        let mut delay = Duration::from_millis(100);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = async {
                let response = self.http.get(&url).send().await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(MirrorError::remote(format!("info/refs returned {status}")));
                }
                Ok(response.bytes().await?)
            }
            .await;

            match result {
                Ok(body) => return Ok(body),
                Err(e) if attempt < attempts => {
                    warn!("info/refs fetch failed (attempt {attempt}/{attempts}): {e}");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(10));
                }
                Err(e) => return Err(e),
            }
        }
    }
}
