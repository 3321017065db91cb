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

//! Worker pools for one mirror run
//!
//! Object workers take jobs off a shared queue: upload a full object, or
//! wait for a delta's base and upload the reconstruction. Large-file
//! workers drain the pointer queue the object workers feed. A failing job
//! is logged and counted; the worker moves on to its next job.

use crate::config::MirrorConfig;
use crate::error::MirrorError;
use crate::known::KnownObjects;
use crate::layout::Layout;
use crate::resolver::DeltaSource;
use crate::uploader::upload_object;
use bytes::Bytes;
use packmirror_lfs::{fetch_to_storage, BatchClient, LfsPointer};
use packmirror_pack::{ChannelSource, ObjectId, ObjectKind};
use packmirror_storage::StorageBackend;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// A receiver shared by every worker in a pool
pub(crate) type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<T>>>;

/// Everything a worker needs for one mirror run
pub(crate) struct RunContext {
    pub storage: Arc<dyn StorageBackend>,
    pub layout: Layout,
    pub known: KnownObjects,
    pub config: MirrorConfig,
    pub http: reqwest::Client,
    pub batch: BatchClient,
    pub counters: Counters,
}

/// Progress counters shared across the pools
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub objects_uploaded: AtomicU64,
    pub deltas_resolved: AtomicU64,
    pub lfs_payloads: AtomicU64,
    pub failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A job for the object-worker pool
pub(crate) enum ObjectJob {
    /// Upload a complete object
    Upload {
        kind: ObjectKind,
        size: u64,
        payload: mpsc::Receiver<Bytes>,
    },
    /// Reconstruct from a ref-delta and upload the result
    Delta {
        base: ObjectId,
        size: u64,
        payload: mpsc::Receiver<Bytes>,
    },
    /// Termination marker; one per worker
    Shutdown,
}

/// A job for the large-file pool
pub(crate) enum LfsJob {
    /// Download one pointer's payload
    Fetch(LfsPointer),
    /// Termination marker; one per worker
    Shutdown,
}

pub(crate) async fn object_worker(
    ctx: Arc<RunContext>,
    jobs: SharedReceiver<ObjectJob>,
    lfs_tx: mpsc::Sender<LfsJob>,
) {
    loop {
        let job = { jobs.lock().await.recv().await };
        match job {
            None | Some(ObjectJob::Shutdown) => break,
            Some(ObjectJob::Upload { kind, size, payload }) => {
                let mut source = ChannelSource::new(payload);
                match upload_object(
                    ctx.storage.as_ref(),
                    &ctx.layout,
                    &ctx.known,
                    kind,
                    size,
                    &mut source,
                )
                .await
                {
                    Ok(uploaded) => {
                        Counters::bump(&ctx.counters.objects_uploaded);
                        enqueue_pointer(&lfs_tx, uploaded.lfs_pointer).await;
                    }
                    Err(e) => {
                        Counters::bump(&ctx.counters.failures);
                        warn!("object upload failed: {e}");
                    }
                }
            }
            Some(ObjectJob::Delta { base, size, payload }) => {
                match resolve_and_upload(&ctx, base, size, payload, &lfs_tx).await {
                    Ok(()) => {
                        Counters::bump(&ctx.counters.objects_uploaded);
                        Counters::bump(&ctx.counters.deltas_resolved);
                    }
                    Err(e) => {
                        Counters::bump(&ctx.counters.failures);
                        warn!("delta against {base} failed: {e}");
                    }
                }
            }
        }
    }
    debug!("object worker exiting");
}

async fn resolve_and_upload(
    ctx: &RunContext,
    base: ObjectId,
    _delta_size: u64,
    payload: mpsc::Receiver<Bytes>,
    lfs_tx: &mpsc::Sender<LfsJob>,
) -> Result<(), MirrorError> {
    // The base may still be uploading; its signal fires once the raw copy
    // exists. The wait is bounded so a base that never arrives (failed
    // upload, thin pack) cannot hang the worker.
    let kind = tokio::time::timeout(ctx.config.base_wait_timeout, ctx.known.wait_ready(base))
        .await
        .map_err(|_| MirrorError::Timeout(format!("readiness of base object {base}")))??;

    let base_key = ctx.layout.raw_key(&base);
    let (mut source, target_size) =
        DeltaSource::open(ctx.storage.as_ref(), base_key, payload).await?;

    // The target inherits the base's type.
    let uploaded = upload_object(
        ctx.storage.as_ref(),
        &ctx.layout,
        &ctx.known,
        kind,
        target_size,
        &mut source,
    )
    .await?;
    enqueue_pointer(lfs_tx, uploaded.lfs_pointer).await;
    Ok(())
}

async fn enqueue_pointer(lfs_tx: &mpsc::Sender<LfsJob>, pointer: Option<LfsPointer>) {
    if let Some(pointer) = pointer {
        debug!("queueing large-file payload {}", pointer.oid);
        // Blocks when the queue is full; that back-pressure is wanted.
        if lfs_tx.send(LfsJob::Fetch(pointer)).await.is_err() {
            warn!("large-file queue closed; dropping pointer");
        }
    }
}

pub(crate) async fn lfs_worker(ctx: Arc<RunContext>, jobs: SharedReceiver<LfsJob>) {
    loop {
        let job = { jobs.lock().await.recv().await };
        match job {
            None | Some(LfsJob::Shutdown) => break,
            Some(LfsJob::Fetch(pointer)) => {
                match fetch_to_storage(
                    &ctx.http,
                    &ctx.batch,
                    ctx.storage.as_ref(),
                    ctx.layout.prefix(),
                    &pointer,
                )
                .await
                {
                    Ok(true) => Counters::bump(&ctx.counters.lfs_payloads),
                    Ok(false) => debug!("large-file payload {} already mirrored", pointer.oid),
                    Err(e) => {
                        Counters::bump(&ctx.counters.failures);
                        warn!("large-file download failed for {}: {e}", pointer.oid);
                    }
                }
            }
        }
    }
    debug!("large-file worker exiting");
}
