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

//! Keep-alive smoother for the pack HTTP body
//!
//! Reconstructing a delta can stall the pack parser for a long time while
//! the worker does ranged reads against storage. If nothing pulls from the
//! source's HTTP body meanwhile, the remote may conclude the client is gone
//! and close the connection. The smoother interposes a producer task that
//! pulls from the body at least once per interval even when the parser is
//! not asking, buffering what it pulled until the parser catches up.
//!
//! Invariants: at most one outstanding upstream pull; every pulled byte is
//! eventually delivered (or the run has failed); upstream end-of-stream and
//! errors propagate to the consumer in order.

use crate::error::MirrorError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use packmirror_pack::{ChunkSource, PackError};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Consumer handle for a smoothed HTTP body; plugs into the pack parser as
/// its [`ChunkSource`].
#[derive(Debug)]
pub struct Smoother {
    data_rx: mpsc::Receiver<Result<Bytes, MirrorError>>,
    ready_tx: mpsc::Sender<()>,
    chunk_timeout: Duration,
}

impl Smoother {
    /// Spawn the producer task over an HTTP body stream.
    ///
    /// `interval` is how often a pull is forced while the consumer is busy;
    /// `chunk_timeout` bounds how long the consumer waits for any one chunk.
    pub fn spawn<St>(body: St, interval: Duration, chunk_timeout: Duration) -> Self
    where
        St: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    {
        let (data_tx, data_rx) = mpsc::channel(1);
        let (ready_tx, ready_rx) = mpsc::channel(1);
        tokio::spawn(produce(Box::pin(body), data_tx, ready_rx, interval));
        Smoother {
            data_rx,
            ready_tx,
            chunk_timeout,
        }
    }
}

#[async_trait]
impl ChunkSource for Smoother {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, PackError> {
        if self.ready_tx.send(()).await.is_err() {
            // Producer already delivered end-of-stream and went away.
            return Ok(None);
        }
        match tokio::time::timeout(self.chunk_timeout, self.data_rx.recv()).await {
            Err(_) => Err(PackError::source(MirrorError::Timeout(
                "a pack body chunk from the keep-alive smoother".to_string(),
            ))),
            Ok(None) => Ok(None),
            Ok(Some(Ok(chunk))) => Ok(Some(chunk)),
            Ok(Some(Err(e))) => Err(PackError::source(e)),
        }
    }
}

async fn produce(
    mut body: std::pin::Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    data_tx: mpsc::Sender<Result<Bytes, MirrorError>>,
    mut ready_rx: mpsc::Receiver<()>,
    interval: Duration,
) {
    let mut buffered: VecDeque<Bytes> = VecDeque::new();
    let mut buffered_bytes: usize = 0;
    let mut pending_error: Option<MirrorError> = None;
    let mut upstream_done = false;
    let mut served_since_tick = true;

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            request = ready_rx.recv() => {
                if request.is_none() {
                    return; // consumer went away
                }
                served_since_tick = true;

                let item = if let Some(chunk) = buffered.pop_front() {
                    buffered_bytes -= chunk.len();
                    Some(Ok(chunk))
                } else if let Some(e) = pending_error.take() {
                    Some(Err(e))
                } else if upstream_done {
                    None
                } else {
                    match body.next().await {
                        Some(Ok(chunk)) => Some(Ok(chunk)),
                        Some(Err(e)) => {
                            upstream_done = true;
                            Some(Err(MirrorError::Http(e)))
                        }
                        None => {
                            upstream_done = true;
                            None
                        }
                    }
                };

                match item {
                    Some(item) => {
                        let failed = item.is_err();
                        if data_tx.send(item).await.is_err() || failed {
                            return;
                        }
                    }
                    // Dropping data_tx is the end-of-stream signal.
                    None => return,
                }
            }
            _ = ticker.tick() => {
                if served_since_tick {
                    served_since_tick = false;
                    continue;
                }
                if upstream_done {
                    continue;
                }
                match body.next().await {
                    Some(Ok(chunk)) => {
                        buffered_bytes += chunk.len();
                        buffered.push_back(chunk);
                        debug!(buffered_bytes, "keep-alive pull while the consumer is busy");
                    }
                    Some(Err(e)) => {
                        pending_error = Some(MirrorError::Http(e));
                        upstream_done = true;
                    }
                    None => upstream_done = true,
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn chunk_stream(
        chunks: Vec<&'static [u8]>,
        pulled: Arc<AtomicUsize>,
    ) -> impl Stream<Item = Result<Bytes, reqwest::Error>> + Send {
        futures::stream::iter(chunks.into_iter().map(Bytes::from_static).map(Ok)).inspect(
            move |_| {
                pulled.fetch_add(1, Ordering::SeqCst);
            },
        )
    }

    #[tokio::test]
    async fn chunks_flow_through_in_order() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let mut smoother = Smoother::spawn(
            chunk_stream(vec![b"one", b"two", b"three"], Arc::clone(&pulled)),
            Duration::from_secs(1),
            Duration::from_secs(60),
        );

        assert_eq!(smoother.next_chunk().await.unwrap().unwrap(), "one");
        assert_eq!(smoother.next_chunk().await.unwrap().unwrap(), "two");
        assert_eq!(smoother.next_chunk().await.unwrap().unwrap(), "three");
        assert!(smoother.next_chunk().await.unwrap().is_none());
        // End-of-stream is sticky.
        assert!(smoother.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_consumer_still_drains_upstream() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let mut smoother = Smoother::spawn(
            chunk_stream(vec![b"aa", b"bb", b"cc"], Arc::clone(&pulled)),
            Duration::from_secs(1),
            Duration::from_secs(60),
        );

        // The consumer stalls for several intervals; the producer must keep
        // the connection warm by pulling anyway.
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(pulled.load(Ordering::SeqCst) >= 2);

        // Everything pulled early is still delivered, in order.
        assert_eq!(smoother.next_chunk().await.unwrap().unwrap(), "aa");
        assert_eq!(smoother.next_chunk().await.unwrap().unwrap(), "bb");
        assert_eq!(smoother.next_chunk().await.unwrap().unwrap(), "cc");
        assert!(smoother.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn consumer_times_out_when_nothing_arrives() {
        let pending =
            futures::stream::pending::<Result<Bytes, reqwest::Error>>();
        let mut smoother =
            Smoother::spawn(pending, Duration::from_secs(1), Duration::from_secs(60));

        let err = smoother.next_chunk().await.unwrap_err();
        assert!(err.to_string().contains("pack source failed"));
    }
}
