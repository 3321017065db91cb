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

//! The known-objects map
//!
//! Maps content ids to object types, with a per-key readiness signal. A
//! delta worker blocks on its base's signal before reading the base's type;
//! the uploader fires the signal only after the raw copy of the base exists
//! in storage, so ranged reads against it are safe from that point on.

use crate::error::MirrorError;
use packmirror_pack::{ObjectId, ObjectKind};
use std::collections::HashMap;
use tokio::sync::{watch, Mutex};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Pending,
    Ready(ObjectKind),
    Failed,
}

/// Shared map of uploaded objects with per-key readiness signals
///
/// Entries are published exactly once, by the worker that finished the
/// upload; concurrent waiters observe the published type. Publication and
/// signal firing happen atomically under one mutex.
#[derive(Debug, Default)]
pub struct KnownObjects {
    slots: Mutex<HashMap<ObjectId, watch::Sender<SlotState>>>,
}

impl KnownObjects {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, id: ObjectId) -> watch::Sender<SlotState> {
        let mut slots = self.slots.lock().await;
        slots
            .entry(id)
            .or_insert_with(|| watch::channel(SlotState::Pending).0)
            .clone()
    }

    /// Record that `id` is uploaded with the given type and wake waiters.
    pub async fn publish(&self, id: ObjectId, kind: ObjectKind) {
        let slot = self.slot(id).await;
        let previous = slot.send_replace(SlotState::Ready(kind));
        if let SlotState::Ready(existing) = previous {
            warn!("object {} published twice (was {})", id, existing);
        }
    }

    /// Mark `id` as permanently unavailable so waiters fail instead of
    /// blocking.
    pub async fn mark_failed(&self, id: ObjectId) {
        let slot = self.slot(id).await;
        slot.send_replace(SlotState::Failed);
    }

    /// Look up a type without waiting.
    pub async fn get(&self, id: ObjectId) -> Option<ObjectKind> {
        let slots = self.slots.lock().await;
        slots.get(&id).and_then(|slot| match *slot.borrow() {
            SlotState::Ready(kind) => Some(kind),
            _ => None,
        })
    }

    /// Block until `id` becomes ready and return its type.
    ///
    /// Callers bound this wait with a timeout; an object whose upload failed
    /// after its id was known yields an error immediately.
    pub async fn wait_ready(&self, id: ObjectId) -> Result<ObjectKind, MirrorError> {
        let mut rx = self.slot(id).await.subscribe();
        let state = rx
            .wait_for(|state| !matches!(state, SlotState::Pending))
            .await
            .map_err(|_| MirrorError::WorkerPool(format!("readiness signal for {id} lost")))?;
        match *state {
            SlotState::Ready(kind) => Ok(kind),
            _ => Err(MirrorError::remote(format!(
                "base object {id} failed to upload"
            ))),
        }
    }

    /// Number of published (ready) entries
    pub async fn ready_count(&self) -> usize {
        let slots = self.slots.lock().await;
        slots
            .values()
            .filter(|slot| matches!(*slot.borrow(), SlotState::Ready(_)))
            .count()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn id(byte: u8) -> ObjectId {
        ObjectId::from_bytes([byte; 20])
    }

    #[tokio::test]
    async fn publish_then_wait_returns_immediately() {
        let known = KnownObjects::new();
        known.publish(id(1), ObjectKind::Blob).await;
        assert_eq!(known.wait_ready(id(1)).await.unwrap(), ObjectKind::Blob);
        assert_eq!(known.get(id(1)).await, Some(ObjectKind::Blob));
    }

    #[tokio::test]
    async fn waiter_blocks_until_publication() {
        let known = Arc::new(KnownObjects::new());
        let waiter = {
            let known = Arc::clone(&known);
            tokio::spawn(async move { known.wait_ready(id(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        known.publish(id(2), ObjectKind::Tree).await;
        assert_eq!(waiter.await.unwrap().unwrap(), ObjectKind::Tree);
    }

    #[tokio::test]
    async fn multiple_waiters_all_wake() {
        let known = Arc::new(KnownObjects::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let known = Arc::clone(&known);
                tokio::spawn(async move { known.wait_ready(id(3)).await })
            })
            .collect();

        known.publish(id(3), ObjectKind::Commit).await;
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap(), ObjectKind::Commit);
        }
    }

    #[tokio::test]
    async fn failed_base_errors_waiters() {
        let known = Arc::new(KnownObjects::new());
        let waiter = {
            let known = Arc::clone(&known);
            tokio::spawn(async move { known.wait_ready(id(4)).await })
        };
        known.mark_failed(id(4)).await;
        assert!(waiter.await.unwrap().is_err());
        assert_eq!(known.get(id(4)).await, None);
    }

    #[tokio::test]
    async fn unpublished_lookup_is_none() {
        let known = KnownObjects::new();
        assert_eq!(known.get(id(5)).await, None);
        assert_eq!(known.ready_count().await, 0);
    }
}
