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

//! Two-stage object upload
//!
//! An object's content id is the digest of header-plus-payload, so it is
//! only known once the payload has fully streamed past. The upload
//! therefore goes to a random temporary key first, with the digest rolling
//! alongside; the finished temp object is then copied to its raw
//! digest-addressed key (`mirror_tmp/raw/<hex>`) where later deltas can
//! read ranges of it, published to the known-objects map, and finally
//! re-streamed to its canonical key as a header-prefixed, zlib-compressed
//! loose object. The first bytes of every blob are also sniffed for the
//! large-file pointer marker.

use crate::error::MirrorError;
use crate::known::KnownObjects;
use crate::layout::Layout;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use packmirror_lfs::LfsPointer;
use packmirror_pack::object::header_bytes;
use packmirror_pack::{ChunkSource, Deflater, ObjectHasher, ObjectId, ObjectKind, PackError};
use packmirror_storage::{ByteStream, StorageBackend};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// How many leading payload bytes are inspected for the pointer marker;
/// pointer files are never larger than this.
const SNIFF_LEN: usize = 512;

/// Result of a finished object upload
#[derive(Debug)]
pub struct UploadedObject {
    /// The object's content id (also its canonical key)
    pub id: ObjectId,
    /// A parsed large-file pointer, when the object is a pointer blob
    pub lfs_pointer: Option<LfsPointer>,
}

/// Stream one object into storage and publish it.
///
/// `size` is the expanded length the pack header declared; producing any
/// other number of bytes is an integrity error.
pub async fn upload_object<S: ChunkSource>(
    storage: &dyn StorageBackend,
    layout: &Layout,
    known: &KnownObjects,
    kind: ObjectKind,
    size: u64,
    payload: &mut S,
) -> Result<UploadedObject, MirrorError> {
    let tmp_key = layout.tmp_key(&Uuid::new_v4().to_string());

    let (tx, rx) = mpsc::channel::<anyhow::Result<Bytes>>(1);
    let put_fut = storage.put_stream(&tmp_key, Box::pin(receiver_stream(rx)));
    let pump_fut = async move {
        let mut hasher = ObjectHasher::new(kind, size);
        let mut sniff: Vec<u8> = Vec::new();
        let mut produced = 0u64;
        loop {
            match payload.next_chunk().await {
                Ok(Some(chunk)) => {
                    hasher.update(&chunk);
                    if sniff.len() < SNIFF_LEN {
                        let take = (SNIFF_LEN - sniff.len()).min(chunk.len());
                        sniff.extend_from_slice(&chunk[..take]);
                    }
                    produced += chunk.len() as u64;
                    if tx.send(Ok(chunk)).await.is_err() {
                        // The upload side failed; its error surfaces below.
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx
                        .send(Err(anyhow::anyhow!("object payload source failed")))
                        .await;
                    return Err(MirrorError::from(e));
                }
            }
        }
        drop(tx);
        Ok::<_, MirrorError>((hasher, sniff, produced))
    };

    let (put_result, pump_result) = tokio::join!(put_fut, pump_fut);
    let (hasher, sniff, produced) = pump_result?;
    put_result.map_err(MirrorError::storage)?;

    if produced != size {
        return Err(MirrorError::Pack(PackError::IntegrityMismatch {
            declared: size,
            produced,
        }));
    }

    let id = hasher.finish();
    let raw_key = layout.raw_key(&id);
    storage
        .copy(&tmp_key, &raw_key)
        .await
        .map_err(MirrorError::storage)?;
    storage.delete(&tmp_key).await.map_err(MirrorError::storage)?;

    // Publish before the canonical write so dependent deltas can start
    // their ranged reads against the raw copy as early as possible.
    known.publish(id, kind).await;

    write_canonical(storage, layout, &id, kind, size).await?;
    debug!("uploaded {} {} ({} bytes)", kind, id, size);

    let lfs_pointer = if kind == ObjectKind::Blob {
        detect_pointer(&sniff, size)
    } else {
        None
    };
    Ok(UploadedObject { id, lfs_pointer })
}

/// Re-stream the raw object to `objects/<xx>/<rest>` with the canonical
/// header prepended, through a streaming zlib compressor.
async fn write_canonical(
    storage: &dyn StorageBackend,
    layout: &Layout,
    id: &ObjectId,
    kind: ObjectKind,
    size: u64,
) -> Result<(), MirrorError> {
    let raw = storage
        .get_stream(&layout.raw_key(id))
        .await
        .map_err(MirrorError::storage)?;
    let compressed = deflate_stream(header_bytes(kind, size), raw);
    storage
        .put_stream(&layout.object_key(id), Box::pin(compressed))
        .await
        .map_err(MirrorError::storage)
}

fn receiver_stream(
    rx: mpsc::Receiver<anyhow::Result<Bytes>>,
) -> impl Stream<Item = anyhow::Result<Bytes>> + Send {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
}

struct DeflateState {
    inner: ByteStream<'static>,
    z: Deflater,
    header: Option<Vec<u8>>,
    finished: bool,
}

fn deflate_stream(
    header: Vec<u8>,
    inner: ByteStream<'static>,
) -> impl Stream<Item = anyhow::Result<Bytes>> + Send {
    let state = DeflateState {
        inner,
        z: Deflater::new(),
        header: Some(header),
        finished: false,
    };
    futures::stream::unfold(state, |mut st| async move {
        if st.finished {
            return None;
        }
        loop {
            if let Some(header) = st.header.take() {
                match st.z.push(&header) {
                    Ok(out) if out.is_empty() => continue,
                    Ok(out) => return Some((Ok(Bytes::from(out)), st)),
                    Err(e) => {
                        st.finished = true;
                        return Some((Err(e.into()), st));
                    }
                }
            }
            match st.inner.next().await {
                Some(Ok(chunk)) => match st.z.push(&chunk) {
                    Ok(out) if out.is_empty() => continue,
                    Ok(out) => return Some((Ok(Bytes::from(out)), st)),
                    Err(e) => {
                        st.finished = true;
                        return Some((Err(e.into()), st));
                    }
                },
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(e), st));
                }
                None => {
                    st.finished = true;
                    return match st.z.finish() {
                        Ok(out) => Some((Ok(Bytes::from(out)), st)),
                        Err(e) => Some((Err(e.into()), st)),
                    };
                }
            }
        }
    })
}

fn detect_pointer(sniff: &[u8], size: u64) -> Option<LfsPointer> {
    if size > SNIFF_LEN as u64 || !LfsPointer::is_pointer(sniff) {
        return None;
    }
    let text = std::str::from_utf8(sniff).ok()?;
    match LfsPointer::parse(text) {
        Ok(pointer) => Some(pointer),
        Err(e) => {
            warn!("blob carries the pointer marker but does not parse: {e}");
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use packmirror_pack::SliceSource;
    use packmirror_storage::MockBackend;
    use std::io::Read;

    fn layout() -> Layout {
        Layout::new("repo")
    }

    fn inflate(data: &[u8]) -> Vec<u8> {
        let mut decoder = flate2::read::ZlibDecoder::new(data);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        out
    }

    #[tokio::test]
    async fn canonical_object_roundtrips() {
        let storage = MockBackend::new();
        let known = KnownObjects::new();
        let payload = b"hello world";
        let mut source = SliceSource::new([&payload[..6], &payload[6..]]);

        let uploaded = upload_object(
            &storage,
            &layout(),
            &known,
            ObjectKind::Blob,
            payload.len() as u64,
            &mut source,
        )
        .await
        .unwrap();

        // `echo -n 'hello world' | git hash-object --stdin`
        assert_eq!(
            uploaded.id.to_hex(),
            "95d09f2b10159347eece71399a7e2e907ea3df4f"
        );
        assert!(uploaded.lfs_pointer.is_none());

        let canonical = storage
            .get("repo/objects/95/d09f2b10159347eece71399a7e2e907ea3df4f")
            .await
            .unwrap();
        assert_eq!(inflate(&canonical), b"blob 11\0hello world");

        // The raw digest-addressed copy stays behind for delta bases.
        let raw = storage
            .get("repo/mirror_tmp/raw/95d09f2b10159347eece71399a7e2e907ea3df4f")
            .await
            .unwrap();
        assert_eq!(raw, payload);

        // The uuid temp was deleted; only raw/ remains under the temp area.
        let tmp_keys = storage.list_objects("repo/mirror_tmp/").await.unwrap();
        assert_eq!(tmp_keys.len(), 1);

        assert_eq!(known.get(uploaded.id).await, Some(ObjectKind::Blob));
    }

    #[tokio::test]
    async fn pointer_blob_is_detected() {
        let storage = MockBackend::new();
        let known = KnownObjects::new();
        let oid = "4d7a214614ab2935c943f9e0ff69d22eadbb8f32b1258daaa5e2ca24d17e2393";
        let pointer_text = format!(
            "version https://git-lfs.github.com/spec/v1\noid sha256:{oid}\nsize 12345\n"
        );
        let mut source = SliceSource::single(pointer_text.clone().into_bytes());

        let uploaded = upload_object(
            &storage,
            &layout(),
            &known,
            ObjectKind::Blob,
            pointer_text.len() as u64,
            &mut source,
        )
        .await
        .unwrap();

        let pointer = uploaded.lfs_pointer.expect("pointer must be detected");
        assert_eq!(pointer.oid, oid);
        assert_eq!(pointer.size, 12345);
    }

    #[tokio::test]
    async fn pointer_marker_on_non_blob_is_ignored() {
        let storage = MockBackend::new();
        let known = KnownObjects::new();
        let text = "version https://git-lfs.github.com/spec/v1\noid sha256:aa\nsize 1\n";
        let mut source = SliceSource::single(text.as_bytes().to_vec());

        let uploaded = upload_object(
            &storage,
            &layout(),
            &known,
            ObjectKind::Commit,
            text.len() as u64,
            &mut source,
        )
        .await
        .unwrap();
        assert!(uploaded.lfs_pointer.is_none());
    }

    #[tokio::test]
    async fn short_payload_is_an_integrity_error() {
        let storage = MockBackend::new();
        let known = KnownObjects::new();
        let mut source = SliceSource::single(&b"short"[..]);

        let err = upload_object(&storage, &layout(), &known, ObjectKind::Blob, 99, &mut source)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MirrorError::Pack(PackError::IntegrityMismatch { declared: 99, produced: 5 })
        ));

        // Nothing was published for the failed object.
        assert_eq!(known.ready_count().await, 0);
    }

    #[tokio::test]
    async fn large_object_streams_through() {
        let storage = MockBackend::new();
        let known = KnownObjects::new();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let chunks: Vec<Vec<u8>> = payload.chunks(8192).map(<[u8]>::to_vec).collect();
        let mut source = SliceSource::new(chunks);

        let uploaded = upload_object(
            &storage,
            &layout(),
            &known,
            ObjectKind::Blob,
            payload.len() as u64,
            &mut source,
        )
        .await
        .unwrap();

        let canonical = storage
            .get(&layout().object_key(&uploaded.id))
            .await
            .unwrap();
        let mut expected = format!("blob {}\0", payload.len()).into_bytes();
        expected.extend_from_slice(&payload);
        assert_eq!(inflate(&canonical), expected);
    }
}
