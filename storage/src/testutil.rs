// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! In-memory `BlobStore`/`MultipartStore` for tests.
//!
//! The store keeps blobs in a map and hands out URLs under a caller-provided
//! base address. Tests that exercise real transfers run a small HTTP origin
//! (axum, bound to port 0) whose handlers call `origin_get`/`origin_put`/
//! `origin_put_part` against a clone of the store, so the presigned-URL
//! round-trip is driven end to end. Tests that only need the control plane
//! skip the origin and use the trait methods directly.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest as Sha2Digest, Sha256};

use crate::{BlobStore, CacheInfo, MultipartStore, StorageError, UrlInfo};

struct StoredBlob {
    data: Bytes,
    metadata: Option<HashMap<String, String>>,
}

struct PendingUpload {
    #[allow(dead_code)]
    key: String,
    metadata: Option<HashMap<String, String>>,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Default)]
struct Inner {
    blobs: BTreeMap<String, StoredBlob>,
    uploads: HashMap<String, PendingUpload>,
    pending_metadata: HashMap<String, HashMap<String, String>>,
    upload_sequence: u64,
    fail_commits: usize,
    base_url: Option<String>,
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

fn etag_for(data: &Bytes) -> String {
    hex::encode(Sha256::digest(data))[..16].to_owned()
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Base address (e.g. `http://127.0.0.1:39211`) used for the URLs this
    /// store hands out. Without it the URLs use an unreachable scheme, which
    /// is fine for tests that never transfer.
    pub fn set_base_url(&self, base: &str) {
        self.inner.lock().base_url = Some(base.trim_end_matches('/').to_owned());
    }

    /// Make the next `n` multipart commits fail with a transport error.
    pub fn fail_commits(&self, n: usize) {
        self.inner.lock().fail_commits = n;
    }

    pub fn insert(&self, key: &str, data: Bytes) {
        self.inner.lock().blobs.insert(
            key.to_owned(),
            StoredBlob {
                data,
                metadata: None,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.inner.lock().blobs.get(key).map(|b| b.data.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().blobs.keys().cloned().collect()
    }

    fn base_url(&self) -> String {
        self.inner
            .lock()
            .base_url
            .clone()
            .unwrap_or_else(|| "memory://unreachable".to_owned())
    }

    // Origin-side operations, called by the test HTTP origin that plays the
    // part of the object store behind the presigned URLs.

    pub fn origin_get(&self, key: &str) -> Option<Bytes> {
        self.get(key)
    }

    pub fn origin_put(&self, key: &str, data: Bytes) {
        let mut inner = self.inner.lock();
        let metadata = inner.pending_metadata.remove(key);
        inner
            .blobs
            .insert(key.to_owned(), StoredBlob { data, metadata });
    }

    /// Store one part of a pending multipart upload and return its ETag.
    pub fn origin_put_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, StorageError> {
        let mut inner = self.inner.lock();
        let upload = inner
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| StorageError::InvalidArgument(format!("unknown upload {upload_id}")))?;
        let etag = etag_for(&data);
        upload.parts.insert(part_number, (etag.clone(), data));
        Ok(etag)
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn download_urls(&self, key: &str) -> Result<Vec<UrlInfo>, StorageError> {
        if !self.inner.lock().blobs.contains_key(key) {
            return Err(StorageError::CacheNotFound);
        }
        let base = self.base_url();
        Ok(vec![UrlInfo::new(format!("{base}/blobs/{key}"))])
    }

    async fn upload_url(
        &self,
        key: &str,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<UrlInfo, StorageError> {
        if let Some(metadata) = metadata {
            self.inner
                .lock()
                .pending_metadata
                .insert(key.to_owned(), metadata.clone());
        }
        let base = self.base_url();
        Ok(UrlInfo::new(format!("{base}/put/{key}")))
    }

    async fn cache_info(&self, key: &str, prefixes: &[String]) -> Result<CacheInfo, StorageError> {
        let inner = self.inner.lock();
        if let Some(blob) = inner.blobs.get(key) {
            return Ok(CacheInfo {
                key: key.to_owned(),
                size: blob.data.len() as u64,
                metadata: blob.metadata.clone(),
            });
        }

        for prefix in prefixes {
            let matched = inner
                .blobs
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(prefix.as_str()))
                .next();
            if let Some((key, blob)) = matched {
                return Ok(CacheInfo {
                    key: key.clone(),
                    size: blob.data.len() as u64,
                    metadata: blob.metadata.clone(),
                });
            }
        }

        Err(StorageError::CacheNotFound)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.lock().blobs.remove(key);
        Ok(())
    }
}

#[async_trait]
impl MultipartStore for MemoryStore {
    async fn create_multipart_upload(
        &self,
        key: &str,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<String, StorageError> {
        let mut inner = self.inner.lock();
        inner.upload_sequence += 1;
        let upload_id = format!("upload-{}", inner.upload_sequence);
        inner.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_owned(),
                metadata: metadata.cloned(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part_url(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        _content_length: u64,
    ) -> Result<UrlInfo, StorageError> {
        if !self.inner.lock().uploads.contains_key(upload_id) {
            return Err(StorageError::InvalidArgument(format!(
                "unknown upload {upload_id}"
            )));
        }
        let base = self.base_url();
        Ok(UrlInfo::new(format!("{base}/part/{upload_id}/{part_number}")))
    }

    async fn commit_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        if inner.fail_commits > 0 {
            inner.fail_commits -= 1;
            return Err(StorageError::Unavailable(
                "injected commit failure".to_owned(),
            ));
        }

        let upload = inner
            .uploads
            .get(upload_id)
            .ok_or_else(|| StorageError::InvalidArgument(format!("unknown upload {upload_id}")))?;

        let mut assembled = Vec::new();
        for (part_number, etag) in parts {
            let (stored_etag, data) = upload.parts.get(part_number).ok_or_else(|| {
                StorageError::InvalidArgument(format!("missing part {part_number}"))
            })?;
            if stored_etag != etag {
                return Err(StorageError::InvalidArgument(format!(
                    "etag mismatch for part {part_number}"
                )));
            }
            assembled.extend_from_slice(data);
        }

        let upload = inner.uploads.remove(upload_id).unwrap();
        inner.blobs.insert(
            key.to_owned(),
            StoredBlob {
                data: Bytes::from(assembled),
                metadata: upload.metadata,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::MemoryStore;
    use crate::{BlobStore, MultipartStore, StorageError};

    #[tokio::test]
    async fn cache_info_prefers_exact_match_then_first_prefix() {
        let store = MemoryStore::new();
        store.insert("v1-alpha", Bytes::from_static(b"a"));
        store.insert("v1-beta", Bytes::from_static(b"bb"));

        let info = store.cache_info("v1-beta", &[]).await.unwrap();
        assert_eq!(info.key, "v1-beta");
        assert_eq!(info.size, 2);

        let info = store
            .cache_info("v1-missing", &["v2-".to_owned(), "v1-".to_owned()])
            .await
            .unwrap();
        assert_eq!(info.key, "v1-alpha");

        let err = store
            .cache_info("v1-missing", &["v2-".to_owned()])
            .await
            .unwrap_err();
        assert_eq!(err, StorageError::CacheNotFound);
    }

    #[tokio::test]
    async fn multipart_upload_assembles_parts_in_commit_order() {
        let store = MemoryStore::new();
        let upload_id = store.create_multipart_upload("key", None).await.unwrap();

        let etag2 = store
            .origin_put_part(&upload_id, 2, Bytes::from_static(b"_world"))
            .unwrap();
        let etag1 = store
            .origin_put_part(&upload_id, 1, Bytes::from_static(b"hello"))
            .unwrap();

        store
            .commit_multipart_upload("key", &upload_id, &[(1, etag1), (2, etag2)])
            .await
            .unwrap();

        assert_eq!(store.get("key").unwrap(), Bytes::from_static(b"hello_world"));
    }

    #[tokio::test]
    async fn injected_commit_failure_is_transient() {
        let store = MemoryStore::new();
        let upload_id = store.create_multipart_upload("key", None).await.unwrap();
        let etag = store
            .origin_put_part(&upload_id, 1, Bytes::from_static(b"data"))
            .unwrap();

        store.fail_commits(1);
        let parts = vec![(1, etag)];
        store
            .commit_multipart_upload("key", &upload_id, &parts)
            .await
            .unwrap_err();
        store
            .commit_multipart_upload("key", &upload_id, &parts)
            .await
            .unwrap();
        assert_eq!(store.get("key").unwrap(), Bytes::from_static(b"data"));
    }
}
