// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![allow(clippy::new_without_default)]

use std::collections::HashMap;

use async_trait::async_trait;

mod error;
pub mod s3;
pub mod testutil;

pub use error::StorageError;
pub use s3::S3Store;

/// A URL a client (or the URL proxy) can use for a direct transfer, plus the
/// headers that must accompany the request for its signature to hold.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UrlInfo {
    pub url: String,
    pub extra_headers: HashMap<String, String>,
}

impl UrlInfo {
    pub fn new(url: impl Into<String>) -> Self {
        UrlInfo {
            url: url.into(),
            extra_headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(name.into(), value.into());
        self
    }
}

/// Result of a `cache_info` lookup: the key that matched (the requested key or
/// the first prefix match), its size, and any user metadata stored with it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CacheInfo {
    pub key: String,
    pub size: u64,
    pub metadata: Option<HashMap<String, String>>,
}

/// Presigned-URL access to a blob store. Keys are opaque byte sequences exposed
/// as path segments; uniqueness scope is the backend.
#[async_trait]
pub trait BlobStore {
    /// Ordered list of URLs from which the blob may be downloaded. Callers try
    /// them in order. Fails with `StorageError::CacheNotFound` when the key is
    /// absent.
    async fn download_urls(&self, key: &str) -> Result<Vec<UrlInfo>, StorageError>;

    /// A presigned PUT URL for uploading the blob in one request.
    async fn upload_url(
        &self,
        key: &str,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<UrlInfo, StorageError>;

    /// Look up `key`, falling back to the first object whose key starts with
    /// any of `prefixes` (in backend-defined order). Fails with
    /// `StorageError::CacheNotFound` when nothing matches.
    async fn cache_info(&self, key: &str, prefixes: &[String]) -> Result<CacheInfo, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Extends `BlobStore` with multipart uploads. Part numbers are 1-based; the
/// backend concatenates parts in ascending part-number order on commit.
#[async_trait]
pub trait MultipartStore: BlobStore {
    async fn create_multipart_upload(
        &self,
        key: &str,
        metadata: Option<&HashMap<String, String>>,
    ) -> Result<String, StorageError>;

    async fn upload_part_url(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        content_length: u64,
    ) -> Result<UrlInfo, StorageError>;

    async fn commit_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> Result<(), StorageError>;
}
