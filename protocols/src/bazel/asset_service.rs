// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Remote Asset: maps external URIs (plus qualifiers) to CAS digests. A
//! mapping is a small JSON record stored under a key derived from the
//! canonical form of (kind, instance, uri, qualifiers). Fetching a blob whose
//! URI has no usable mapping falls back to downloading from the origin,
//! caching the bytes in CAS, and recording mappings for every requested URI.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use digest::Digest;
use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};
use storage::StorageError;
use tokio::io::AsyncWriteExt;
use tonic::{Request, Response, Status};
use url_proxy::ProxyError;

use protos::build::bazel::remote::asset::v1::fetch_server::Fetch;
use protos::build::bazel::remote::asset::v1::push_server::Push;
use protos::build::bazel::remote::asset::v1::{
    FetchBlobRequest, FetchBlobResponse, FetchDirectoryRequest, FetchDirectoryResponse,
    PushBlobRequest, PushBlobResponse, PushDirectoryRequest, PushDirectoryResponse, Qualifier,
};

use super::InnerServer;

const ASSET_KEY_PREFIX: &str = "bazel/asset/v1/";

/// Ceiling for origin fetches regardless of the client-requested timeout.
const MAX_FETCH_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Clone, Copy, Eq, PartialEq)]
enum AssetKind {
    Blob,
    Directory,
}

impl AssetKind {
    fn as_str(self) -> &'static str {
        match self {
            AssetKind::Blob => "blob",
            AssetKind::Directory => "directory",
        }
    }
}

const DIGEST_FUNCTION: &str = "sha256";

#[derive(Debug, Deserialize, Serialize)]
struct AssetRecord {
    uri: String,
    qualifiers: Vec<(String, String)>,
    digest_hash: String,
    digest_size: u64,
    digest_function: String,
    expires_at: Option<i64>,
    pushed_at: i64,
}

pub(super) struct AssetService {
    pub(super) inner: Arc<InnerServer>,
}

/// Sort qualifiers lexicographically by (name, value); duplicate names are an
/// error so the canonical form is unique.
fn canonical_qualifiers(qualifiers: Vec<Qualifier>) -> Result<Vec<(String, String)>, Status> {
    let mut qualifiers: Vec<(String, String)> = qualifiers
        .into_iter()
        .map(|q| (q.name, q.value))
        .collect();
    qualifiers.sort();
    for pair in qualifiers.windows(2) {
        if pair[0].0 == pair[1].0 {
            return Err(Status::invalid_argument(format!(
                "duplicate qualifier name: {}",
                pair[0].0
            )));
        }
    }
    Ok(qualifiers)
}

/// The storage key is derived from the canonical form
/// `kind \0 instance \0 uri \0 name=value \0 ...` with qualifiers already
/// sorted by (name, value).
fn mapping_key(
    kind: AssetKind,
    instance: &str,
    uri: &str,
    qualifiers: &[(String, String)],
) -> String {
    let mut canonical = format!("{}\0{instance}\0{uri}", kind.as_str());
    for (name, value) in qualifiers {
        canonical.push('\0');
        canonical.push_str(name);
        canonical.push('=');
        canonical.push_str(value);
    }
    format!(
        "{ASSET_KEY_PREFIX}{}",
        hex::encode(Sha256::digest(canonical.as_bytes()))
    )
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn timestamp_to_unix(timestamp: &prost_types::Timestamp) -> i64 {
    timestamp.seconds
}

fn http_status_to_grpc(code: u16) -> Status {
    let message = format!("origin fetch failed with status {code}");
    match code {
        404 => Status::not_found(message),
        401 | 403 => Status::permission_denied(message),
        429 => Status::resource_exhausted(message),
        _ => Status::unavailable(message),
    }
}

impl AssetService {
    async fn store_mapping(
        &self,
        kind: AssetKind,
        instance: &str,
        uri: &str,
        qualifiers: &[(String, String)],
        digest: &Digest,
        expires_at: Option<i64>,
    ) -> Result<(), Status> {
        let record = AssetRecord {
            uri: uri.to_owned(),
            qualifiers: qualifiers.to_vec(),
            digest_hash: digest.hex(),
            digest_size: digest.size_bytes,
            digest_function: DIGEST_FUNCTION.to_owned(),
            expires_at,
            pushed_at: unix_now(),
        };
        let payload = serde_json::to_vec(&record)
            .map_err(|err| Status::internal(format!("encode asset record: {err}")))?;

        let key = mapping_key(kind, instance, uri, qualifiers);
        let info = self
            .inner
            .deps
            .storage
            .upload_url(&key, None)
            .await
            .map_err(|err| Status::internal(err.to_string()))?;
        self.inner
            .deps
            .url_proxy
            .upload_bytes(&info, Bytes::from(payload))
            .await
            .map_err(|err| Status::internal(err.to_string()))?;
        Ok(())
    }

    async fn load_mapping(
        &self,
        kind: AssetKind,
        instance: &str,
        uri: &str,
        qualifiers: &[(String, String)],
    ) -> Result<Option<AssetRecord>, Status> {
        let key = mapping_key(kind, instance, uri, qualifiers);
        let urls = match self.inner.deps.storage.download_urls(&key).await {
            Ok(urls) => urls,
            Err(StorageError::CacheNotFound) => return Ok(None),
            Err(err) => return Err(Status::internal(err.to_string())),
        };
        let payload = match self.inner.deps.url_proxy.download_bytes(&urls).await {
            Ok(payload) => payload,
            Err(ProxyError::NotFound) => return Ok(None),
            Err(err) => return Err(Status::internal(err.to_string())),
        };
        let record: AssetRecord = serde_json::from_slice(&payload)
            .map_err(|err| Status::internal(format!("decode asset record: {err}")))?;
        Ok(Some(record))
    }

    /// Look for a usable pre-recorded mapping: one that is recent enough and
    /// whose referenced blob still exists in CAS.
    async fn find_cached(
        &self,
        kind: AssetKind,
        instance: &str,
        uris: &[String],
        qualifiers: &[(String, String)],
        oldest_accepted: Option<i64>,
    ) -> Result<Option<(String, Digest)>, Status> {
        for uri in uris {
            let record = match self.load_mapping(kind, instance, uri, qualifiers).await? {
                Some(record) => record,
                None => continue,
            };
            if let Some(oldest) = oldest_accepted {
                if record.pushed_at < oldest {
                    continue;
                }
            }
            // A record hashed with anything else cannot address our CAS keys.
            if record.digest_function != DIGEST_FUNCTION {
                continue;
            }
            let digest = match Digest::new(&record.digest_hash, record.digest_size) {
                Ok(digest) => digest,
                Err(_) => continue,
            };
            let exists = self
                .inner
                .blob_exists(instance, &digest)
                .await
                .map_err(|err| Status::internal(err.to_string()))?;
            if exists {
                return Ok(Some((uri.clone(), digest)));
            }
        }
        Ok(None)
    }

    /// Download one of the URIs into CAS, hashing while spooling to a temp
    /// file. Returns the URI that was fetched and the resulting digest.
    async fn fetch_from_origin(
        &self,
        instance: &str,
        uris: &[String],
        timeout: Duration,
    ) -> Result<(String, Digest), Status> {
        let http_uris: Vec<&String> = uris
            .iter()
            .filter(|uri| uri.starts_with("http://") || uri.starts_with("https://"))
            .collect();
        if http_uris.is_empty() {
            return Err(Status::invalid_argument(
                "no fetchable (http or https) URIs in request",
            ));
        }

        let mut last_error = Status::unavailable("origin fetch failed");
        for uri in http_uris {
            match self.fetch_one(instance, uri, timeout).await {
                Ok(digest) => return Ok((uri.clone(), digest)),
                Err(err) => {
                    tracing::warn!(uri, error = %err, "origin fetch attempt failed");
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    async fn fetch_one(
        &self,
        instance: &str,
        uri: &str,
        timeout: Duration,
    ) -> Result<Digest, Status> {
        let response = self
            .inner
            .deps
            .http_client
            .get(uri)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    Status::deadline_exceeded(format!("origin fetch timed out: {err}"))
                } else {
                    Status::unavailable(format!("origin fetch failed: {err}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(http_status_to_grpc(status.as_u16()));
        }

        let spool_path = std::env::temp_dir().join(format!(
            "omni-cache-fetch-{:016x}",
            rand::random::<u64>()
        ));
        let result = self.spool_and_store(instance, response, &spool_path).await;
        let _ = tokio::fs::remove_file(&spool_path).await;
        result
    }

    async fn spool_and_store(
        &self,
        instance: &str,
        mut response: reqwest::Response,
        spool_path: &std::path::Path,
    ) -> Result<Digest, Status> {
        let mut spool = tokio::fs::File::create(spool_path)
            .await
            .map_err(|err| Status::internal(format!("create spool file: {err}")))?;

        let mut hasher = Sha256::default();
        let mut total: u64 = 0;
        loop {
            let chunk = response
                .chunk()
                .await
                .map_err(|err| Status::unavailable(format!("origin body read: {err}")))?;
            let chunk = match chunk {
                Some(chunk) => chunk,
                None => break,
            };
            hasher.update(&chunk);
            total += chunk.len() as u64;
            spool
                .write_all(&chunk)
                .await
                .map_err(|err| Status::internal(format!("write spool file: {err}")))?;
        }
        spool
            .shutdown()
            .await
            .map_err(|err| Status::internal(format!("flush spool file: {err}")))?;

        let digest = Digest::from_slice(hasher.finalize().as_slice(), total)
            .map_err(Status::internal)?;

        let data = tokio::fs::read(spool_path)
            .await
            .map_err(|err| Status::internal(format!("read spool file: {err}")))?;
        self.inner
            .write_blob(instance, &digest, Bytes::from(data))
            .await
            .map_err(Status::internal)?;
        Ok(digest)
    }

    async fn push(
        &self,
        kind: AssetKind,
        instance: &str,
        uris: Vec<String>,
        qualifiers: Vec<Qualifier>,
        api_digest: Option<protos::build::bazel::remote::execution::v2::Digest>,
        expire_at: Option<prost_types::Timestamp>,
    ) -> Result<(), Status> {
        if uris.is_empty() {
            return Err(Status::invalid_argument("at least one URI is required"));
        }
        let qualifiers = canonical_qualifiers(qualifiers)?;
        let digest =
            digest::required_digest("digest", api_digest).map_err(Status::invalid_argument)?;
        let expires_at = expire_at.as_ref().map(timestamp_to_unix);

        for uri in &uris {
            self.store_mapping(kind, instance, uri, &qualifiers, &digest, expires_at)
                .await?;
        }
        Ok(())
    }
}

fn fetch_timeout(requested: Option<&prost_types::Duration>) -> Duration {
    let requested = requested
        .map(|d| Duration::from_secs(d.seconds.max(0) as u64))
        .filter(|d| !d.is_zero())
        .unwrap_or(MAX_FETCH_TIMEOUT);
    requested.min(MAX_FETCH_TIMEOUT)
}

#[tonic::async_trait]
impl Fetch for AssetService {
    #[tracing::instrument(skip_all)]
    async fn fetch_blob(
        &self,
        request: Request<FetchBlobRequest>,
    ) -> Result<Response<FetchBlobResponse>, Status> {
        let request = request.into_inner();
        let instance = request.instance_name;
        let qualifiers = canonical_qualifiers(request.qualifiers)?;
        let oldest_accepted = request
            .oldest_content_accepted
            .as_ref()
            .map(timestamp_to_unix);

        let cached = self
            .find_cached(
                AssetKind::Blob,
                &instance,
                &request.uris,
                &qualifiers,
                oldest_accepted,
            )
            .await?;
        let (uri, digest) = match cached {
            Some(found) => {
                self.inner.deps.stats.record_hit();
                found
            }
            None => {
                self.inner.deps.stats.record_miss();
                let timeout = fetch_timeout(request.timeout.as_ref());
                let (uri, digest) = self
                    .fetch_from_origin(&instance, &request.uris, timeout)
                    .await?;
                // Every requested URI now maps to the fetched content.
                for mapped_uri in &request.uris {
                    self.store_mapping(
                        AssetKind::Blob,
                        &instance,
                        mapped_uri,
                        &qualifiers,
                        &digest,
                        None,
                    )
                    .await?;
                }
                (uri, digest)
            }
        };

        Ok(Response::new(FetchBlobResponse {
            status: Some(protos::google::rpc::Status::default()),
            uri,
            qualifiers: qualifiers
                .into_iter()
                .map(|(name, value)| Qualifier { name, value })
                .collect(),
            expires_at: None,
            blob_digest: Some(digest.into()),
        }))
    }

    /// Directories can only be resolved from pre-pushed mappings; there is no
    /// origin format to fetch them from.
    #[tracing::instrument(skip_all)]
    async fn fetch_directory(
        &self,
        request: Request<FetchDirectoryRequest>,
    ) -> Result<Response<FetchDirectoryResponse>, Status> {
        let request = request.into_inner();
        let instance = request.instance_name;
        let qualifiers = canonical_qualifiers(request.qualifiers)?;
        let oldest_accepted = request
            .oldest_content_accepted
            .as_ref()
            .map(timestamp_to_unix);

        let cached = self
            .find_cached(
                AssetKind::Directory,
                &instance,
                &request.uris,
                &qualifiers,
                oldest_accepted,
            )
            .await?;
        match cached {
            Some((uri, digest)) => {
                self.inner.deps.stats.record_hit();
                Ok(Response::new(FetchDirectoryResponse {
                    status: Some(protos::google::rpc::Status::default()),
                    uri,
                    qualifiers: qualifiers
                        .into_iter()
                        .map(|(name, value)| Qualifier { name, value })
                        .collect(),
                    expires_at: None,
                    root_directory_digest: Some(digest.into()),
                }))
            }
            None => {
                self.inner.deps.stats.record_miss();
                Err(Status::not_found("no directory mapping for requested URIs"))
            }
        }
    }
}

#[tonic::async_trait]
impl Push for AssetService {
    #[tracing::instrument(skip_all)]
    async fn push_blob(
        &self,
        request: Request<PushBlobRequest>,
    ) -> Result<Response<PushBlobResponse>, Status> {
        let request = request.into_inner();
        self.push(
            AssetKind::Blob,
            &request.instance_name.clone(),
            request.uris,
            request.qualifiers,
            request.blob_digest,
            request.expire_at,
        )
        .await?;
        Ok(Response::new(PushBlobResponse {}))
    }

    #[tracing::instrument(skip_all)]
    async fn push_directory(
        &self,
        request: Request<PushDirectoryRequest>,
    ) -> Result<Response<PushDirectoryResponse>, Status> {
        let request = request.into_inner();
        self.push(
            AssetKind::Directory,
            &request.instance_name.clone(),
            request.uris,
            request.qualifiers,
            request.root_directory_digest,
            request.expire_at,
        )
        .await?;
        Ok(Response::new(PushDirectoryResponse {}))
    }
}
