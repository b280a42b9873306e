// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! GitHub Actions cache v1 (`/_apis/artifactcache`): lookup with restore-key
//! fallback, and the reserve/part-PATCH/commit upload session machine.
//!
//! Clients address parts by byte range, not part number. The per-session
//! resolver assigns part numbers in first-appearance order and the blob is
//! assembled in part-number order at commit, so retried, overlapping, or
//! out-of-order ranges from the Actions toolkit are all accepted.

use std::sync::Arc;

use axum::extract::{BodyStream, Path, Query, State};
use axum::http::header::CONTENT_RANGE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{on, MethodFilter};
use axum::Json;
use futures::StreamExt;
use protocol::{Deps, Protocol, ProtocolFactory, Registrar, RegistrationError};
use serde::{Deserialize, Serialize};
use storage::StorageError;
use url_proxy::ProxyError;

use crate::session::{SessionStore, UploadSession, SESSION_TTL};

use super::{client_key, storage_key, url_path_component};

pub const MOUNT: &str = "/_apis/artifactcache";

pub struct GhaV1Factory;

impl ProtocolFactory for GhaV1Factory {
    fn id(&self) -> &'static str {
        "gha-v1"
    }

    fn create(&self, deps: &Deps) -> Result<Box<dyn Protocol>, RegistrationError> {
        let sessions = SessionStore::new();
        sessions.spawn_reaper(SESSION_TTL);
        Ok(Box::new(GhaV1 {
            state: Arc::new(GhaV1State {
                deps: deps.clone(),
                sessions,
            }),
        }))
    }
}

struct GhaV1State {
    deps: Deps,
    sessions: SessionStore,
}

pub struct GhaV1 {
    state: Arc<GhaV1State>,
}

impl Protocol for GhaV1 {
    fn register(self: Box<Self>, registrar: &mut Registrar) -> Result<(), RegistrationError> {
        registrar.route(
            &format!("{MOUNT}/cache"),
            on(MethodFilter::GET, lookup).with_state(self.state.clone()),
        );
        registrar.route(
            &format!("{MOUNT}/caches"),
            on(MethodFilter::POST, reserve).with_state(self.state.clone()),
        );
        registrar.route(
            &format!("{MOUNT}/caches/:id"),
            on(MethodFilter::PATCH, upload_part)
                .on(MethodFilter::POST, commit)
                .with_state(self.state),
        );
        Ok(())
    }
}

#[derive(Deserialize)]
struct LookupQuery {
    keys: String,
    version: String,
}

#[derive(Serialize)]
struct LookupResponse {
    #[serde(rename = "cacheKey")]
    cache_key: String,
    #[serde(rename = "archiveLocation")]
    archive_location: String,
}

async fn lookup(
    State(state): State<Arc<GhaV1State>>,
    Query(query): Query<LookupQuery>,
) -> Response {
    let mut keys = query.keys.split(',');
    let primary = match keys.next() {
        Some(key) if !key.is_empty() => key,
        _ => return (StatusCode::BAD_REQUEST, "missing cache keys").into_response(),
    };

    let primary_key = storage_key(&query.version, primary);
    // The remaining keys are restore-key prefixes within the same version.
    let prefixes: Vec<String> = keys
        .filter(|key| !key.is_empty())
        .map(|key| storage_key(&query.version, key))
        .collect();

    match state.deps.storage.cache_info(&primary_key, &prefixes).await {
        Ok(info) => {
            state.deps.stats.record_hit();
            let archive_location = stats::append_skip_marker(&format!(
                "http://{}/{}",
                state.deps.host,
                url_path_component(&info.key)
            ));
            Json(LookupResponse {
                cache_key: client_key(&info.key, &query.version),
                archive_location,
            })
            .into_response()
        }
        Err(StorageError::CacheNotFound) => {
            state.deps.stats.record_miss();
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => {
            tracing::error!(error = %err, "cache lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Deserialize)]
struct ReserveRequest {
    key: String,
    version: String,
}

#[derive(Serialize)]
struct ReserveResponse {
    #[serde(rename = "cacheId")]
    cache_id: u64,
}

async fn reserve(
    State(state): State<Arc<GhaV1State>>,
    Json(request): Json<ReserveRequest>,
) -> Response {
    let key = storage_key(&request.version, &request.key);
    let upload_id = match state.deps.storage.create_multipart_upload(&key, None).await {
        Ok(id) => id,
        Err(err) => {
            tracing::error!(key, error = %err, "failed to reserve cache upload");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let cache_id = state.sessions.new_session_id();
    state
        .sessions
        .insert(cache_id, UploadSession::new(key, request.version, upload_id));

    (StatusCode::CREATED, Json(ReserveResponse { cache_id })).into_response()
}

/// Parse `Content-Range: bytes X-Y/*` with exactly one byte range.
fn parse_content_range(headers: &HeaderMap) -> Result<(u64, u64), String> {
    let value = headers
        .get(CONTENT_RANGE)
        .ok_or("missing Content-Range header")?
        .to_str()
        .map_err(|_| "malformed Content-Range header")?;

    let range = value
        .strip_prefix("bytes ")
        .ok_or(format!("unsupported Content-Range unit: {value}"))?;
    if range.contains(',') {
        return Err(format!("expected exactly one byte range: {value}"));
    }
    let range = range.split('/').next().unwrap_or_default();
    let (start, end) = range
        .split_once('-')
        .ok_or(format!("malformed byte range: {value}"))?;
    let start: u64 = start
        .parse()
        .map_err(|_| format!("malformed range start: {value}"))?;
    let end: u64 = end
        .parse()
        .map_err(|_| format!("malformed range end: {value}"))?;
    if end < start {
        return Err(format!("inverted byte range: {value}"));
    }
    Ok((start, end))
}

async fn upload_part(
    State(state): State<Arc<GhaV1State>>,
    Path(cache_id): Path<u64>,
    headers: HeaderMap,
    body: BodyStream,
) -> Response {
    let (start, end) = match parse_content_range(&headers) {
        Ok(range) => range,
        Err(msg) => return (StatusCode::BAD_REQUEST, msg).into_response(),
    };
    let length = end - start + 1;

    let session_info = state.sessions.with_session(cache_id, |session| {
        let part_number = session.resolve_part(start, end);
        (session.key.clone(), session.upload_id.clone(), part_number)
    });
    let (key, upload_id, part_number) = match session_info {
        Some(info) => info,
        None => return (StatusCode::NOT_FOUND, "unknown cache id").into_response(),
    };

    let url_info = match state
        .deps
        .storage
        .upload_part_url(&key, &upload_id, part_number, length)
        .await
    {
        Ok(info) => info,
        Err(err) => {
            tracing::error!(key, part_number, error = %err, "failed to presign part upload");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    // Content-Length must match the range length exactly or the part URL's
    // signature will not hold.
    let stream = body.map(|chunk| chunk.map_err(|err| ProxyError::Io(err.to_string())));
    match state
        .deps
        .url_proxy
        .upload_part_stream(&url_info, stream, Some(length))
        .await
    {
        Ok(outcome) => {
            state.sessions.with_session(cache_id, |session| {
                session.record_part(part_number, outcome.etag.unwrap_or_default(), length);
            });
            StatusCode::OK.into_response()
        }
        // The backend's verdict passes through untouched.
        Err(ProxyError::Status(code)) => StatusCode::from_u16(code)
            .unwrap_or(StatusCode::BAD_GATEWAY)
            .into_response(),
        // 502 tells the Actions toolkit to retry the chunk.
        Err(err) => {
            tracing::warn!(key, part_number, error = %err, "part upload failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

#[derive(Deserialize)]
struct CommitRequest {
    size: u64,
}

async fn commit(
    State(state): State<Arc<GhaV1State>>,
    Path(cache_id): Path<u64>,
    Json(request): Json<CommitRequest>,
) -> Response {
    let session_info = state.sessions.with_session(cache_id, |session| {
        (
            session.key.clone(),
            session.upload_id.clone(),
            session.finalize(),
            session.started_at(),
        )
    });
    let (key, upload_id, (parts, total_size), started_at) = match session_info {
        Some(info) => info,
        None => return (StatusCode::NOT_FOUND, "unknown cache id").into_response(),
    };

    if total_size != request.size {
        return (
            StatusCode::BAD_REQUEST,
            format!(
                "declared size {} does not match uploaded size {total_size}",
                request.size
            ),
        )
            .into_response();
    }

    match state
        .deps
        .storage
        .commit_multipart_upload(&key, &upload_id, &parts)
        .await
    {
        Ok(()) => {
            state
                .deps
                .stats
                .record_upload(total_size, started_at.elapsed());
            state.sessions.remove(cache_id);
            StatusCode::CREATED.into_response()
        }
        // The session stays so the client can retry the commit.
        Err(err) => {
            tracing::warn!(key, error = %err, "cache commit failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::StatusCode;
    use serde_json::{json, Value};

    use crate::http_cache::HttpCacheFactory;
    use crate::testutil::{
        http_router, http_router_all, json_request, request, send, spawn_origin, test_deps,
    };
    use storage::testutil::MemoryStore;

    use super::GhaV1Factory;

    async fn reserve(router: &axum::Router, key: &str, version: &str) -> u64 {
        let (status, body) = send(
            router,
            json_request(
                "POST",
                "/_apis/artifactcache/caches",
                json!({"key": key, "version": version}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let response: Value = serde_json::from_slice(&body).unwrap();
        response["cacheId"].as_u64().unwrap()
    }

    fn patch_request(cache_id: u64, range: &str, body: &'static [u8]) -> http::Request<hyper::Body> {
        http::Request::builder()
            .method("PATCH")
            .uri(format!("/_apis/artifactcache/caches/{cache_id}"))
            .header("Content-Range", range)
            .body(hyper::Body::from(Bytes::from_static(body)))
            .unwrap()
    }

    #[tokio::test]
    async fn two_part_upload_then_lookup_hits() {
        let store = MemoryStore::new();
        spawn_origin(&store).await;
        let deps = test_deps(&store);
        let router = http_router_all(&[&HttpCacheFactory, &GhaV1Factory], &deps);

        let cache_id = reserve(&router, "k", "v").await;
        assert!(cache_id < (1 << 53));

        let (status, _) = send(&router, patch_request(cache_id, "bytes 0-4/*", b"hello")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&router, patch_request(cache_id, "bytes 5-10/*", b"_world")).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(
            &router,
            json_request(
                "POST",
                &format!("/_apis/artifactcache/caches/{cache_id}"),
                json!({"size": 11}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(store.get("v-k").unwrap(), Bytes::from_static(b"hello_world"));

        let (status, body) = send(
            &router,
            request("GET", "/_apis/artifactcache/cache?keys=k&version=v", ""),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let response: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(response["cacheKey"], "k");
        let location = response["archiveLocation"].as_str().unwrap();
        assert!(location.contains("/v-k"));
        assert!(location.contains("omni_cache_skip_hit_miss=1"));

        // The archive URL points at the HTTP cache handler on this process.
        let path = location.strip_prefix("http://localhost:12321").unwrap();
        let (status, body) = send(&router, request("GET", path, "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"hello_world"));

        let snapshot = deps.stats.snapshot();
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.uploads.count, 1);
        assert_eq!(snapshot.uploads.bytes, 11);
    }

    #[tokio::test]
    async fn lookup_miss_returns_204() {
        let store = MemoryStore::new();
        let deps = test_deps(&store);
        let router = http_router(&GhaV1Factory, &deps);

        let (status, _) = send(
            &router,
            request("GET", "/_apis/artifactcache/cache?keys=k&version=v", ""),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(deps.stats.snapshot().cache_misses, 1);
    }

    #[tokio::test]
    async fn lookup_falls_back_to_restore_key_prefix() {
        let store = MemoryStore::new();
        store.insert("v-cargo-linux-x86", Bytes::from_static(b"blob"));
        let deps = test_deps(&store);
        let router = http_router(&GhaV1Factory, &deps);

        let (status, body) = send(
            &router,
            request(
                "GET",
                "/_apis/artifactcache/cache?keys=cargo-windows,cargo-linux&version=v",
                "",
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let response: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(response["cacheKey"], "cargo-linux-x86");
    }

    #[tokio::test]
    async fn commit_with_wrong_size_is_rejected_and_retryable() {
        let store = MemoryStore::new();
        spawn_origin(&store).await;
        let deps = test_deps(&store);
        let router = http_router(&GhaV1Factory, &deps);

        let cache_id = reserve(&router, "k", "v").await;
        let (status, _) = send(&router, patch_request(cache_id, "bytes 0-4/*", b"hello")).await;
        assert_eq!(status, StatusCode::OK);

        let commit_uri = format!("/_apis/artifactcache/caches/{cache_id}");
        let (status, _) = send(&router, json_request("POST", &commit_uri, json!({"size": 99}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // The session survived; a correct commit succeeds.
        let (status, _) = send(&router, json_request("POST", &commit_uri, json!({"size": 5}))).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn commit_survives_one_backend_failure() {
        let store = MemoryStore::new();
        spawn_origin(&store).await;
        let deps = test_deps(&store);
        let router = http_router(&GhaV1Factory, &deps);

        let cache_id = reserve(&router, "k", "v").await;
        let (status, _) = send(&router, patch_request(cache_id, "bytes 0-4/*", b"hello")).await;
        assert_eq!(status, StatusCode::OK);

        store.fail_commits(1);
        let commit_uri = format!("/_apis/artifactcache/caches/{cache_id}");
        let (status, _) = send(&router, json_request("POST", &commit_uri, json!({"size": 5}))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        let (status, _) = send(&router, json_request("POST", &commit_uri, json!({"size": 5}))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(store.get("v-k").unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn duplicate_range_reuses_its_part_number() {
        let store = MemoryStore::new();
        spawn_origin(&store).await;
        let deps = test_deps(&store);
        let router = http_router(&GhaV1Factory, &deps);

        let cache_id = reserve(&router, "k", "v").await;
        // a retried chunk must not become a new part
        let (status, _) = send(&router, patch_request(cache_id, "bytes 0-4/*", b"hello")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&router, patch_request(cache_id, "bytes 0-4/*", b"hello")).await;
        assert_eq!(status, StatusCode::OK);

        let commit_uri = format!("/_apis/artifactcache/caches/{cache_id}");
        let (status, _) = send(&router, json_request("POST", &commit_uri, json!({"size": 5}))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(store.get("v-k").unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn part_upload_for_unknown_session_is_404() {
        let store = MemoryStore::new();
        let deps = test_deps(&store);
        let router = http_router(&GhaV1Factory, &deps);

        let (status, _) = send(&router, patch_request(42, "bytes 0-4/*", b"hello")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn content_range_parsing() {
        use super::parse_content_range;
        use http::HeaderMap;

        let mut headers = HeaderMap::new();
        headers.insert("Content-Range", "bytes 0-4/*".parse().unwrap());
        assert_eq!(parse_content_range(&headers).unwrap(), (0, 4));

        headers.insert("Content-Range", "bytes 5-10/11".parse().unwrap());
        assert_eq!(parse_content_range(&headers).unwrap(), (5, 10));

        for bad in ["items 0-4/*", "bytes 4-0/*", "bytes 0-4,6-8/*", "bytes x-y/*"] {
            headers.insert("Content-Range", bad.parse().unwrap());
            parse_content_range(&headers).unwrap_err();
        }

        headers.remove("Content-Range");
        parse_content_range(&headers).unwrap_err();
    }
}
