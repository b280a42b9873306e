// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! GitHub Actions cache v2: three Twirp JSON RPCs that hand the client URLs
//! rooted at the local Azure Blob compatibility endpoint. The entry id
//! returned by finalize has no semantic beyond acknowledging the upload.

use std::hash::Hasher;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{on, MethodFilter};
use axum::Json;
use fnv::FnvHasher;
use protocol::{Deps, Protocol, ProtocolFactory, Registrar, RegistrationError};
use serde::{Deserialize, Serialize};
use storage::StorageError;

use super::{client_key, storage_key, url_path_component};
use crate::azure_blob;

pub const MOUNT: &str = "/twirp/github.actions.results.api.v1.CacheService";

pub struct GhaV2Factory;

impl ProtocolFactory for GhaV2Factory {
    fn id(&self) -> &'static str {
        "gha-v2"
    }

    fn create(&self, deps: &Deps) -> Result<Box<dyn Protocol>, RegistrationError> {
        Ok(Box::new(GhaV2 {
            state: Arc::new(deps.clone()),
        }))
    }
}

pub struct GhaV2 {
    state: Arc<Deps>,
}

impl Protocol for GhaV2 {
    fn register(self: Box<Self>, registrar: &mut Registrar) -> Result<(), RegistrationError> {
        registrar.route(
            &format!("{MOUNT}/CreateCacheEntry"),
            on(MethodFilter::POST, create_cache_entry).with_state(self.state.clone()),
        );
        registrar.route(
            &format!("{MOUNT}/FinalizeCacheEntryUpload"),
            on(MethodFilter::POST, finalize_cache_entry_upload).with_state(self.state.clone()),
        );
        registrar.route(
            &format!("{MOUNT}/GetCacheEntryDownloadURL"),
            on(MethodFilter::POST, get_cache_entry_download_url).with_state(self.state),
        );
        Ok(())
    }
}

fn azure_blob_url(host: &str, key: &str) -> String {
    format!("http://{host}{}/{}", azure_blob::MOUNT, url_path_component(key))
}

#[derive(Deserialize)]
struct CreateCacheEntryRequest {
    key: String,
    version: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateCacheEntryResponse {
    ok: bool,
    signed_upload_url: String,
}

async fn create_cache_entry(
    State(state): State<Arc<Deps>>,
    Json(request): Json<CreateCacheEntryRequest>,
) -> Response {
    let key = storage_key(&request.version, &request.key);
    // The upload URL carries no stats-skip marker: PUTs never touch the
    // hit/miss counters.
    Json(CreateCacheEntryResponse {
        ok: true,
        signed_upload_url: azure_blob_url(&state.host, &key),
    })
    .into_response()
}

#[derive(Deserialize)]
struct FinalizeRequest {
    key: String,
    version: String,
    #[serde(rename = "sizeBytes", alias = "size_bytes", default)]
    size_bytes: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FinalizeResponse {
    ok: bool,
    entry_id: String,
}

async fn finalize_cache_entry_upload(
    State(_state): State<Arc<Deps>>,
    Json(request): Json<FinalizeRequest>,
) -> Response {
    let mut hasher = FnvHasher::default();
    hasher.write(request.key.as_bytes());
    hasher.write(&request.size_bytes.to_le_bytes());
    hasher.write(request.version.as_bytes());

    Json(FinalizeResponse {
        ok: true,
        entry_id: hasher.finish().to_string(),
    })
    .into_response()
}

#[derive(Deserialize)]
struct GetDownloadUrlRequest {
    key: String,
    version: String,
    #[serde(rename = "restoreKeys", alias = "restore_keys", default)]
    restore_keys: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GetDownloadUrlResponse {
    ok: bool,
    signed_download_url: String,
    matched_key: String,
}

async fn get_cache_entry_download_url(
    State(state): State<Arc<Deps>>,
    Json(request): Json<GetDownloadUrlRequest>,
) -> Response {
    let primary_key = storage_key(&request.version, &request.key);
    let prefixes: Vec<String> = request
        .restore_keys
        .iter()
        .map(|key| storage_key(&request.version, key))
        .collect();

    match state.storage.cache_info(&primary_key, &prefixes).await {
        Ok(info) => {
            state.stats.record_hit();
            // The client downloads through the Azure shim on this process;
            // the marker keeps that GET from counting a second hit.
            let url = stats::append_skip_marker(&azure_blob_url(&state.host, &info.key));
            Json(GetDownloadUrlResponse {
                ok: true,
                signed_download_url: url,
                matched_key: client_key(&info.key, &request.version),
            })
            .into_response()
        }
        Err(StorageError::CacheNotFound) => {
            state.stats.record_miss();
            Json(GetDownloadUrlResponse {
                ok: false,
                signed_download_url: String::new(),
                matched_key: String::new(),
            })
            .into_response()
        }
        Err(err) => {
            tracing::error!(error = %err, "download URL lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::StatusCode;
    use serde_json::{json, Value};

    use crate::azure_blob::AzureBlobFactory;
    use crate::testutil::{http_router, http_router_all, json_request, request, send, spawn_origin, test_deps};
    use storage::testutil::MemoryStore;

    use super::GhaV2Factory;

    const MOUNT: &str = "/twirp/github.actions.results.api.v1.CacheService";

    #[tokio::test]
    async fn create_upload_finalize_download_round_trip() {
        let store = MemoryStore::new();
        spawn_origin(&store).await;
        let deps = test_deps(&store);
        let router = http_router_all(&[&AzureBlobFactory, &GhaV2Factory], &deps);

        let (status, body) = send(
            &router,
            json_request(
                "POST",
                &format!("{MOUNT}/CreateCacheEntry"),
                json!({"key": "k", "version": "v"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let response: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(response["ok"], true);
        let upload_url = response["signedUploadUrl"].as_str().unwrap();
        assert!(upload_url.contains("/_azureblob/v-k"));
        assert!(!upload_url.contains("omni_cache_skip_hit_miss"));

        // Upload through the Azure shim as the Actions client would.
        let path = upload_url.strip_prefix("http://localhost:12321").unwrap();
        let (status, _) = send(&router, request("PUT", path, Bytes::from_static(b"archive"))).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send(
            &router,
            json_request(
                "POST",
                &format!("{MOUNT}/FinalizeCacheEntryUpload"),
                json!({"key": "k", "version": "v", "sizeBytes": 7}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let response: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(response["ok"], true);
        assert!(!response["entryId"].as_str().unwrap().is_empty());

        let (status, body) = send(
            &router,
            json_request(
                "POST",
                &format!("{MOUNT}/GetCacheEntryDownloadURL"),
                json!({"key": "k", "version": "v", "restoreKeys": []}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let response: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(response["ok"], true);
        assert_eq!(response["matchedKey"], "k");
        let download_url = response["signedDownloadUrl"].as_str().unwrap();
        assert!(download_url.contains("omni_cache_skip_hit_miss=1"));

        let path = download_url.strip_prefix("http://localhost:12321").unwrap();
        let (status, body) = send(&router, request("GET", path, "")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"archive"));

        // One hit from the lookup; the marked download GET did not add more.
        assert_eq!(deps.stats.snapshot().cache_hits, 1);
    }

    #[tokio::test]
    async fn entry_id_is_deterministic_over_key_size_version() {
        let store = MemoryStore::new();
        let deps = test_deps(&store);
        let router = http_router(&GhaV2Factory, &deps);

        let mut ids = Vec::new();
        for body in [
            json!({"key": "k", "version": "v", "sizeBytes": 7}),
            json!({"key": "k", "version": "v", "sizeBytes": 7}),
            json!({"key": "k", "version": "v", "sizeBytes": 8}),
        ] {
            let (_, response) = send(
                &router,
                json_request("POST", &format!("{MOUNT}/FinalizeCacheEntryUpload"), body),
            )
            .await;
            let response: Value = serde_json::from_slice(&response).unwrap();
            ids.push(response["entryId"].as_str().unwrap().to_owned());
        }
        assert_eq!(ids[0], ids[1]);
        assert_ne!(ids[0], ids[2]);
    }

    #[tokio::test]
    async fn download_url_miss_reports_not_ok() {
        let store = MemoryStore::new();
        let deps = test_deps(&store);
        let router = http_router(&GhaV2Factory, &deps);

        let (status, body) = send(
            &router,
            json_request(
                "POST",
                &format!("{MOUNT}/GetCacheEntryDownloadURL"),
                json!({"key": "k", "version": "v"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let response: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(response["ok"], false);
        assert_eq!(deps.stats.snapshot().cache_misses, 1);
    }
}
