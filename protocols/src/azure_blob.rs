// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Azure Blob compatibility shim backing the GHA cache v2 protocol. The v2
//! Twirp endpoints hand out URLs under `/_azureblob/...`; the Actions client
//! then talks what it believes is Azure Blob Storage while the shim streams
//! against the real backend through the URL proxy.

use std::sync::Arc;

use axum::extract::{BodyStream, Path, RawQuery, State};
use axum::http::header::CONTENT_LENGTH;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{on, MethodFilter};
use futures::StreamExt;
use protocol::{Deps, Protocol, ProtocolFactory, Registrar, RegistrationError};
use storage::StorageError;
use url_proxy::ProxyError;

use crate::http_cache::stream_response;

pub const MOUNT: &str = "/_azureblob";

pub struct AzureBlobFactory;

impl ProtocolFactory for AzureBlobFactory {
    fn id(&self) -> &'static str {
        "azure-blob"
    }

    fn create(&self, deps: &Deps) -> Result<Box<dyn Protocol>, RegistrationError> {
        Ok(Box::new(AzureBlob {
            state: Arc::new(deps.clone()),
        }))
    }
}

pub struct AzureBlob {
    state: Arc<Deps>,
}

impl Protocol for AzureBlob {
    fn register(self: Box<Self>, registrar: &mut Registrar) -> Result<(), RegistrationError> {
        registrar.route(
            &format!("{MOUNT}/*key"),
            on(MethodFilter::GET, download)
                .on(MethodFilter::HEAD, probe)
                .on(MethodFilter::PUT, upload)
                .with_state(self.state),
        );
        Ok(())
    }
}

async fn download(
    State(state): State<Arc<Deps>>,
    Path(key): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    let skip_hit_miss = stats::has_skip_marker(query.as_deref());

    let urls = match state.storage.download_urls(&key).await {
        Ok(urls) => urls,
        Err(err) => {
            if !skip_hit_miss {
                state.stats.record_miss();
            }
            if !err.is_not_found() {
                tracing::warn!(key, error = %err, "azure blob GET treated as miss");
            }
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    match state.url_proxy.download(&urls).await {
        Ok(download) => {
            if !skip_hit_miss {
                state.stats.record_hit();
            }
            stream_response(download)
        }
        Err(err) => {
            if !skip_hit_miss {
                state.stats.record_miss();
            }
            if !err.is_not_found() {
                tracing::warn!(key, error = %err, "azure blob GET treated as miss");
            }
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

async fn probe(
    State(state): State<Arc<Deps>>,
    Path(key): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    let skip_hit_miss = stats::has_skip_marker(query.as_deref());

    let result = match state.storage.download_urls(&key).await {
        Ok(urls) => state.url_proxy.head(&urls).await,
        Err(StorageError::CacheNotFound) => Err(ProxyError::NotFound),
        Err(err) => Err(ProxyError::Io(err.to_string())),
    };

    match result {
        Ok(content_length) => {
            if !skip_hit_miss {
                state.stats.record_hit();
            }
            Response::builder()
                .header(CONTENT_LENGTH, content_length)
                .body(axum::body::boxed(axum::body::Body::empty()))
                .unwrap()
        }
        Err(err) => {
            // A backend error on HEAD counts as a miss, not a failure.
            if !skip_hit_miss {
                state.stats.record_miss();
            }
            if !err.is_not_found() {
                tracing::warn!(key, error = %err, "azure blob HEAD treated as miss");
            }
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

async fn upload(
    State(state): State<Arc<Deps>>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: BodyStream,
) -> Response {
    let content_length = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let info = match state.storage.upload_url(&key, None).await {
        Ok(info) => info,
        Err(err) => {
            tracing::error!(key, error = %err, "azure blob PUT failed to presign");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let stream = body.map(|chunk| chunk.map_err(|err| ProxyError::Io(err.to_string())));
    match state.url_proxy.upload_stream(&info, stream, content_length).await {
        Ok(outcome) => StatusCode::from_u16(outcome.status)
            .unwrap_or(StatusCode::CREATED)
            .into_response(),
        Err(ProxyError::Status(code)) => StatusCode::from_u16(code)
            .unwrap_or(StatusCode::BAD_GATEWAY)
            .into_response(),
        Err(err) => {
            tracing::error!(key, error = %err, "azure blob PUT failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
