// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The generic HTTP cache: `GET`/`PUT`/`POST`/`DELETE`/`HEAD` over opaque
//! keys at the server root. Other protocols point clients here for bulk
//! transfers (for example, the GHA v1 archive URL).

use std::sync::Arc;

use axum::body::StreamBody;
use axum::extract::{BodyStream, Path, RawQuery, State};
use axum::http::header::CONTENT_LENGTH;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures::StreamExt;
use protocol::{Deps, Protocol, ProtocolFactory, Registrar, RegistrationError};
use storage::StorageError;
use url_proxy::ProxyError;

pub struct HttpCacheFactory;

impl ProtocolFactory for HttpCacheFactory {
    fn id(&self) -> &'static str {
        "http"
    }

    fn create(&self, deps: &Deps) -> Result<Box<dyn Protocol>, RegistrationError> {
        Ok(Box::new(HttpCache {
            state: Arc::new(deps.clone()),
        }))
    }
}

pub struct HttpCache {
    state: Arc<Deps>,
}

impl Protocol for HttpCache {
    fn register(self: Box<Self>, registrar: &mut Registrar) -> Result<(), RegistrationError> {
        registrar.route(
            "/*key",
            get(download)
                .head(probe)
                .put(upload)
                .post(upload)
                .delete(delete)
                .with_state(self.state),
        );
        Ok(())
    }
}

fn internal_error(context: &str, err: impl std::fmt::Display) -> Response {
    tracing::error!(context, error = %err, "http cache request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{context}: {err}")).into_response()
}

pub(crate) fn stream_response(download: url_proxy::Download) -> Response {
    let mut builder = Response::builder().status(download.status);
    if let Some(length) = download.content_length {
        builder = builder.header(CONTENT_LENGTH, length);
    }
    builder
        .body(axum::body::boxed(StreamBody::new(download.stream)))
        .unwrap()
}

async fn download(
    State(state): State<Arc<Deps>>,
    Path(key): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    let skip_hit_miss = stats::has_skip_marker(query.as_deref());

    let urls = match state.storage.download_urls(&key).await {
        Ok(urls) => urls,
        Err(StorageError::CacheNotFound) => {
            if !skip_hit_miss {
                state.stats.record_miss();
            }
            return StatusCode::NOT_FOUND.into_response();
        }
        Err(err) => return internal_error("download URLs", err),
    };

    match state.url_proxy.download(&urls).await {
        Ok(download) => {
            if !skip_hit_miss {
                state.stats.record_hit();
            }
            stream_response(download)
        }
        Err(ProxyError::NotFound) => {
            if !skip_hit_miss {
                state.stats.record_miss();
            }
            StatusCode::NOT_FOUND.into_response()
        }
        Err(err) => internal_error("download", err),
    }
}

async fn probe(
    State(state): State<Arc<Deps>>,
    Path(key): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    let skip_hit_miss = stats::has_skip_marker(query.as_deref());

    // Any failure, transport errors included, is reported as a miss: HEAD is
    // an existence probe and clients fall back to populating the cache.
    match state.storage.cache_info(&key, &[]).await {
        Ok(info) => {
            if !skip_hit_miss {
                state.stats.record_hit();
            }
            Response::builder()
                .header(CONTENT_LENGTH, info.size)
                .body(axum::body::boxed(axum::body::Body::empty()))
                .unwrap()
        }
        Err(err) => {
            if !skip_hit_miss {
                state.stats.record_miss();
            }
            if !err.is_not_found() {
                tracing::warn!(key, error = %err, "HEAD treated as miss after backend error");
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
        Err(err) => return internal_error("upload URL", err),
    };

    let stream = body.map(|chunk| chunk.map_err(|err| ProxyError::Io(err.to_string())));
    match state.url_proxy.upload_stream(&info, stream, content_length).await {
        Ok(outcome) => StatusCode::from_u16(outcome.status)
            .unwrap_or(StatusCode::CREATED)
            .into_response(),
        Err(ProxyError::Status(code)) => StatusCode::from_u16(code)
            .unwrap_or(StatusCode::BAD_GATEWAY)
            .into_response(),
        Err(err) => internal_error("upload", err),
    }
}

async fn delete(State(state): State<Arc<Deps>>, Path(key): Path<String>) -> Response {
    match state.storage.delete(&key).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => internal_error("delete", err),
    }
}
