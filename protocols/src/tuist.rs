// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Tuist module cache: multipart upload sessions plus existence and download
//! lookups, scoped by account and project handles. Parts are capped at
//! 10 MiB; a commit that discovers the artifact already in storage tells the
//! client to skip the upload by omitting `upload_id` from the response.

use std::sync::Arc;

use axum::extract::{BodyStream, Query, State};
use axum::http::header::CONTENT_LENGTH;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{on, MethodFilter};
use axum::Json;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use protocol::{Deps, Protocol, ProtocolFactory, Registrar, RegistrationError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use storage::StorageError;
use url_proxy::ProxyError;

use crate::session::{SessionStore, UploadSession, SESSION_TTL};

pub const MOUNT: &str = "/tuist/api/cache/module";

/// Upper bound for one part of a module upload.
const MAX_PART_SIZE: u64 = 10 * 1024 * 1024;

pub struct TuistFactory;

impl ProtocolFactory for TuistFactory {
    fn id(&self) -> &'static str {
        "tuist"
    }

    fn create(&self, deps: &Deps) -> Result<Box<dyn Protocol>, RegistrationError> {
        let sessions = SessionStore::new();
        sessions.spawn_reaper(SESSION_TTL);
        Ok(Box::new(Tuist {
            state: Arc::new(TuistState {
                deps: deps.clone(),
                sessions,
            }),
        }))
    }
}

struct TuistState {
    deps: Deps,
    sessions: SessionStore,
}

pub struct Tuist {
    state: Arc<TuistState>,
}

impl Protocol for Tuist {
    fn register(self: Box<Self>, registrar: &mut Registrar) -> Result<(), RegistrationError> {
        registrar.route(
            MOUNT,
            on(MethodFilter::GET, download_url).with_state(self.state.clone()),
        );
        registrar.route(
            &format!("{MOUNT}/exists"),
            on(MethodFilter::GET, exists).with_state(self.state.clone()),
        );
        registrar.route(
            &format!("{MOUNT}/start"),
            on(MethodFilter::POST, start).with_state(self.state.clone()),
        );
        registrar.route(
            &format!("{MOUNT}/part"),
            on(MethodFilter::PUT, upload_part).with_state(self.state.clone()),
        );
        registrar.route(
            &format!("{MOUNT}/complete"),
            on(MethodFilter::POST, complete).with_state(self.state),
        );
        Ok(())
    }
}

fn default_category() -> String {
    "builds".to_owned()
}

#[derive(Deserialize)]
struct ModuleQuery {
    account_handle: String,
    project_handle: String,
    hash: String,
    name: String,
    #[serde(default = "default_category")]
    category: String,
}

impl ModuleQuery {
    /// `<account>/<project>/module/<category>/<hash[0:2]>/<hash[2:4]>/<hash>/<name>`
    fn storage_key(&self) -> Result<String, Response> {
        if self.hash.len() < 4 || !self.hash.is_ascii() {
            return Err((StatusCode::BAD_REQUEST, "malformed module hash").into_response());
        }
        if self.account_handle.is_empty() || self.project_handle.is_empty() {
            return Err((StatusCode::BAD_REQUEST, "missing account or project handle")
                .into_response());
        }
        Ok(format!(
            "{}/{}/module/{}/{}/{}/{}/{}",
            self.account_handle,
            self.project_handle,
            self.category,
            &self.hash[0..2],
            &self.hash[2..4],
            self.hash,
            self.name
        ))
    }
}

#[derive(Serialize)]
struct StartResponse {
    upload_id: String,
}

async fn start(State(state): State<Arc<TuistState>>, Query(query): Query<ModuleQuery>) -> Response {
    let key = match query.storage_key() {
        Ok(key) => key,
        Err(response) => return response,
    };

    let upload_id = match state.deps.storage.create_multipart_upload(&key, None).await {
        Ok(id) => id,
        Err(err) => {
            tracing::error!(key, error = %err, "failed to start module upload");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let session_id = state.sessions.new_session_id();
    state.sessions.insert(
        session_id,
        UploadSession::new(key, query.category, upload_id),
    );
    Json(StartResponse {
        upload_id: session_id.to_string(),
    })
    .into_response()
}

#[derive(Deserialize)]
struct PartQuery {
    account_handle: String,
    project_handle: String,
    upload_id: String,
    part_number: u32,
}

async fn upload_part(
    State(state): State<Arc<TuistState>>,
    Query(query): Query<PartQuery>,
    headers: HeaderMap,
    mut body: BodyStream,
) -> Response {
    if query.account_handle.is_empty() || query.project_handle.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing account or project handle").into_response();
    }
    if query.part_number == 0 {
        return (StatusCode::BAD_REQUEST, "part numbers start at 1").into_response();
    }

    if let Some(declared) = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        if declared > MAX_PART_SIZE {
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    }

    let session_id: u64 = match query.upload_id.parse() {
        Ok(id) => id,
        Err(_) => return (StatusCode::BAD_REQUEST, "malformed upload_id").into_response(),
    };
    let session_info = state
        .sessions
        .with_session(session_id, |session| {
            (session.key.clone(), session.upload_id.clone())
        });
    let (key, backend_upload_id) = match session_info {
        Some(info) => info,
        None => return (StatusCode::NOT_FOUND, "unknown upload").into_response(),
    };

    // Parts are small by contract, so buffer to enforce the cap even when the
    // client does not declare a length.
    let mut data = BytesMut::new();
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::warn!(key, error = %err, "part body read failed");
                return StatusCode::BAD_REQUEST.into_response();
            }
        };
        if (data.len() + chunk.len()) as u64 > MAX_PART_SIZE {
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
        data.extend_from_slice(&chunk);
    }
    let data = data.freeze();
    let length = data.len() as u64;

    let url_info = match state
        .deps
        .storage
        .upload_part_url(&key, &backend_upload_id, query.part_number, length)
        .await
    {
        Ok(info) => info,
        Err(err) => {
            tracing::error!(key, error = %err, "failed to presign module part");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let stream = futures::stream::once(async move { Ok::<Bytes, ProxyError>(data) });
    match state
        .deps
        .url_proxy
        .upload_part_stream(&url_info, stream, Some(length))
        .await
    {
        Ok(outcome) => {
            state.sessions.with_session(session_id, |session| {
                session.record_part(query.part_number, outcome.etag.unwrap_or_default(), length);
            });
            StatusCode::OK.into_response()
        }
        Err(ProxyError::Status(code)) => StatusCode::from_u16(code)
            .unwrap_or(StatusCode::BAD_GATEWAY)
            .into_response(),
        Err(err) => {
            tracing::warn!(key, error = %err, "module part upload failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

#[derive(Deserialize)]
struct CompleteQuery {
    account_handle: String,
    project_handle: String,
    upload_id: String,
}

async fn complete(
    State(state): State<Arc<TuistState>>,
    Query(query): Query<CompleteQuery>,
) -> Response {
    if query.account_handle.is_empty() || query.project_handle.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing account or project handle").into_response();
    }
    let session_id: u64 = match query.upload_id.parse() {
        Ok(id) => id,
        Err(_) => return (StatusCode::BAD_REQUEST, "malformed upload_id").into_response(),
    };

    let session_info = state.sessions.with_session(session_id, |session| {
        (
            session.key.clone(),
            session.upload_id.clone(),
            session.finalize(),
            session.started_at(),
        )
    });
    let (key, backend_upload_id, (parts, total_size), started_at) = match session_info {
        Some(info) => info,
        None => return (StatusCode::NOT_FOUND, "unknown upload").into_response(),
    };

    // Another builder may have committed the same module while this upload
    // was in flight (or this is a retry of an acknowledged commit). An absent
    // upload_id tells the client the artifact is already cached.
    match state.deps.storage.cache_info(&key, &[]).await {
        Ok(_) => {
            state.sessions.remove(session_id);
            return Json(json!({})).into_response();
        }
        Err(StorageError::CacheNotFound) => {}
        Err(err) => {
            tracing::warn!(key, error = %err, "module preflight failed, proceeding to commit");
        }
    }

    match state
        .deps
        .storage
        .commit_multipart_upload(&key, &backend_upload_id, &parts)
        .await
    {
        Ok(()) => {
            state
                .deps
                .stats
                .record_upload(total_size, started_at.elapsed());
            state.sessions.remove(session_id);
            StatusCode::NO_CONTENT.into_response()
        }
        // The session survives a failed backend commit for a retry.
        Err(err) => {
            tracing::warn!(key, error = %err, "module commit failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

async fn exists(State(state): State<Arc<TuistState>>, Query(query): Query<ModuleQuery>) -> Response {
    let key = match query.storage_key() {
        Ok(key) => key,
        Err(response) => return response,
    };
    match state.deps.storage.cache_info(&key, &[]).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn download_url(
    State(state): State<Arc<TuistState>>,
    Query(query): Query<ModuleQuery>,
) -> Response {
    let key = match query.storage_key() {
        Ok(key) => key,
        Err(response) => return response,
    };
    match state.deps.storage.download_urls(&key).await {
        Ok(urls) => {
            state.deps.stats.record_hit();
            let url = urls.into_iter().next().map(|info| info.url).unwrap_or_default();
            Json(json!({ "url": url })).into_response()
        }
        Err(StorageError::CacheNotFound) => {
            state.deps.stats.record_miss();
            StatusCode::NOT_FOUND.into_response()
        }
        Err(err) => {
            tracing::error!(key, error = %err, "module download lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
