// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Test harness shared by the protocol test modules: an in-memory store, a
//! local HTTP origin that plays the object store behind its presigned URLs,
//! and helpers for driving protocol routers and gRPC services in process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::boxed;
use axum::extract::{Path, State};
use axum::http::header::ETAG;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::Router;
use bytes::Bytes;
use protocol::{Deps, ProtocolFactory, Registrar};
use stats::CacheStats;
use storage::testutil::MemoryStore;
use tower::ServiceExt;

async fn origin_get(State(store): State<MemoryStore>, Path(key): Path<String>) -> Response {
    match store.origin_get(&key) {
        // Explicit Content-Length so HEAD responses (body stripped) still
        // carry the blob size, as S3 does.
        Some(data) => Response::builder()
            .header(http::header::CONTENT_LENGTH, data.len())
            .body(boxed(hyper::Body::from(data)))
            .unwrap(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn origin_put(
    State(store): State<MemoryStore>,
    Path(key): Path<String>,
    body: Bytes,
) -> StatusCode {
    store.origin_put(&key, body);
    // A bare 200, as S3 answers PUT; the proxy normalizes it for clients.
    StatusCode::OK
}

async fn origin_put_part(
    State(store): State<MemoryStore>,
    Path((upload_id, part_number)): Path<(String, u32)>,
    body: Bytes,
) -> Response {
    match store.origin_put_part(&upload_id, part_number, body) {
        Ok(etag) => Response::builder()
            .header(ETAG, format!("\"{etag}\""))
            .body(boxed(hyper::Body::empty()))
            .unwrap(),
        Err(err) => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    }
}

/// Serve the origin-side of `MemoryStore` URLs on a local port and point the
/// store's URLs at it.
pub async fn spawn_origin(store: &MemoryStore) -> SocketAddr {
    let router = Router::new()
        .route("/blobs/*key", get(origin_get))
        .route("/put/*key", put(origin_put))
        .route("/part/:upload_id/:part_number", put(origin_put_part))
        .with_state(store.clone());

    let server =
        axum::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(router.into_make_service());
    let addr = server.local_addr();
    tokio::spawn(server);
    store.set_base_url(&format!("http://{addr}"));
    addr
}

pub fn test_deps(store: &MemoryStore) -> Deps {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap();
    Deps::with_client(
        Arc::new(store.clone()),
        "localhost:12321",
        client,
        Arc::new(CacheStats::new()),
    )
}

/// Register one factory and hand back its HTTP router.
pub fn http_router(factory: &dyn ProtocolFactory, deps: &Deps) -> Router {
    http_router_all(&[factory], deps)
}

/// Register several factories against one router, as the server does.
pub fn http_router_all(factories: &[&dyn ProtocolFactory], deps: &Deps) -> Router {
    let mut registrar = Registrar::new(true);
    for factory in factories {
        let protocol = factory.create(deps).unwrap();
        protocol.register(&mut registrar).unwrap();
    }
    let (router, _grpc) = registrar.into_parts();
    router
}

pub async fn send(router: &Router, request: Request<hyper::Body>) -> (StatusCode, Bytes) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    (status, body)
}

pub fn request(method: &str, uri: &str, body: impl Into<hyper::Body>) -> Request<hyper::Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(body.into())
        .unwrap()
}

pub fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<hyper::Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(hyper::Body::from(body.to_string()))
        .unwrap()
}
