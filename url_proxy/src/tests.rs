// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::boxed;
use axum::extract::State;
use axum::http::header::{CONTENT_LENGTH, ETAG, IF_RANGE, RANGE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, put};
use axum::Router;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use protos::google::bytestream::byte_stream_server::{ByteStream, ByteStreamServer};
use protos::google::bytestream::{
    QueryWriteStatusRequest, QueryWriteStatusResponse, ReadRequest, ReadResponse, WriteRequest,
    WriteResponse,
};
use stats::CacheStats;
use storage::UrlInfo;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Request, Response as TonicResponse, Status, Streaming};

use crate::{ProxyError, UrlProxy};

const FLAKY_BODY: &[u8] = b"the quick brown fox jumps over the lazy dog, twice over";

fn proxy() -> (UrlProxy, Arc<CacheStats>) {
    let stats = Arc::new(CacheStats::new());
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap();
    (UrlProxy::new(client, stats.clone()), stats)
}

async fn spawn_origin(router: Router) -> SocketAddr {
    let server = axum::Server::bind(&"127.0.0.1:0".parse().unwrap())
        .serve(router.into_make_service());
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

#[derive(Clone)]
struct FlakyState {
    requests: Arc<AtomicUsize>,
}

async fn flaky_blob(State(state): State<FlakyState>, headers: HeaderMap) -> Response {
    let request_number = state.requests.fetch_add(1, Ordering::SeqCst);
    if request_number == 0 {
        // Promise the full body, deliver a prefix, then cut the connection.
        let (mut tx, body) = hyper::Body::channel();
        tokio::spawn(async move {
            let _ = tx.send_data(Bytes::from_static(&FLAKY_BODY[..10])).await;
            tx.abort();
        });
        Response::builder()
            .header(CONTENT_LENGTH, FLAKY_BODY.len())
            .header(ETAG, "\"v1\"")
            .body(boxed(body))
            .unwrap()
    } else {
        assert_eq!(headers.get(IF_RANGE).unwrap(), "\"v1\"");
        let range = headers.get(RANGE).unwrap().to_str().unwrap();
        let offset: usize = range
            .strip_prefix("bytes=")
            .and_then(|r| r.strip_suffix('-'))
            .unwrap()
            .parse()
            .unwrap();
        Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .body(boxed(hyper::Body::from(&FLAKY_BODY[offset..])))
            .unwrap()
    }
}

#[tokio::test]
async fn download_recovers_from_mid_stream_eof() {
    let state = FlakyState {
        requests: Arc::new(AtomicUsize::new(0)),
    };
    let addr = spawn_origin(
        Router::new()
            .route("/blob", get(flaky_blob))
            .with_state(state.clone()),
    )
    .await;

    let (proxy, stats) = proxy();
    let info = UrlInfo::new(format!("http://{addr}/blob"));
    let body = proxy.download_bytes(&[info]).await.unwrap();

    assert_eq!(body, Bytes::from_static(FLAKY_BODY));
    assert_eq!(state.requests.load(Ordering::SeqCst), 2);
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.downloads.count, 1);
    assert_eq!(snapshot.downloads.bytes, FLAKY_BODY.len() as u64);
}

#[tokio::test]
async fn download_walks_fallback_list_in_order() {
    let addr = spawn_origin(
        Router::new()
            .route("/broken", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
            .route("/blob", get(|| async { "fallback worked" })),
    )
    .await;

    let (proxy, _) = proxy();
    let urls = vec![
        UrlInfo::new(format!("http://{addr}/broken")),
        UrlInfo::new(format!("http://{addr}/blob")),
    ];
    let body = proxy.download_bytes(&urls).await.unwrap();
    assert_eq!(body, Bytes::from_static(b"fallback worked"));
}

#[tokio::test]
async fn absent_blob_reports_not_found() {
    let addr = spawn_origin(
        Router::new()
            .route("/broken", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
            .route("/missing", get(|| async { StatusCode::NOT_FOUND })),
    )
    .await;

    let (proxy, _) = proxy();
    let urls = vec![
        UrlInfo::new(format!("http://{addr}/broken")),
        UrlInfo::new(format!("http://{addr}/missing")),
    ];
    let err = proxy.download_bytes(&urls).await.unwrap_err();
    assert_eq!(err, ProxyError::NotFound);

    // All transport errors and no 404 is not a "not found".
    let urls = vec![UrlInfo::new(format!("http://{addr}/broken"))];
    let err = proxy.download_bytes(&urls).await.unwrap_err();
    assert_eq!(err, ProxyError::Status(500));
}

#[tokio::test]
async fn unknown_scheme_is_rejected() {
    let (proxy, _) = proxy();
    let err = proxy
        .download_bytes(&[UrlInfo::new("ftp://example.com/blob")])
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::InvalidUrl(_)));
}

#[tokio::test]
async fn upload_normalizes_backend_200_to_201() {
    let uploads: Arc<Mutex<Vec<Bytes>>> = Arc::new(Mutex::new(Vec::new()));
    let uploads_in_handler = uploads.clone();
    let addr = spawn_origin(Router::new().route(
        "/put",
        put(move |body: Bytes| {
            let uploads = uploads_in_handler.clone();
            async move {
                uploads.lock().push(body);
                StatusCode::OK
            }
        }),
    ))
    .await;

    let (proxy, stats) = proxy();
    let info = UrlInfo::new(format!("http://{addr}/put"));
    let outcome = proxy
        .upload_bytes(&info, Bytes::from_static(b"payload"))
        .await
        .unwrap();

    assert_eq!(outcome.status, 201);
    assert_eq!(outcome.bytes_sent, 7);
    assert_eq!(uploads.lock()[0], Bytes::from_static(b"payload"));
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.uploads.count, 1);
    assert_eq!(snapshot.uploads.bytes, 7);
}

#[tokio::test]
async fn upload_passes_backend_status_through() {
    let addr = spawn_origin(Router::new().route(
        "/put",
        put(|| async { StatusCode::REQUEST_ENTITY_TOO_LARGE }),
    ))
    .await;

    let (proxy, _) = proxy();
    let info = UrlInfo::new(format!("http://{addr}/put"));
    let err = proxy
        .upload_bytes(&info, Bytes::from_static(b"payload"))
        .await
        .unwrap_err();
    assert_eq!(err, ProxyError::Status(413));
}

#[tokio::test]
async fn head_returns_origin_content_length() {
    let addr = spawn_origin(Router::new().route(
        "/blob",
        get(|| async {
            Response::builder()
                .header(CONTENT_LENGTH, 42)
                .body(boxed(hyper::Body::empty()))
                .unwrap()
        }),
    ))
    .await;

    let (proxy, stats) = proxy();
    let info = UrlInfo::new(format!("http://{addr}/blob"));
    let length = proxy.head(&[info]).await.unwrap();
    assert_eq!(length, 42);
    // HEAD must not count as a download.
    assert_eq!(stats.snapshot().downloads.count, 0);
}

struct TestByteStream {
    blobs: Arc<Mutex<HashMap<String, Bytes>>>,
    lie_about_committed_size: bool,
}

#[tonic::async_trait]
impl ByteStream for TestByteStream {
    type ReadStream =
        std::pin::Pin<Box<dyn futures::Stream<Item = Result<ReadResponse, Status>> + Send>>;

    async fn read(
        &self,
        request: Request<ReadRequest>,
    ) -> Result<TonicResponse<Self::ReadStream>, Status> {
        let request = request.into_inner();
        let blob = self
            .blobs
            .lock()
            .get(&request.resource_name)
            .cloned()
            .ok_or_else(|| Status::not_found(""))?;

        let stream = async_stream::stream! {
            let mut offset = 0;
            while offset < blob.len() {
                let end = (offset + 10).min(blob.len());
                yield Ok(ReadResponse { data: blob.slice(offset..end) });
                offset = end;
            }
        };
        Ok(TonicResponse::new(Box::pin(stream)))
    }

    async fn write(
        &self,
        request: Request<Streaming<WriteRequest>>,
    ) -> Result<TonicResponse<WriteResponse>, Status> {
        let mut inbound = request.into_inner();
        let mut resource = String::new();
        let mut data = Vec::new();
        let mut finished = false;
        while let Some(message) = inbound.next().await {
            let message = message?;
            if resource.is_empty() {
                resource = message.resource_name.clone();
            }
            if message.write_offset != data.len() as i64 {
                return Err(Status::invalid_argument("non-sequential write_offset"));
            }
            data.extend_from_slice(&message.data);
            if message.finish_write {
                finished = true;
                break;
            }
        }
        if !finished {
            return Err(Status::cancelled("stream ended without finish_write"));
        }

        let committed = data.len() as i64;
        self.blobs.lock().insert(resource, Bytes::from(data));
        let committed_size = if self.lie_about_committed_size {
            committed - 1
        } else {
            committed
        };
        Ok(TonicResponse::new(WriteResponse { committed_size }))
    }

    async fn query_write_status(
        &self,
        _request: Request<QueryWriteStatusRequest>,
    ) -> Result<TonicResponse<QueryWriteStatusResponse>, Status> {
        Err(Status::unimplemented("not supported"))
    }
}

async fn spawn_bytestream(
    blobs: Arc<Mutex<HashMap<String, Bytes>>>,
    lie_about_committed_size: bool,
) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let service = TestByteStream {
        blobs,
        lie_about_committed_size,
    };
    tokio::spawn(
        tonic::transport::Server::builder()
            .add_service(ByteStreamServer::new(service))
            .serve_with_incoming(TcpListenerStream::new(listener)),
    );
    addr
}

#[tokio::test]
async fn bytestream_round_trip() {
    let blobs: Arc<Mutex<HashMap<String, Bytes>>> = Arc::new(Mutex::new(HashMap::new()));
    let addr = spawn_bytestream(blobs.clone(), false).await;

    let (proxy, stats) = proxy();
    let content = Bytes::from(vec![7u8; 200 * 1024]);

    let upload_info = UrlInfo::new(format!("grpc://{addr}/uploads/u1/blobs/abc/204800"));
    let outcome = proxy.upload_bytes(&upload_info, content.clone()).await.unwrap();
    assert_eq!(outcome.status, 201);
    assert_eq!(
        blobs.lock().get("uploads/u1/blobs/abc/204800").unwrap(),
        &content
    );

    let download_info = UrlInfo::new(format!("grpc://{addr}/uploads/u1/blobs/abc/204800"));
    let body = proxy.download_bytes(&[download_info]).await.unwrap();
    assert_eq!(body, content);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.uploads.bytes, content.len() as u64);
    assert_eq!(snapshot.downloads.bytes, content.len() as u64);
}

#[tokio::test]
async fn bytestream_committed_size_mismatch_is_an_error() {
    let blobs: Arc<Mutex<HashMap<String, Bytes>>> = Arc::new(Mutex::new(HashMap::new()));
    let addr = spawn_bytestream(blobs, true).await;

    let (proxy, _) = proxy();
    let info = UrlInfo::new(format!("grpc://{addr}/blobs/abc/4"));
    let err = proxy
        .upload_bytes(&info, Bytes::from_static(b"data"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Io(_)));
}

#[tokio::test]
async fn bytestream_missing_blob_is_not_found() {
    let blobs: Arc<Mutex<HashMap<String, Bytes>>> = Arc::new(Mutex::new(HashMap::new()));
    let addr = spawn_bytestream(blobs, false).await;

    let (proxy, _) = proxy();
    let info = UrlInfo::new(format!("grpc://{addr}/blobs/missing/0"));
    let err = proxy.download_bytes(&[info]).await.unwrap_err();
    assert_eq!(err, ProxyError::NotFound);
}

#[cfg(unix)]
#[tokio::test]
async fn bytestream_over_unix_socket() {
    use tokio_stream::wrappers::UnixListenerStream;

    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("bytestream.sock");
    let listener = tokio::net::UnixListener::bind(&socket_path).unwrap();

    let blobs: Arc<Mutex<HashMap<String, Bytes>>> = Arc::new(Mutex::new(HashMap::new()));
    blobs
        .lock()
        .insert("blobs/abc/5".to_owned(), Bytes::from_static(b"hello"));
    let service = TestByteStream {
        blobs,
        lie_about_committed_size: false,
    };
    tokio::spawn(
        tonic::transport::Server::builder()
            .add_service(ByteStreamServer::new(service))
            .serve_with_incoming(UnixListenerStream::new(listener)),
    );

    let (proxy, _) = proxy();
    let info = UrlInfo::new(format!(
        "unix://{}?resource=blobs/abc/5",
        socket_path.display()
    ));
    let body = proxy.download_bytes(&[info]).await.unwrap();
    assert_eq!(body, Bytes::from_static(b"hello"));
}
