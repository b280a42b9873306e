// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Transfers against endpoints that speak the Google ByteStream service.
//!
//! URL forms:
//! - `grpc://host:port/<resource name>` (port defaults to 80)
//! - `grpcs://host:port/<resource name>` (port defaults to 443, TLS)
//! - `unix:///path/to/socket?resource=<resource name>` (the URL path is the
//!   socket path; the resource name rides in the query)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::StreamExt;
use percent_encoding::percent_decode_str;
use protos::google::bytestream::byte_stream_client::ByteStreamClient;
use protos::google::bytestream::{ReadRequest, WriteRequest};
use stats::CacheStats;
use storage::UrlInfo;
use tokio::net::UnixStream;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::{Code, Request};

use crate::{Download, GrpcEndpointConfigurer, ProxyError, UploadBody, UploadOutcome};

const WRITE_CHUNK_SIZE: usize = 64 * 1024;

pub(crate) async fn dial_tcp(
    url: &url::Url,
    tls: bool,
    configurer: Option<&GrpcEndpointConfigurer>,
) -> Result<Channel, ProxyError> {
    let host = url
        .host_str()
        .ok_or_else(|| ProxyError::InvalidUrl(format!("{url} has no host")))?;
    let port = url.port().unwrap_or(if tls { 443 } else { 80 });
    let scheme = if tls { "https" } else { "http" };

    let mut endpoint = Endpoint::from_shared(format!("{scheme}://{host}:{port}"))
        .map_err(|err| ProxyError::InvalidUrl(err.to_string()))?;
    if tls {
        endpoint = endpoint
            .tls_config(ClientTlsConfig::new().domain_name(host))
            .map_err(|err| ProxyError::Io(format!("TLS config for {host}: {err}")))?;
    }
    if let Some(configurer) = configurer {
        endpoint = configurer(endpoint);
    }

    endpoint
        .connect()
        .await
        .map_err(|err| ProxyError::Io(format!("dial {host}:{port}: {err}")))
}

pub(crate) async fn dial_unix(
    url: &url::Url,
    configurer: Option<&GrpcEndpointConfigurer>,
) -> Result<Channel, ProxyError> {
    let socket_path = percent_decode_str(url.path())
        .decode_utf8()
        .map_err(|err| ProxyError::InvalidUrl(format!("socket path in {url}: {err}")))?
        .into_owned();
    if socket_path.is_empty() {
        return Err(ProxyError::InvalidUrl(format!("{url} has no socket path")));
    }

    // The endpoint URI is ignored; every connection goes to the socket.
    let mut endpoint = Endpoint::from_static("http://localhost");
    if let Some(configurer) = configurer {
        endpoint = configurer(endpoint);
    }

    endpoint
        .connect_with_connector(tower::service_fn(move |_| {
            UnixStream::connect(socket_path.clone())
        }))
        .await
        .map_err(|err| ProxyError::Io(format!("dial unix socket: {err}")))
}

fn resource_name(url: &url::Url) -> Result<String, ProxyError> {
    let name = if url.scheme() == "unix" {
        url.query_pairs()
            .find(|(name, _)| name == "resource")
            .map(|(_, value)| value.into_owned())
            .unwrap_or_default()
    } else {
        percent_decode_str(url.path().trim_start_matches('/'))
            .decode_utf8()
            .map_err(|err| ProxyError::InvalidUrl(format!("resource name in {url}: {err}")))?
            .into_owned()
    };

    if name.is_empty() {
        return Err(ProxyError::InvalidUrl(format!(
            "{url} carries no resource name"
        )));
    }
    Ok(name)
}

fn attach_metadata<T>(request: &mut Request<T>, info: &UrlInfo) -> Result<(), ProxyError> {
    for (name, value) in &info.extra_headers {
        let key: AsciiMetadataKey = name
            .to_lowercase()
            .parse()
            .map_err(|_| ProxyError::InvalidUrl(format!("metadata key {name}")))?;
        let value: AsciiMetadataValue = value
            .parse()
            .map_err(|_| ProxyError::InvalidUrl(format!("metadata value for {name}")))?;
        request.metadata_mut().insert(key, value);
    }
    Ok(())
}

pub(crate) async fn download(
    channel: Channel,
    url: &url::Url,
    info: &UrlInfo,
    stats: Arc<CacheStats>,
    started: Instant,
) -> Result<Download, ProxyError> {
    let resource = resource_name(url)?;
    let mut client = ByteStreamClient::new(channel);

    let mut request = Request::new(ReadRequest {
        resource_name: resource,
        read_offset: 0,
        read_limit: 0,
    });
    attach_metadata(&mut request, info)?;

    let response = client.read(request).await.map_err(|status| {
        if status.code() == Code::NotFound {
            ProxyError::NotFound
        } else {
            ProxyError::Io(format!("bytestream read: {status}"))
        }
    })?;
    let mut inbound = response.into_inner();

    let url = url.to_string();
    let stream = async_stream::stream! {
        let mut delivered: u64 = 0;
        loop {
            match inbound.next().await {
                Some(Ok(message)) => {
                    delivered += message.data.len() as u64;
                    yield Ok(message.data);
                }
                Some(Err(status)) => {
                    yield Err(ProxyError::Io(format!("bytestream read from {url}: {status}")));
                    break;
                }
                None => {
                    stats.record_download(delivered, started.elapsed());
                    break;
                }
            }
        }
    };

    Ok(Download {
        status: 200,
        content_length: None,
        stream: Box::pin(stream),
    })
}

pub(crate) async fn upload(
    channel: Channel,
    url: &url::Url,
    info: &UrlInfo,
    body: UploadBody,
) -> Result<UploadOutcome, ProxyError> {
    let resource = resource_name(url)?;
    let mut client = ByteStreamClient::new(channel);

    let mut chunks: crate::ByteChunkStream = match body {
        UploadBody::Full(data) => Box::pin(futures::stream::once(async move { Ok(data) })),
        UploadBody::Stream(stream) => stream,
    };

    let sent = Arc::new(AtomicU64::new(0));
    let sent_in_stream = sent.clone();
    let outbound_resource = resource.clone();
    let outbound = async_stream::stream! {
        let mut offset: i64 = 0;
        while let Some(chunk) = chunks.next().await {
            let mut data = match chunk {
                Ok(data) => data,
                // Ending the stream without finish_write makes the server
                // fail the whole write, which is what we want here.
                Err(_) => return,
            };
            while !data.is_empty() {
                let piece = data.split_to(WRITE_CHUNK_SIZE.min(data.len()));
                let piece_len = piece.len() as i64;
                yield WriteRequest {
                    resource_name: outbound_resource.clone(),
                    write_offset: offset,
                    finish_write: false,
                    data: piece,
                };
                offset += piece_len;
                sent_in_stream.fetch_add(piece_len as u64, Ordering::Relaxed);
            }
        }
        yield WriteRequest {
            resource_name: outbound_resource.clone(),
            write_offset: offset,
            finish_write: true,
            data: Bytes::new(),
        };
    };

    let mut request = Request::new(outbound);
    attach_metadata(&mut request, info)?;

    let response = client
        .write(request)
        .await
        .map_err(|status| ProxyError::Io(format!("bytestream write to {url}: {status}")))?
        .into_inner();

    let sent = sent.load(Ordering::Relaxed);
    if response.committed_size != sent as i64 {
        return Err(ProxyError::Io(format!(
            "bytestream write to {url}: committed {} of {} bytes",
            response.committed_size, sent
        )));
    }

    Ok(UploadOutcome {
        status: 201,
        etag: None,
        bytes_sent: sent,
    })
}
