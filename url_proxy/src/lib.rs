// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Streams bytes between local clients and the remote endpoints referenced by
//! presigned [`UrlInfo`]s: plain HTTP(S), and the Google ByteStream service
//! over `grpc`, `grpcs`, or a unix socket.

#![deny(warnings)]

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use stats::CacheStats;
use storage::UrlInfo;

mod bytestream;
mod http;

/// Errors from proxied transfers. `NotFound` and `Status` preserve what the
/// remote side said so protocols can pass it through; `Io` covers transport
/// failures where no response (or only part of one) was received.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProxyError {
    NotFound,
    Status(u16),
    InvalidUrl(String),
    Io(String),
}

impl std::error::Error for ProxyError {}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::NotFound => write!(f, "remote resource not found"),
            ProxyError::Status(code) => write!(f, "remote returned status {code}"),
            ProxyError::InvalidUrl(msg) => write!(f, "invalid URL: {msg}"),
            ProxyError::Io(msg) => write!(f, "{msg}"),
        }
    }
}

impl ProxyError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProxyError::NotFound)
    }
}

pub type ByteChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProxyError>> + Send + 'static>>;

/// An established download: the remote status line plus a chunk stream. The
/// stream recovers from one mid-body unexpected EOF internally (see
/// `http::download`), so a consumer sees either the complete body or an error.
pub struct Download {
    pub status: u16,
    pub content_length: Option<u64>,
    pub stream: ByteChunkStream,
}

impl Download {
    pub async fn collect(mut self) -> Result<Bytes, ProxyError> {
        let mut buffer = match self.content_length {
            Some(len) => BytesMut::with_capacity(len as usize),
            None => BytesMut::new(),
        };
        while let Some(chunk) = self.stream.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum UrlScheme {
    Http,
    Grpc { tls: bool },
    Unix,
}

fn parse_scheme(url: &url::Url) -> Result<UrlScheme, ProxyError> {
    match url.scheme() {
        "http" | "https" => Ok(UrlScheme::Http),
        "grpc" => Ok(UrlScheme::Grpc { tls: false }),
        "grpcs" => Ok(UrlScheme::Grpc { tls: true }),
        "unix" => Ok(UrlScheme::Unix),
        other => Err(ProxyError::InvalidUrl(format!("unsupported scheme {other}"))),
    }
}

/// Hook for adjusting gRPC endpoints before dialing (timeouts, TLS settings).
pub type GrpcEndpointConfigurer =
    Arc<dyn Fn(tonic::transport::Endpoint) -> tonic::transport::Endpoint + Send + Sync>;

#[derive(Clone)]
pub struct UrlProxy {
    http: reqwest::Client,
    stats: Arc<CacheStats>,
    grpc_configurer: Option<GrpcEndpointConfigurer>,
}

impl UrlProxy {
    pub fn new(http: reqwest::Client, stats: Arc<CacheStats>) -> Self {
        UrlProxy {
            http,
            stats,
            grpc_configurer: None,
        }
    }

    pub fn with_grpc_configurer(mut self, configurer: GrpcEndpointConfigurer) -> Self {
        self.grpc_configurer = Some(configurer);
        self
    }

    /// Try each URL in order and return the first successfully established
    /// download. The overall result is `NotFound` iff no URL succeeded and at
    /// least one of them failed with a not-found style error.
    pub async fn download(&self, urls: &[UrlInfo]) -> Result<Download, ProxyError> {
        if urls.is_empty() {
            return Err(ProxyError::InvalidUrl("no URLs to download from".to_owned()));
        }

        let mut saw_not_found = false;
        let mut last_error = None;
        for info in urls {
            let attempt = self.download_one(info).await;
            match attempt {
                Ok(download) => return Ok(download),
                Err(err) => {
                    tracing::debug!(url = %info.url, error = %err, "download candidate failed");
                    if err.is_not_found() {
                        saw_not_found = true;
                    }
                    last_error = Some(err);
                }
            }
        }

        if saw_not_found {
            Err(ProxyError::NotFound)
        } else {
            Err(last_error.unwrap())
        }
    }

    /// Download the whole blob into memory (used for bounded payloads such as
    /// CAS batch reads).
    pub async fn download_bytes(&self, urls: &[UrlInfo]) -> Result<Bytes, ProxyError> {
        self.download(urls).await?.collect().await
    }

    /// Probe the first HEAD-capable URL and return the remote content length.
    /// Never records transfer stats.
    pub async fn head(&self, urls: &[UrlInfo]) -> Result<u64, ProxyError> {
        let mut saw_not_found = false;
        let mut last_error = None;
        for info in urls {
            let url = url::Url::parse(&info.url)
                .map_err(|err| ProxyError::InvalidUrl(err.to_string()))?;
            if parse_scheme(&url)? != UrlScheme::Http {
                continue;
            }
            match http::head(&self.http, info).await {
                Ok(length) => return Ok(length),
                Err(err) => {
                    if err.is_not_found() {
                        saw_not_found = true;
                    }
                    last_error = Some(err);
                }
            }
        }

        if saw_not_found {
            Err(ProxyError::NotFound)
        } else {
            Err(last_error
                .unwrap_or_else(|| ProxyError::InvalidUrl("no HEAD-capable URL".to_owned())))
        }
    }

    async fn download_one(&self, info: &UrlInfo) -> Result<Download, ProxyError> {
        let url =
            url::Url::parse(&info.url).map_err(|err| ProxyError::InvalidUrl(err.to_string()))?;
        let started = Instant::now();
        match parse_scheme(&url)? {
            UrlScheme::Http => {
                http::download(&self.http, info, self.stats.clone(), started).await
            }
            UrlScheme::Grpc { tls } => {
                let channel =
                    bytestream::dial_tcp(&url, tls, self.grpc_configurer.as_ref()).await?;
                bytestream::download(channel, &url, info, self.stats.clone(), started).await
            }
            UrlScheme::Unix => {
                let channel = bytestream::dial_unix(&url, self.grpc_configurer.as_ref()).await?;
                bytestream::download(channel, &url, info, self.stats.clone(), started).await
            }
        }
    }

    /// Upload a full in-memory body. On success the outcome status is the
    /// client-facing one, with a backend 200 normalized to 201.
    pub async fn upload_bytes(
        &self,
        info: &UrlInfo,
        data: Bytes,
    ) -> Result<UploadOutcome, ProxyError> {
        let size = data.len() as u64;
        self.upload_inner(info, UploadBody::Full(data), Some(size), true)
            .await
    }

    /// Upload a streaming body. `content_length` should be supplied whenever
    /// the caller knows it: presigned PUT URLs sign the `Content-Length`.
    pub async fn upload_stream<S>(
        &self,
        info: &UrlInfo,
        stream: S,
        content_length: Option<u64>,
    ) -> Result<UploadOutcome, ProxyError>
    where
        S: Stream<Item = Result<Bytes, ProxyError>> + Send + 'static,
    {
        self.upload_inner(info, UploadBody::Stream(Box::pin(stream)), content_length, true)
            .await
    }

    /// Upload one part of a multipart session. Skips upload stats: a session
    /// is accounted once, at commit time, with its total size and duration.
    pub async fn upload_part_stream<S>(
        &self,
        info: &UrlInfo,
        stream: S,
        content_length: Option<u64>,
    ) -> Result<UploadOutcome, ProxyError>
    where
        S: Stream<Item = Result<Bytes, ProxyError>> + Send + 'static,
    {
        self.upload_inner(info, UploadBody::Stream(Box::pin(stream)), content_length, false)
            .await
    }

    async fn upload_inner(
        &self,
        info: &UrlInfo,
        body: UploadBody,
        content_length: Option<u64>,
        record_stats: bool,
    ) -> Result<UploadOutcome, ProxyError> {
        let url =
            url::Url::parse(&info.url).map_err(|err| ProxyError::InvalidUrl(err.to_string()))?;
        let started = Instant::now();
        let outcome = match parse_scheme(&url)? {
            UrlScheme::Http => http::upload(&self.http, info, body, content_length).await?,
            UrlScheme::Grpc { tls } => {
                let channel =
                    bytestream::dial_tcp(&url, tls, self.grpc_configurer.as_ref()).await?;
                bytestream::upload(channel, &url, info, body).await?
            }
            UrlScheme::Unix => {
                let channel = bytestream::dial_unix(&url, self.grpc_configurer.as_ref()).await?;
                bytestream::upload(channel, &url, info, body).await?
            }
        };
        if record_stats {
            self.stats.record_upload(outcome.bytes_sent, started.elapsed());
        }
        Ok(outcome)
    }
}

/// Result of a successful upload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UploadOutcome {
    /// Client-facing status (backend 200 normalized to 201).
    pub status: u16,
    /// ETag reported by the backend, when it sent one (multipart commits
    /// need it).
    pub etag: Option<String>,
    pub bytes_sent: u64,
}

enum UploadBody {
    Full(Bytes),
    Stream(ByteChunkStream),
}

#[cfg(test)]
mod tests;
