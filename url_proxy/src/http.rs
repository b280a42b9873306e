// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Buf;
use futures::StreamExt;
use http::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, ETAG, IF_RANGE, RANGE};
use reqwest::StatusCode;
use stats::CacheStats;
use storage::UrlInfo;

use crate::{Download, ProxyError, UploadBody, UploadOutcome};

fn header_map(info: &UrlInfo) -> Result<HeaderMap, ProxyError> {
    let mut headers = HeaderMap::with_capacity(info.extra_headers.len());
    for (name, value) in &info.extra_headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| ProxyError::InvalidUrl(format!("header name {name}: {err}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|err| ProxyError::InvalidUrl(format!("header value for {name}: {err}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

fn is_not_found_status(status: StatusCode) -> bool {
    status == StatusCode::NOT_FOUND || status == StatusCode::GONE
}

/// Whether a transport error looks like the remote end closed the stream
/// before the full body arrived.
fn is_unexpected_eof(err: &reqwest::Error) -> bool {
    let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(inner) = cause {
        if let Some(io_err) = inner.downcast_ref::<std::io::Error>() {
            if io_err.kind() == std::io::ErrorKind::UnexpectedEof {
                return true;
            }
        }
        if let Some(hyper_err) = inner.downcast_ref::<hyper::Error>() {
            if hyper_err.is_incomplete_message() {
                return true;
            }
        }
        cause = inner.source();
    }
    false
}

pub(crate) async fn download(
    client: &reqwest::Client,
    info: &UrlInfo,
    stats: Arc<CacheStats>,
    started: Instant,
) -> Result<Download, ProxyError> {
    let headers = header_map(info)?;
    let response = client
        .get(&info.url)
        .headers(headers.clone())
        .send()
        .await
        .map_err(|err| ProxyError::Io(format!("GET {}: {err}", info.url)))?;

    let status = response.status();
    if is_not_found_status(status) {
        return Err(ProxyError::NotFound);
    }
    if status.as_u16() >= 300 {
        return Err(ProxyError::Status(status.as_u16()));
    }

    let content_length = response.content_length();
    let etag = response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_owned());

    let client = client.clone();
    let url = info.url.clone();

    // One transparent recovery from a mid-body unexpected EOF: re-request the
    // remainder with a Range header, conditioned on the ETag captured from the
    // first response so a changed object cannot be stitched onto bytes already
    // delivered.
    let stream = async_stream::stream! {
        let mut response = response;
        let mut delivered: u64 = 0;
        let mut skip_remaining: u64 = 0;
        let mut retried = false;

        loop {
            match response.chunk().await {
                Ok(Some(mut chunk)) => {
                    if skip_remaining > 0 {
                        let to_skip = skip_remaining.min(chunk.len() as u64) as usize;
                        chunk.advance(to_skip);
                        skip_remaining -= to_skip as u64;
                        if chunk.is_empty() {
                            continue;
                        }
                    }
                    delivered += chunk.len() as u64;
                    yield Ok(chunk);
                }
                Ok(None) => {
                    stats.record_download(delivered, started.elapsed());
                    break;
                }
                Err(err) if !retried && is_unexpected_eof(&err) => {
                    retried = true;
                    tracing::warn!(url = %url, delivered, "unexpected EOF mid-download, retrying with Range");

                    let mut retry = client
                        .get(&url)
                        .headers(headers.clone())
                        .header(RANGE, format!("bytes={delivered}-"))
                        .header(ACCEPT_ENCODING, "identity");
                    if let Some(etag) = &etag {
                        retry = retry.header(IF_RANGE, etag.clone());
                    }

                    match retry.send().await {
                        Ok(retry_response) => match retry_response.status().as_u16() {
                            206 => {
                                response = retry_response;
                            }
                            200 => {
                                // The origin ignored the Range header; skip the
                                // bytes the consumer already has.
                                skip_remaining = delivered;
                                response = retry_response;
                            }
                            other => {
                                yield Err(ProxyError::Io(format!(
                                    "range retry for {url} returned status {other}"
                                )));
                                break;
                            }
                        },
                        Err(retry_err) => {
                            yield Err(ProxyError::Io(format!(
                                "range retry for {url}: {retry_err}"
                            )));
                            break;
                        }
                    }
                }
                Err(err) => {
                    yield Err(ProxyError::Io(format!("read from {url}: {err}")));
                    break;
                }
            }
        }
    };

    Ok(Download {
        status: status.as_u16(),
        content_length,
        stream: Box::pin(stream),
    })
}

pub(crate) async fn head(client: &reqwest::Client, info: &UrlInfo) -> Result<u64, ProxyError> {
    let headers = header_map(info)?;
    let response = client
        .head(&info.url)
        .headers(headers)
        .send()
        .await
        .map_err(|err| ProxyError::Io(format!("HEAD {}: {err}", info.url)))?;

    let status = response.status();
    if is_not_found_status(status) {
        return Err(ProxyError::NotFound);
    }
    if status.as_u16() >= 300 {
        return Err(ProxyError::Status(status.as_u16()));
    }

    let length = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .or_else(|| response.content_length())
        .unwrap_or(0);
    Ok(length)
}

pub(crate) async fn upload(
    client: &reqwest::Client,
    info: &UrlInfo,
    body: UploadBody,
    content_length: Option<u64>,
) -> Result<UploadOutcome, ProxyError> {
    let mut headers = header_map(info)?;
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
    }

    let mut request = client.put(&info.url).headers(headers);
    if let Some(length) = content_length {
        request = request.header(CONTENT_LENGTH, length);
    }

    let sent_counter = Arc::new(AtomicU64::new(0));
    let request = match body {
        UploadBody::Full(data) => {
            sent_counter.store(data.len() as u64, Ordering::Relaxed);
            request.body(data)
        }
        UploadBody::Stream(stream) => {
            let counter = sent_counter.clone();
            let counted = stream.map(move |chunk| {
                if let Ok(chunk) = &chunk {
                    counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                }
                chunk
            });
            request.body(reqwest::Body::wrap_stream(counted))
        }
    };

    let response = request
        .send()
        .await
        .map_err(|err| ProxyError::Io(format!("PUT {}: {err}", info.url)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ProxyError::Status(status.as_u16()));
    }

    let etag = response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_matches('"').to_owned());

    // Clients of the sidecar expect Created for a stored entry even when the
    // backend answers with a plain 200.
    let normalized = if status == StatusCode::OK {
        201
    } else {
        status.as_u16()
    };
    Ok(UploadOutcome {
        status: normalized,
        etag,
        bytes_sent: sent_counter.load(Ordering::Relaxed),
    })
}

#[cfg(test)]
mod tests {
    use super::is_not_found_status;
    use reqwest::StatusCode;

    #[test]
    fn not_found_statuses() {
        assert!(is_not_found_status(StatusCode::NOT_FOUND));
        assert!(is_not_found_status(StatusCode::GONE));
        assert!(!is_not_found_status(StatusCode::FORBIDDEN));
        assert!(!is_not_found_status(StatusCode::INTERNAL_SERVER_ERROR));
    }
}
