// Copyright 2024 Cirrus Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! `GET /metrics/cache` reports the stats snapshot; `DELETE /metrics/cache`
//! resets the counters and reports the post-reset snapshot. The response
//! format follows the `Accept` header: JSON, a GitHub Actions annotation
//! line, or plain text.

use std::sync::Arc;

use axum::http::header::ACCEPT;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{on, MethodFilter};
use axum::Router;
use stats::{CacheStats, Snapshot, Summary};

pub const MOUNT: &str = "/metrics/cache";

pub fn routes(stats: Arc<CacheStats>) -> Router {
    Router::new().route(
        MOUNT,
        on(MethodFilter::GET, report)
            .on(MethodFilter::DELETE, reset)
            .with_state(stats),
    )
}

async fn report(
    axum::extract::State(stats): axum::extract::State<Arc<CacheStats>>,
    headers: HeaderMap,
) -> Response {
    render(stats.snapshot(), &headers)
}

async fn reset(
    axum::extract::State(stats): axum::extract::State<Arc<CacheStats>>,
    headers: HeaderMap,
) -> Response {
    render(stats.reset(), &headers)
}

fn render(snapshot: Snapshot, headers: &HeaderMap) -> Response {
    let accept = headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let summary = snapshot.summarize();

    if accept.contains("application/json") || accept.contains("+json") {
        return Json(summary).into_response();
    }

    if accept.contains("text/vnd.github-actions") {
        if snapshot.is_idle() {
            return StatusCode::NO_CONTENT.into_response();
        }
        return github_notice(&summary).into_response();
    }

    plain_text(&summary).into_response()
}

fn github_notice(summary: &Summary) -> String {
    format!(
        "::notice title=Omni Cache::{} hits, {} misses ({:.1}% hit rate), downloaded {} in {}, uploaded {} in {}",
        summary.cache_hits,
        summary.cache_misses,
        summary.cache_hit_rate_percent,
        human_bytes(summary.downloads.bytes),
        human_duration_ms(summary.downloads.duration_ms),
        human_bytes(summary.uploads.bytes),
        human_duration_ms(summary.uploads.duration_ms),
    )
}

fn plain_text(summary: &Summary) -> String {
    format!(
        "cache hits: {}\ncache misses: {}\nhit rate: {:.1}%\n\
         downloads: {} ({}, avg {}/s)\nuploads: {} ({}, avg {}/s)\n",
        summary.cache_hits,
        summary.cache_misses,
        summary.cache_hit_rate_percent,
        summary.downloads.count,
        human_bytes(summary.downloads.bytes),
        human_bytes(summary.downloads.bytes_per_sec),
        summary.uploads.count,
        human_bytes(summary.uploads.bytes),
        human_bytes(summary.uploads.bytes_per_sec),
    )
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn human_duration_ms(ms: u64) -> String {
    if ms >= 1000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{ms}ms")
    }
}

#[cfg(test)]
mod tests {
    use super::{github_notice, human_bytes, human_duration_ms};
    use std::time::Duration;

    #[test]
    fn byte_and_duration_formatting() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.0 KiB");
        assert_eq!(human_bytes(5 * 1024 * 1024), "5.0 MiB");
        assert_eq!(human_duration_ms(250), "250ms");
        assert_eq!(human_duration_ms(2500), "2.5s");
    }

    #[test]
    fn notice_line_has_the_annotation_prefix() {
        let stats = stats::CacheStats::new();
        stats.record_hit();
        stats.record_download(1024, Duration::from_secs(1));
        let summary = stats.snapshot().summarize();
        let notice = github_notice(&summary);
        assert!(notice.starts_with("::notice title=Omni Cache::"));
        assert!(notice.contains("1 hits"));
    }
}
